//! Delivery handlers.
//!
//! [`Receiver::spawn_handler`](crate::connection::Receiver::spawn_handler)
//! feeds every delivery of a link to a [`DeliveryHandler`], each on its own
//! task. At most `max_concurrent_handlers` run at once; while all permits
//! are taken the loop stops receiving, and the link's credit bounds what
//! the peer can push meanwhile.
//!
//! A handler settles through its [`DeliveryContext`]. If it returns without
//! settling, the delivery is accepted on `Ok` and rejected on `Err`.
//!
//! # Example
//!
//! ```ignore
//! use amqpwire::handler::handler_fn;
//!
//! let task = receiver.spawn_handler(50, handler_fn(|delivery, ctx| async move {
//!     match delivery.message.body_str() {
//!         Some(_) => ctx.accept().await,
//!         None => ctx.release().await,
//!     }
//! }));
//! ```

mod context;

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::connection::{Delivery, Receiver};
use crate::error::{AmqpError, Result};

pub use context::DeliveryContext;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Processes incoming deliveries.
pub trait DeliveryHandler: Send + Sync + 'static {
    fn call(&self, delivery: Delivery, ctx: DeliveryContext) -> BoxFuture<'static, HandlerResult>;
}

/// Adapter turning an async closure into a [`DeliveryHandler`].
pub struct FnHandler<F, Fut> {
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Delivery, DeliveryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> DeliveryHandler for FnHandler<F, Fut>
where
    F: Fn(Delivery, DeliveryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, delivery: Delivery, ctx: DeliveryContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(delivery, ctx))
    }
}

/// Wrap a closure as a handler.
pub fn handler_fn<F, Fut>(handler: F) -> FnHandler<F, Fut>
where
    F: Fn(Delivery, DeliveryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler::new(handler)
}

/// Errors that end the receive loop. Anything else came from a single
/// undecodable message, which `recv` has already rejected.
fn ends_link(error: &AmqpError) -> bool {
    matches!(
        error,
        AmqpError::LinkDetached(_) | AmqpError::SessionEnded(_) | AmqpError::ConnectionClosed(_)
    )
}

pub(crate) fn spawn<H>(mut receiver: Receiver, credit: u32, handler: H) -> JoinHandle<Result<()>>
where
    H: DeliveryHandler,
{
    let handler = Arc::new(handler);
    let semaphore = Arc::new(Semaphore::new(receiver.link().max_concurrent_handlers()));

    tokio::spawn(async move {
        if credit > 0 {
            receiver.add_credit(credit).await?;
        }

        loop {
            let delivery = match receiver.recv().await {
                Ok(delivery) => delivery,
                Err(
                    AmqpError::LinkDetached(None)
                    | AmqpError::SessionEnded(None)
                    | AmqpError::ConnectionClosed(None),
                ) => {
                    debug!(link = receiver.name(), "handler loop finished");
                    return Ok(());
                }
                Err(e) if ends_link(&e) => return Err(e),
                Err(e) => {
                    debug!(link = receiver.name(), error = %e, "skipping undecodable delivery");
                    continue;
                }
            };

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| AmqpError::InvalidState("handler semaphore closed".into()))?;

            let ctx = DeliveryContext::new(receiver.link().clone(), &delivery);
            let fut = handler.call(delivery, ctx.clone());

            tokio::spawn(async move {
                // Permit is held until this task completes
                let _permit = permit;

                let result = fut.await;
                if ctx.is_settled() {
                    if let Err(e) = result {
                        error!("Handler error for delivery {}: {}", ctx.delivery_id(), e);
                    }
                    return;
                }
                let settled = match result {
                    Ok(()) => ctx.accept().await,
                    Err(e) => {
                        error!("Handler error for delivery {}: {}", ctx.delivery_id(), e);
                        ctx.reject(Some(e.to_condition())).await
                    }
                };
                if let Err(e) = settled {
                    debug!(delivery_id = ctx.delivery_id(), error = %e, "could not settle delivery");
                }
            });
        }
    })
}
