//! Settlement context passed to delivery handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::connection::{Delivery, LinkRef};
use crate::error::{AmqpError, Result};
use crate::protocol::{ErrorCondition, Modified, Outcome};

/// Lets a handler settle the delivery it was given.
///
/// `DeliveryContext` is `Clone`; clones share the settled flag, so a
/// delivery is disposed at most once whichever clone settles it.
#[derive(Clone)]
pub struct DeliveryContext {
    link: LinkRef,
    delivery_id: u32,
    presettled: bool,
    settled: Arc<AtomicBool>,
}

impl DeliveryContext {
    pub(crate) fn new(link: LinkRef, delivery: &Delivery) -> Self {
        Self {
            link,
            delivery_id: delivery.id,
            presettled: delivery.settled,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn delivery_id(&self) -> u32 {
        self.delivery_id
    }

    /// True once an outcome was sent, or if the sender settled up front.
    #[inline]
    pub fn is_settled(&self) -> bool {
        self.presettled || self.settled.load(Ordering::Acquire)
    }

    /// Send `outcome` for this delivery.
    pub async fn settle(&self, outcome: Outcome) -> Result<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(AmqpError::InvalidState(format!(
                "delivery {} already settled",
                self.delivery_id
            )));
        }
        if self.presettled {
            return Ok(());
        }
        self.link.dispose(self.delivery_id, outcome).await
    }

    pub async fn accept(&self) -> Result<()> {
        self.settle(Outcome::Accepted).await
    }

    pub async fn reject(&self, error: Option<ErrorCondition>) -> Result<()> {
        self.settle(Outcome::Rejected(error)).await
    }

    pub async fn release(&self) -> Result<()> {
        self.settle(Outcome::Released).await
    }

    pub async fn modify(&self, modified: Modified) -> Result<()> {
        self.settle(Outcome::Modified(modified)).await
    }
}

impl std::fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("delivery_id", &self.delivery_id)
            .field("settled", &self.is_settled())
            .finish()
    }
}
