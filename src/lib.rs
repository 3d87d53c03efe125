//! # amqpwire
//!
//! An AMQP 1.0 client protocol engine on tokio.
//!
//! ## Architecture
//!
//! - **Codec**: the AMQP type system (primitives, described and compound
//!   values) to and from bytes
//! - **Protocol**: frames, performatives, delivery states and messages
//! - **Engine**: sans-io connection, session and link state machines
//! - **Connection**: a pump task per connection that owns the engine and
//!   serves application handles over channels
//! - **Transport**: TCP, TLS and WebSocket byte streams behind one trait
//!
//! ## Example
//!
//! ```ignore
//! use amqpwire::{Connection, ConnectionOptions, Message};
//!
//! #[tokio::main]
//! async fn main() -> amqpwire::Result<()> {
//!     let connection = Connection::open("amqp://localhost", ConnectionOptions::default()).await?;
//!     let session = connection.begin_session().await?;
//!     let sender = session.attach_sender("sender-1", "queue-a").await?;
//!
//!     let outcome = sender.send(&Message::data("hello")).await?;
//!     println!("peer said {}", outcome.name());
//!
//!     connection.close().await
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod control;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;
pub mod writer;

mod engine;

pub use connection::{
    Connection, ConnectionOptions, CreditMode, Delivery, LinkOptions, Receiver, Sender, Session,
    SessionOptions,
};
pub use control::SaslProfile;
pub use error::{AmqpError, Result};
pub use handler::{handler_fn, DeliveryContext, DeliveryHandler};
pub use protocol::{ErrorCondition, Message, Modified, Outcome, Source, Target};
pub use transport::{Address, TransportConnector, TransportRegistry};
