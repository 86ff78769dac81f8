//! The message-flow and link-lifecycle engine for a hosted-broker (Azure
//! Service Bus) client on top of an AMQP 1.0 transport.
//!
//! This crate is the core that sits between a generic AMQP 1.0 transport
//! ([`fe2o3-amqp`](https://docs.rs/fe2o3-amqp)) and an application that wants
//! to send and receive brokered messages on named queues and topic
//! subscriptions, including their dead-letter sub-entities. It owns:
//!
//! - a [connection pool](pool::ConnectionPool) that multiplexes many logical
//!   senders/receivers across a handful of AMQP connections under a
//!   per-connection link budget;
//! - a [credit manager](credit::CreditManager) that bounds the number of
//!   unsettled peek-locked messages an application can be holding at once;
//! - a [management request client](management::ManagementClient) for the
//!   broker's `$management` node (currently used for lock renewal);
//! - the [peek-lock message pipeline](message::ServiceBusMessage) and its
//!   [streaming](receiver::streaming) and [batch](receiver::batch) receivers;
//! - a [sender](sender::Sender) with application-level send timeouts; and
//! - [`Client`](client::Client), the entry point that ties a connection
//!   string to cached per-queue/per-topic handles.
//!
//! # Quick start
//!
//! ```no_run
//! use azservicebus::{Client, ClientOptions, ServiceBusMessage};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::from_connection_string(
//!     "Endpoint=sb://my-namespace.servicebus.windows.net/;SharedAccessKeyName=...;SharedAccessKey=...",
//!     ClientOptions::default(),
//! )?;
//!
//! let queue = client.get_queue("my-queue");
//! queue.send(&ServiceBusMessage::new(b"hello".to_vec()), None).await?;
//!
//! let batch = queue.receive_batch(10, None).await?;
//! for message in &batch {
//!     println!("received {:?}", message.body);
//! }
//!
//! client.dispose().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Out of scope
//!
//! This crate assumes a transport already providing framing, SASL,
//! session/link open-close, heartbeats, and flow-control primitives; it does
//! not implement session (group-ordered) messaging, transactional send,
//! scheduled enqueue-time delivery beyond setting the annotation, browse/peek
//! without a lock, CBS auth refresh, partitioned-entity routing awareness, or
//! deferred-message retrieval.

pub mod client;
pub mod config;
pub mod connection_string;
pub mod credit;
pub mod error;
pub mod events;
pub mod lock_token;
pub mod management;
pub mod message;
pub mod pool;
pub mod receiver;
pub mod sender;

pub use client::{Client, EntityEvent, QueueHandle, TopicHandle};
pub use config::{ClientOptions, PoolOptions, ReceiveMode, ReceiverOptions};
pub use error::{ServiceBusError, ServiceBusErrorKind};
pub use lock_token::LockToken;
pub use message::{ProcessingState, ServiceBusMessage};
pub use receiver::streaming::{ListenerEvent, MessageListener};
