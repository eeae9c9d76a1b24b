//! Function bus for pipewright.
//!
//! The engine talks to the external function runner and the service desk
//! through topics. Outbound messages are written to the store's outbox in
//! the same transaction as the state that produced them and published by a
//! [`Relay`]; inbound messages are parked in the inbox before handling so
//! [`ConsumerPool::recover`] can replay them after a crash. A
//! [`HealthProber`] pauses consumption while collaborators are down.

mod consumer;
mod error;
mod health;
#[cfg(feature = "kafka")]
mod kafka;
mod message;
mod relay;
mod transport;

pub use consumer::{ConsumerPool, FUNCTION_RESULT_PREFIX, Inbox, MessageHandler, RUN_TASK_PREFIX};
pub use error::{BusError, Result};
pub use health::{ConsumerGate, GateChange, HealthProber, HttpPinger, Pinger, StorePinger};
#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
pub use message::{FunctionReply, FunctionRequest, RunTaskMessage, SdEvent, Topics};
pub use relay::Relay;
pub use transport::{Delivery, Envelope, MemoryTransport, Subscription, Transport};
