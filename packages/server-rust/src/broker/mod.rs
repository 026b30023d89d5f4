//! Broker boundary: the seam between the dispatcher and the message broker.
//!
//! The dispatcher only needs the topic-exchange primitives an AMQP-style
//! broker exposes: assert an exchange, assert and bind a queue, consume
//! with manual acknowledgment, publish, ack. [`Broker`] and
//! [`BrokerChannel`] capture exactly that surface so the core can run over
//! a real broker client or over the in-process [`MemoryBroker`] used in
//! tests and single-process deployments.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use busrpc_core::MessageProperties;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use memory::MemoryBroker;

/// One message handed to a consumer, pending acknowledgment.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag identifying this delivery for `ack`.
    pub delivery_tag: u64,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw message payload.
    pub body: Bytes,
    /// Message properties (replyTo, correlationId, headers).
    pub properties: MessageProperties,
}

/// Errors surfaced by the broker boundary.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("exchange {name} does not exist")]
    UnknownExchange { name: String },
    #[error("queue {name} does not exist")]
    UnknownQueue { name: String },
    #[error("queue {name} already has a consumer")]
    ConsumerConflict { name: String },
    #[error("unknown delivery tag {tag}")]
    UnknownDeliveryTag { tag: u64 },
    #[error("channel is closed")]
    ChannelClosed,
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

/// A connection-level handle that can open scoped channels.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a channel. Channels own their consumers: closing a channel
    /// cancels its consumers and requeues its unacknowledged deliveries.
    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// One broker channel: the unit of consumer and acknowledgment ownership.
///
/// All methods fail with [`BrokerError::ChannelClosed`] after `close`.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a topic exchange, idempotently.
    async fn assert_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    /// Declares a queue, idempotently. An empty name asks the broker to
    /// generate one. Returns the actual queue name.
    async fn assert_queue(&self, name: &str) -> Result<String, BrokerError>;

    /// Binds a queue to a topic exchange with a routing pattern
    /// (`*` = one segment, `#` = zero or more trailing segments).
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError>;

    /// Starts consuming a queue with manual acknowledgment. At most one
    /// consumer per queue; deliveries stay unacknowledged until `ack`.
    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError>;

    /// Publishes to an exchange; the routing key selects matching bindings.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Publishes directly to a named queue (reply-to delivery).
    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Acknowledges one delivery by tag. Acknowledged is terminal: the
    /// broker will not redeliver an acked message.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Closes the channel, cancelling consumers and requeueing unacked
    /// deliveries. Idempotent.
    async fn close(&self) -> Result<(), BrokerError>;
}
