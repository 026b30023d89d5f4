//! In-process [`Broker`] implementation with real topic-exchange semantics.
//!
//! Backs the integration tests and single-process deployments: wildcard
//! routing (`*` one segment, `#` zero or more trailing segments), single
//! consumer per queue with a backlog for pre-consume publishes, and manual
//! acknowledgment with requeue-on-channel-close, so at-least-once delivery
//! behaves the way a real broker's would.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use busrpc_core::MessageProperties;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Broker, BrokerChannel, BrokerError, Delivery};

/// A message at rest in a queue, before (re)delivery assigns it a tag.
#[derive(Debug, Clone)]
struct QueuedMessage {
    routing_key: String,
    body: Bytes,
    properties: MessageProperties,
}

struct ConsumerHandle {
    channel_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Queue {
    consumer: Mutex<Option<ConsumerHandle>>,
    backlog: Mutex<VecDeque<QueuedMessage>>,
}

#[derive(Default)]
struct Exchange {
    /// `(pattern, queue name)` pairs, in binding order.
    bindings: Mutex<Vec<(String, String)>>,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    message: QueuedMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: DashMap<String, Arc<Exchange>>,
    queues: DashMap<String, Arc<Queue>>,
    unacked: Mutex<HashMap<u64, Unacked>>,
    next_tag: AtomicU64,
    next_channel_id: AtomicU64,
}

impl BrokerState {
    /// Hands a message to the queue's consumer, or parks it in the backlog.
    fn enqueue(&self, queue_name: &str, queue: &Queue, message: QueuedMessage) {
        let consumer = queue.consumer.lock();
        match consumer.as_ref() {
            Some(handle) => self.deliver(queue_name, handle, message),
            None => queue.backlog.lock().push_back(message),
        }
    }

    /// Assigns a tag, records the delivery as unacked, and sends it.
    ///
    /// Caller holds the queue's consumer lock, so delivery order per queue
    /// is stable. A dead receiver returns the message to the backlog via
    /// the unacked requeue path on channel close.
    fn deliver(&self, queue_name: &str, handle: &ConsumerHandle, message: QueuedMessage) {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        let delivery = Delivery {
            delivery_tag: tag,
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            properties: message.properties.clone(),
        };
        self.unacked.lock().insert(
            tag,
            Unacked {
                queue: queue_name.to_string(),
                channel_id: handle.channel_id,
                message,
            },
        );
        // Receiver dropped without close(): the entry stays unacked until
        // the channel is closed, same as an abandoned AMQP consumer.
        let _ = handle.tx.send(delivery);
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// In-memory topic broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Creates a broker with no exchanges or queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deliveries handed out but not yet acknowledged.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.state.unacked.lock().len()
    }

    /// Number of messages parked in a queue's backlog, if the queue exists.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state
            .queues
            .get(queue)
            .map(|q| q.backlog.lock().len())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let id = self.state.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

struct MemoryChannel {
    state: Arc<BrokerState>,
    id: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_exchange(&self, name: &str, _durable: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Exchange::default()));
        Ok(())
    }

    async fn assert_queue(&self, name: &str) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };
        self.state
            .queues
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Queue::default()));
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if !self.state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue {
                name: queue.to_string(),
            });
        }
        let Some(exchange) = self.state.exchanges.get(exchange) else {
            return Err(BrokerError::UnknownExchange {
                name: exchange.to_string(),
            });
        };

        let binding = (pattern.to_string(), queue.to_string());
        let mut bindings = exchange.bindings.lock();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        self.ensure_open()?;
        let Some(entry) = self.state.queues.get(queue) else {
            return Err(BrokerError::UnknownQueue {
                name: queue.to_string(),
            });
        };
        let q = Arc::clone(entry.value());
        drop(entry);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConsumerHandle {
            channel_id: self.id,
            tx,
        };

        let mut consumer = q.consumer.lock();
        if consumer.is_some() {
            return Err(BrokerError::ConsumerConflict {
                name: queue.to_string(),
            });
        }

        // Flush messages that arrived before the consumer, in order, while
        // still holding the consumer lock so publishes cannot interleave.
        let parked: Vec<QueuedMessage> = q.backlog.lock().drain(..).collect();
        for message in parked {
            self.state.deliver(queue, &handle, message);
        }
        *consumer = Some(handle);

        Ok(rx)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let Some(exchange) = self.state.exchanges.get(exchange) else {
            return Err(BrokerError::UnknownExchange {
                name: exchange.to_string(),
            });
        };

        let targets: HashSet<String> = exchange
            .bindings
            .lock()
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, routing_key))
            .map(|(_, queue)| queue.clone())
            .collect();
        drop(exchange);

        let message = QueuedMessage {
            routing_key: routing_key.to_string(),
            body: Bytes::from(body),
            properties,
        };

        // Unroutable messages are dropped, as with a non-mandatory publish.
        for name in targets {
            if let Some(queue) = self.state.queues.get(&name) {
                self.state.enqueue(&name, &queue, message.clone());
            }
        }
        Ok(())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let Some(entry) = self.state.queues.get(queue) else {
            return Err(BrokerError::UnknownQueue {
                name: queue.to_string(),
            });
        };
        let message = QueuedMessage {
            routing_key: queue.to_string(),
            body: Bytes::from(body),
            properties,
        };
        self.state.enqueue(queue, &entry, message);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut unacked = self.state.unacked.lock();
        match unacked.get(&delivery_tag) {
            Some(entry) if entry.channel_id == self.id => {
                unacked.remove(&delivery_tag);
                Ok(())
            }
            _ => Err(BrokerError::UnknownDeliveryTag { tag: delivery_tag }),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Cancel this channel's consumers.
        for entry in self.state.queues.iter() {
            let mut consumer = entry.consumer.lock();
            if consumer
                .as_ref()
                .is_some_and(|handle| handle.channel_id == self.id)
            {
                *consumer = None;
            }
        }

        // Requeue this channel's unacked deliveries for redelivery.
        let requeued: Vec<(String, QueuedMessage)> = {
            let mut unacked = self.state.unacked.lock();
            let tags: Vec<u64> = unacked
                .iter()
                .filter(|(_, entry)| entry.channel_id == self.id)
                .map(|(tag, _)| *tag)
                .collect();
            tags.into_iter()
                .filter_map(|tag| unacked.remove(&tag))
                .map(|entry| (entry.queue, entry.message))
                .collect()
        };
        for (queue_name, message) in requeued {
            if let Some(queue) = self.state.queues.get(&queue_name) {
                self.state.enqueue(&queue_name, &queue, message);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Topic matching
// ---------------------------------------------------------------------------

/// AMQP topic matching: `*` matches exactly one segment, `#` matches zero
/// or more segments.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_at(&pattern, &key)
}

fn matches_at(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_at(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches_at(rest, &key[1..]),
        Some((&segment, rest)) => {
            !key.is_empty() && key[0] == segment && matches_at(rest, &key[1..])
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_matching_wildcards() {
        assert!(topic_matches("fpp.math.#", "fpp.math.add"));
        assert!(topic_matches("fpp.math.#", "fpp.math.vector.dot"));
        assert!(topic_matches("fpp.math.#", "fpp.math"));
        assert!(!topic_matches("fpp.math.#", "fpp.physics.add"));

        assert!(topic_matches("fpp.*.add", "fpp.math.add"));
        assert!(!topic_matches("fpp.*.add", "fpp.math.vector.add"));
        assert!(!topic_matches("fpp.*", "fpp"));

        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("fpp.math.add", "fpp.math.add"));
        assert!(!topic_matches("fpp.math.add", "fpp.math"));
    }

    fn empty_message() -> (Vec<u8>, MessageProperties) {
        (b"[]".to_vec(), MessageProperties::default())
    }

    async fn bound_channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let ch = broker.channel().await.unwrap();
        ch.assert_exchange("fpp", false).await.unwrap();
        let q = ch.assert_queue("fpp.math.#").await.unwrap();
        ch.bind_queue(&q, "fpp", "fpp.math.#").await.unwrap();
        ch
    }

    #[tokio::test]
    async fn publish_routes_to_matching_queue() {
        let broker = MemoryBroker::new();
        let ch = bound_channel(&broker).await;
        let mut rx = ch.consume("fpp.math.#").await.unwrap();

        let (body, props) = empty_message();
        ch.publish("fpp", "fpp.math.add", body, props).await.unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.routing_key, "fpp.math.add");
        assert_eq!(&delivery.body[..], b"[]");
        assert_eq!(broker.unacked_count(), 1);

        ch.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn non_matching_routing_key_is_not_delivered() {
        let broker = MemoryBroker::new();
        let ch = bound_channel(&broker).await;
        let mut rx = ch.consume("fpp.math.#").await.unwrap();

        let (body, props) = empty_message();
        ch.publish("fpp", "fpp.physics.sim", body, props)
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn backlog_flushes_to_late_consumer_in_order() {
        let broker = MemoryBroker::new();
        let ch = bound_channel(&broker).await;

        for i in 0..3 {
            ch.publish(
                "fpp",
                &format!("fpp.math.op{i}"),
                b"[]".to_vec(),
                MessageProperties::default(),
            )
            .await
            .unwrap();
        }
        assert_eq!(broker.queue_depth("fpp.math.#"), Some(3));

        let mut rx = ch.consume("fpp.math.#").await.unwrap();
        for i in 0..3 {
            let delivery = rx.recv().await.unwrap();
            assert_eq!(delivery.routing_key, format!("fpp.math.op{i}"));
        }
        assert_eq!(broker.queue_depth("fpp.math.#"), Some(0));
    }

    #[tokio::test]
    async fn second_consumer_on_a_queue_conflicts() {
        let broker = MemoryBroker::new();
        let ch = bound_channel(&broker).await;
        let _rx = ch.consume("fpp.math.#").await.unwrap();

        let err = ch.consume("fpp.math.#").await.unwrap_err();
        assert!(matches!(err, BrokerError::ConsumerConflict { .. }));
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let ch = bound_channel(&broker).await;
        let mut rx = ch.consume("fpp.math.#").await.unwrap();

        let (body, props) = empty_message();
        ch.publish("fpp", "fpp.math.add", body, props).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(broker.unacked_count(), 1);

        // Close without acking: the message must become redeliverable.
        ch.close().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("fpp.math.#"), Some(1));

        let ch2 = broker.channel().await.unwrap();
        let mut rx2 = ch2.consume("fpp.math.#").await.unwrap();
        let redelivered = rx2.recv().await.unwrap();
        assert_eq!(redelivered.routing_key, "fpp.math.add");
        // A redelivery gets a fresh tag.
        assert_ne!(redelivered.delivery_tag, delivery.delivery_tag);
    }

    #[tokio::test]
    async fn operations_on_a_closed_channel_fail() {
        let broker = MemoryBroker::new();
        let ch = broker.channel().await.unwrap();
        ch.close().await.unwrap();

        let err = ch.assert_exchange("fpp", false).await.unwrap_err();
        assert!(matches!(err, BrokerError::ChannelClosed));
    }

    #[tokio::test]
    async fn ack_from_the_wrong_channel_is_rejected() {
        let broker = MemoryBroker::new();
        let ch = bound_channel(&broker).await;
        let mut rx = ch.consume("fpp.math.#").await.unwrap();

        let (body, props) = empty_message();
        ch.publish("fpp", "fpp.math.add", body, props).await.unwrap();
        let delivery = rx.recv().await.unwrap();

        let other = broker.channel().await.unwrap();
        let err = other.ack(delivery.delivery_tag).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownDeliveryTag { .. }));
    }

    #[tokio::test]
    async fn double_ack_is_rejected() {
        let broker = MemoryBroker::new();
        let ch = bound_channel(&broker).await;
        let mut rx = ch.consume("fpp.math.#").await.unwrap();

        let (body, props) = empty_message();
        ch.publish("fpp", "fpp.math.add", body, props).await.unwrap();
        let delivery = rx.recv().await.unwrap();

        ch.ack(delivery.delivery_tag).await.unwrap();
        let err = ch.ack(delivery.delivery_tag).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownDeliveryTag { .. }));
    }

    #[tokio::test]
    async fn empty_queue_name_generates_a_unique_one() {
        let broker = MemoryBroker::new();
        let ch = broker.channel().await.unwrap();

        let a = ch.assert_queue("").await.unwrap();
        let b = ch.assert_queue("").await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("amq.gen-"));
    }

    #[tokio::test]
    async fn send_to_unknown_queue_is_an_error() {
        let broker = MemoryBroker::new();
        let ch = broker.channel().await.unwrap();

        let err = ch
            .send_to_queue("nowhere", b"[]".to_vec(), MessageProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownQueue { .. }));
    }

    #[tokio::test]
    async fn fanout_to_multiple_matching_bindings() {
        let broker = MemoryBroker::new();
        let ch = broker.channel().await.unwrap();
        ch.assert_exchange("fpp", false).await.unwrap();
        let q1 = ch.assert_queue("audit").await.unwrap();
        let q2 = ch.assert_queue("work").await.unwrap();
        ch.bind_queue(&q1, "fpp", "fpp.#").await.unwrap();
        ch.bind_queue(&q2, "fpp", "fpp.math.*").await.unwrap();

        ch.publish(
            "fpp",
            "fpp.math.add",
            b"[]".to_vec(),
            MessageProperties::default(),
        )
        .await
        .unwrap();

        assert_eq!(broker.queue_depth("audit"), Some(1));
        assert_eq!(broker.queue_depth("work"), Some(1));
    }
}
