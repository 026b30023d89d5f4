//! Service: the request/reply dispatch pipeline.
//!
//! 1. **Tree** (`tree`): nested handler definition, flattened at startup
//! 2. **Resolution** (`resolve`): dot-path -> callable lookup
//! 3. **Context** (`context`): task-local transaction scope per invocation
//! 4. **Dispatch** (`dispatch`): invocation + error normalization
//! 5. **Subscriptions** (this module): per-service topic bindings, the
//!    manual-ack consume loop, and reply correlation

pub mod config;
pub mod context;
pub mod dispatch;
pub mod resolve;
pub mod tree;

// Re-export key types for convenient access.
pub use config::{ServiceConfig, DEFAULT_NAMESPACE};
pub use context::{current_transaction_id, with_transaction};
pub use dispatch::DispatchError;
pub use resolve::{resolve, HandlerNotFound};
pub use tree::{handler, sync_handler, HandlerFn, HandlerNode, HandlerResult, HandlerTree};

use std::sync::Arc;

use busrpc_core::{DispatchPath, ResponseEnvelope};
use futures_util::future::select_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerChannel, BrokerError, Delivery};

// ---------------------------------------------------------------------------
// ListenTarget
// ---------------------------------------------------------------------------

/// Which services to subscribe: everything, one name, or a set of names.
#[derive(Debug, Clone, Default)]
pub enum ListenTarget {
    /// Every top-level service name in the handler tree.
    #[default]
    All,
    One(String),
    Many(Vec<String>),
}

impl From<&str> for ListenTarget {
    fn from(name: &str) -> Self {
        Self::One(name.to_string())
    }
}

impl From<String> for ListenTarget {
    fn from(name: String) -> Self {
        Self::One(name)
    }
}

impl From<Vec<String>> for ListenTarget {
    fn from(names: Vec<String>) -> Self {
        Self::Many(names)
    }
}

impl From<Vec<&str>> for ListenTarget {
    fn from(names: Vec<&str>) -> Self {
        Self::Many(names.into_iter().map(str::to_string).collect())
    }
}

/// Errors that settle a `listen` call.
///
/// Only subscription setup can fail a listen; per-message failures become
/// failure envelopes and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("broker setup failed for service {name}")]
    Setup {
        name: String,
        #[source]
        source: BrokerError,
    },
    #[error("listen task for service {name} failed")]
    TaskFailed { name: String },
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// A provider process's RPC surface: a flattened handler tree bound to a
/// broker namespace.
///
/// Cheap to clone; clones share the tree and broker handle. The tree is
/// flattened once at construction and read-only afterwards, so concurrent
/// dispatches share it without locking.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    tree: HandlerTree,
    broker: Arc<dyn Broker>,
    config: ServiceConfig,
}

impl Service {
    /// Builds a service from a (possibly nested) handler definition.
    ///
    /// The definition is flattened (§`tree::HandlerTree::flatten`) before
    /// any listening begins.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, definition: HandlerTree) -> Self {
        Self::with_config(broker, definition, ServiceConfig::default())
    }

    /// Like [`Self::new`] with an explicit namespace configuration.
    #[must_use]
    pub fn with_config(
        broker: Arc<dyn Broker>,
        definition: HandlerTree,
        config: ServiceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                tree: definition.flatten(),
                broker,
                config,
            }),
        }
    }

    /// Top-level service names, i.e. the listenable subset of the tree.
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        self.inner.tree.keys().map(str::to_string).collect()
    }

    /// Resolves and invokes the callable a routing key points at.
    ///
    /// The leading namespace segment is stripped; the rest is resolved
    /// against the flattened tree and invoked inside a transaction scope
    /// carrying `transaction_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`]: an unresolvable path, a handler error or
    /// panic, all normalized into data. Never crashes the caller.
    pub async fn dispatch(
        &self,
        routing_key: &str,
        transaction_id: Option<String>,
        args: Vec<Value>,
    ) -> Result<Value, DispatchError> {
        let path = DispatchPath::parse(routing_key);
        let handler = resolve(&self.inner.tree, &path)?.clone();
        dispatch::invoke(handler, transaction_id, args).await
    }

    /// Subscribes to one or more services and consumes requests forever.
    ///
    /// Each service gets its own channel, queue (bound with
    /// `<namespace>.<name>.#`), and independent task, so one service's
    /// setup failure neither blocks nor kills the others. Healthy
    /// subscriptions never settle; this future resolves only when a
    /// subscription fails to set up (or the target list is empty).
    ///
    /// # Errors
    ///
    /// Returns the first [`ListenError`] any subscription settles with.
    pub async fn listen(&self, target: impl Into<ListenTarget>) -> Result<(), ListenError> {
        let names = match target.into() {
            ListenTarget::One(name) => return self.listen_service(name).await,
            ListenTarget::Many(names) => names,
            ListenTarget::All => self.service_names(),
        };
        if names.is_empty() {
            return Ok(());
        }

        let mut task_names = Vec::with_capacity(names.len());
        let mut tasks = Vec::with_capacity(names.len());
        for name in names {
            let service = self.clone();
            task_names.push(name.clone());
            tasks.push(tokio::spawn(
                async move { service.listen_service(name).await },
            ));
        }

        // A healthy subscription never settles, so the first task to settle
        // is reporting a failure. The sibling tasks stay spawned and keep
        // consuming.
        let (settled, index, _remaining) = select_all(tasks).await;
        match settled {
            Ok(result) => result,
            Err(_) => Err(ListenError::TaskFailed {
                name: task_names[index].clone(),
            }),
        }
    }

    /// Sets up and drives the consume loop for one named service.
    async fn listen_service(&self, name: String) -> Result<(), ListenError> {
        let namespace = self.inner.config.namespace.as_str();
        let pattern = format!("{namespace}.{name}.#");

        let channel = match self.inner.broker.channel().await {
            Ok(channel) => channel,
            Err(source) => {
                error!(service = %name, error = %source, "failed to open broker channel");
                return Err(ListenError::Setup { name, source });
            }
        };

        // Bracketed acquisition: the channel is released if any further
        // setup step fails, and again when the consume loop ends.
        let mut deliveries = match bind_and_consume(channel.as_ref(), namespace, &pattern).await {
            Ok(rx) => rx,
            Err(source) => {
                error!(service = %name, error = %source, "failed to set up subscription");
                let _ = channel.close().await;
                return Err(ListenError::Setup { name, source });
            }
        };

        info!(service = %name, %pattern, "listening on service");

        while let Some(delivery) = deliveries.recv().await {
            let service = self.clone();
            let channel = Arc::clone(&channel);
            // One task per message: a slow handler never blocks the next
            // delivery, and replies may complete out of arrival order.
            tokio::spawn(async move {
                service.handle_delivery(channel, delivery).await;
            });
        }

        // The consumer stream only ends when the broker goes away.
        let _ = channel.close().await;
        Ok(())
    }

    /// Full per-message pipeline:
    /// received -> dispatching -> succeeded|failed -> replied -> acknowledged.
    async fn handle_delivery(&self, channel: Arc<dyn BrokerChannel>, delivery: Delivery) {
        let Delivery {
            delivery_tag,
            routing_key,
            body,
            properties,
        } = delivery;
        let reply_to = properties.reply_to.clone();
        let correlation_id = properties.correlation_id.clone();
        let transaction_id = properties.transaction_id();

        let outcome = match serde_json::from_slice::<Vec<Value>>(&body) {
            Ok(args) => self.dispatch(&routing_key, transaction_id.clone(), args).await,
            Err(source) => Err(DispatchError::InvalidBody { source }),
        };

        let envelope = match outcome {
            Ok(value) => ResponseEnvelope::success(correlation_id, transaction_id, value),
            Err(err) => {
                debug!(%routing_key, error = %err, "dispatch failed");
                ResponseEnvelope::failure(correlation_id, transaction_id, &err.to_serialized())
            }
        };

        // Reply strictly before ack: once a reply exists the message must
        // never be redelivered; a crash before the ack leaves it
        // redeliverable instead.
        if let Some(reply_to) = reply_to {
            match envelope.into_wire() {
                Ok((reply_body, reply_props)) => {
                    if let Err(err) = channel.send_to_queue(&reply_to, reply_body, reply_props).await
                    {
                        warn!(%routing_key, %reply_to, error = %err, "failed to publish reply");
                    }
                }
                Err(err) => warn!(%routing_key, error = %err, "failed to encode reply body"),
            }
        } else {
            warn!(%routing_key, "message has no replyTo; skipping reply");
        }

        if let Err(err) = channel.ack(delivery_tag).await {
            warn!(%routing_key, delivery_tag, error = %err, "failed to acknowledge message");
        }
    }
}

/// Exchange, queue, binding, consumer — in declaration order.
async fn bind_and_consume(
    channel: &dyn BrokerChannel,
    namespace: &str,
    pattern: &str,
) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
    channel.assert_exchange(namespace, false).await?;
    let queue = channel.assert_queue(pattern).await?;
    channel.bind_queue(&queue, namespace, pattern).await?;
    channel.consume(&queue).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
