//! Invocation and dispatch-level error normalization.
//!
//! Every failure mode of a dispatch — unresolvable path, handler error,
//! handler panic, undecodable request body — is converted into a
//! [`DispatchError`] here. Nothing at this layer retries, and nothing is
//! allowed to crash the listener; errors become data for the failure
//! envelope.

use busrpc_core::SerializedError;
use serde_json::Value;

use super::context::with_transaction;
use super::resolve::HandlerNotFound;
use super::tree::HandlerFn;

/// The one dispatch-level error family, distinct from handler-raised errors
/// only in the `NotFound` case; everything else wraps what the handler did.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The dispatch path does not resolve to a callable.
    #[error(transparent)]
    NotFound(#[from] HandlerNotFound),
    /// The handler settled with an error.
    #[error("{0}")]
    Handler(anyhow::Error),
    /// The handler panicked; the panic was contained to its own task.
    #[error("handler panicked: {message}")]
    Panicked { message: String },
    /// The request body was not a JSON array of arguments.
    #[error("invalid request body: {source}")]
    InvalidBody {
        #[source]
        source: serde_json::Error,
    },
}

impl DispatchError {
    /// Structural representation for the failure envelope.
    #[must_use]
    pub fn to_serialized(&self) -> SerializedError {
        match self {
            Self::NotFound(err) => SerializedError::new("HandlerNotFoundError", err.to_string())
                .with_property("serviceName", err.service_name.clone())
                .with_property("functionName", err.function_name.clone()),
            Self::Handler(err) => {
                let mut serialized = SerializedError::new("Error", err.to_string());
                let chain: Vec<String> = err.chain().map(ToString::to_string).collect();
                if chain.len() > 1 {
                    serialized.stack = Some(chain.join("\n"));
                }
                serialized
            }
            Self::Panicked { .. } | Self::InvalidBody { .. } => {
                SerializedError::new("Error", self.to_string())
            }
        }
    }
}

/// Invokes a resolved callable with its transaction scope.
///
/// The invocation runs in its own spawned task so that a panicking handler
/// is caught as a task failure instead of unwinding the consume loop, and
/// so the transaction scope is anchored to exactly one task.
pub(crate) async fn invoke(
    handler: HandlerFn,
    transaction_id: Option<String>,
    args: Vec<Value>,
) -> Result<Value, DispatchError> {
    let task = tokio::spawn(with_transaction(transaction_id, async move {
        handler(args).await
    }));

    match task.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(DispatchError::Handler(err)),
        Err(join_err) => {
            let message = if join_err.is_panic() {
                let payload = join_err.into_panic();
                payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic payload".to_string())
            } else {
                "handler task was cancelled".to_string()
            };
            Err(DispatchError::Panicked { message })
        }
    }
}
