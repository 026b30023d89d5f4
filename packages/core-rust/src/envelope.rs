//! Wire envelopes and message properties for the request/reply exchange.
//!
//! On the broker transport the request body is a bare JSON array of
//! positional arguments; the routing key, correlation id, reply queue, and
//! transaction id ride in message metadata and properties. The HTTP binding
//! instead carries the whole [`RequestEnvelope`] as the POST body. All wire
//! structs use `#[serde(rename_all = "camelCase")]` to keep the JSON field
//! names stable across bindings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SerializedError;

/// Well-known header keys carried in [`MessageProperties::headers`].
pub mod headers {
    /// Opaque per-request identifier scoping one invocation's execution.
    pub const TRANSACTION_ID: &str = "transactionId";
    /// Boolean outcome flag set on every response message.
    pub const SUCCESS: &str = "success";
}

// ---------------------------------------------------------------------------
// MessageProperties
// ---------------------------------------------------------------------------

/// AMQP-style property bag attached to a published message.
///
/// `reply_to` and `correlation_id` are first-class properties; everything
/// else (the transaction id, the success flag) travels in the free-form
/// `headers` map as JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProperties {
    /// Caller-specified destination queue for the reply, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Opaque token echoed back so the caller can match the reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Free-form string-keyed headers.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub headers: Map<String, Value>,
}

impl MessageProperties {
    /// Reads the `transactionId` header, if present and string-valued.
    #[must_use]
    pub fn transaction_id(&self) -> Option<String> {
        self.headers
            .get(headers::TRANSACTION_ID)
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    /// Reads the `success` header, if present and boolean-valued.
    #[must_use]
    pub fn success(&self) -> Option<bool> {
        self.headers.get(headers::SUCCESS).and_then(Value::as_bool)
    }
}

// ---------------------------------------------------------------------------
// RequestEnvelope
// ---------------------------------------------------------------------------

/// Logical inbound request: routing key, transaction id, positional args.
///
/// This is the literal POST body of the HTTP binding. On the broker
/// transport the same three pieces arrive split across the delivery's
/// routing key, the `transactionId` header, and the JSON-array body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Full dispatch path, e.g. `fpp.math.add`.
    pub routing_key: String,
    /// Opaque per-request identifier; absent for untraced callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Positional arguments passed through to the handler.
    #[serde(default)]
    pub args: Vec<Value>,
}

// ---------------------------------------------------------------------------
// ResponseEnvelope
// ---------------------------------------------------------------------------

/// Logical reply to one request: outcome flag, echoed ids, JSON body.
///
/// On the broker wire this splits apart again: `body` is serialized as the
/// message payload, `correlation_id` becomes a message property, and
/// `success` / `transaction_id` become headers. [`Self::into_wire`]
/// performs that split.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    /// Echo of the caller-supplied correlation token.
    pub correlation_id: Option<String>,
    /// Whether the dispatch succeeded.
    pub success: bool,
    /// Echo of the inbound transaction id.
    pub transaction_id: Option<String>,
    /// Handler return value on success, [`SerializedError`] JSON on failure.
    pub body: Value,
}

impl ResponseEnvelope {
    /// Builds a success envelope around a handler's return value.
    #[must_use]
    pub fn success(
        correlation_id: Option<String>,
        transaction_id: Option<String>,
        body: Value,
    ) -> Self {
        Self {
            correlation_id,
            success: true,
            transaction_id,
            body,
        }
    }

    /// Builds a failure envelope around a structurally serialized error.
    ///
    /// The error is converted to plain JSON here so a failure envelope can
    /// never smuggle a non-serializable value onto the wire.
    #[must_use]
    pub fn failure(
        correlation_id: Option<String>,
        transaction_id: Option<String>,
        error: &SerializedError,
    ) -> Self {
        Self {
            correlation_id,
            success: false,
            transaction_id,
            body: serde_json::to_value(error).unwrap_or_else(|_| {
                // SerializedError only holds strings and JSON values, so
                // this branch is unreachable in practice.
                Value::String(error.message.clone())
            }),
        }
    }

    /// Splits the envelope into a message payload and its properties.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be rendered as JSON bytes.
    pub fn into_wire(self) -> Result<(Vec<u8>, MessageProperties), serde_json::Error> {
        let mut hdrs = Map::new();
        hdrs.insert(headers::SUCCESS.to_string(), Value::Bool(self.success));
        if let Some(txn) = &self.transaction_id {
            hdrs.insert(
                headers::TRANSACTION_ID.to_string(),
                Value::String(txn.clone()),
            );
        }

        let props = MessageProperties {
            reply_to: None,
            correlation_id: self.correlation_id,
            headers: hdrs,
        };

        Ok((serde_json::to_vec(&self.body)?, props))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
