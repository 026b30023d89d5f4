//! Structural error serialization for failure envelopes.
//!
//! Raised errors must cross the wire as plain JSON, never as a
//! language-native error value. [`SerializedError`] is the stable shape:
//! a `name`, a human-readable `message`, an optional string-valued `stack`
//! (the rendered source chain), and arbitrary extra string-keyed JSON
//! properties flattened alongside them.

use std::error::Error as StdError;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-safe representation of a raised error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    /// Error class name, e.g. `Error` or `HandlerNotFoundError`.
    pub name: String,
    /// Top-level error message.
    pub message: String,
    /// Rendered source chain, one cause per line. Always string-valued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Additional enumerable properties carried by the original error.
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl SerializedError {
    /// Creates an error with a name and message and no extra detail.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            properties: Map::new(),
        }
    }

    /// Attaches an extra property, flattened into the wire object.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Converts any error chain into its structural representation.
    ///
    /// The top-level display becomes `message`; if the error has sources,
    /// the whole chain is rendered into `stack`, outermost first.
    #[must_use]
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let message = err.to_string();

        let mut chain = Vec::new();
        let mut cursor: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(current) = cursor {
            chain.push(current.to_string());
            cursor = current.source();
        }

        let stack = if chain.len() > 1 {
            Some(chain.join("\n"))
        } else {
            None
        };

        Self {
            name: "Error".to_string(),
            message,
            stack,
            properties: Map::new(),
        }
    }

    /// Renames the error, keeping message and properties intact.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}
