//! `busrpc` Core — wire envelopes, dispatch paths, and structural error serialization.

pub mod envelope;
pub mod error;
pub mod path;

pub use envelope::{headers, MessageProperties, RequestEnvelope, ResponseEnvelope};
pub use error::SerializedError;
pub use path::DispatchPath;
