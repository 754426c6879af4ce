//! Error types for the call side of the engine.

use std::fmt;

use weft_wire::Value;

/// Error resolving an outgoing call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// The peer's provider reported a failure for this call.
    Remote(Value),
    /// The call resolved to a stream which then terminated with an error.
    Stream(Value),
    /// The engine went away before a response arrived.
    Disconnected,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Remote(v) => write!(f, "remote error: {v:?}"),
            CallError::Stream(v) => write!(f, "result stream errored: {v:?}"),
            CallError::Disconnected => write!(f, "engine disconnected before response"),
        }
    }
}

impl std::error::Error for CallError {}
