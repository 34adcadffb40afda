//! Error types for the transport.

use thiserror::Error;

/// Result type alias using [`TransportError`].
pub type Result<T> = std::result::Result<T, TransportError>;

/// Faults that end a sampling run.
///
/// None of these reach the external controller; they are logged and
/// turned into [`RunningState::Error`](crate::RunningState::Error).
#[derive(Error, Debug)]
pub enum TransportError {
    /// The background sampling thread could not be launched.
    #[error("Failed to spawn sampling thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// A record could not be encoded.
    #[error("Encoding error: {0}")]
    Encode(String),

    /// A provider or sink panicked inside the tick body.
    #[error("Tick aborted by panic: {0}")]
    Panic(String),
}

impl TransportError {
    /// Build a panic error from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panic(message)
    }
}

/// Failure to read one metric field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    /// The field does not exist on this platform.
    #[error("unsupported on this platform")]
    Unsupported,

    /// The field exists but has no value right now.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operating system refused or failed the read.
    #[error("OS error: {0}")]
    Os(String),
}

/// Errors reported by a [`ByteSink`](crate::ByteSink).
#[derive(Error, Debug)]
pub enum SinkError {
    /// The sink rejected this record as malformed. The loop moves on.
    #[error("Record rejected by sink: {0}")]
    Rejected(String),

    /// The record did not fit into its emission buffer.
    #[error("Buffer overflow: capacity {capacity} bytes, needed {needed} bytes")]
    Overflow { capacity: usize, needed: usize },

    /// The sink is closed and accepts no more records.
    #[error("Sink closed")]
    Closed,

    /// I/O error while writing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other sink failure.
    #[error("{0}")]
    Other(String),
}

impl SinkError {
    /// Create a rejection error.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Create a generic sink error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_messages() {
        let err = TransportError::from_panic(Box::new("boom"));
        assert!(matches!(err, TransportError::Panic(ref m) if m == "boom"));

        let err = TransportError::from_panic(Box::new(String::from("owned boom")));
        assert!(matches!(err, TransportError::Panic(ref m) if m == "owned boom"));

        let err = TransportError::from_panic(Box::new(42u32));
        assert!(matches!(err, TransportError::Panic(ref m) if m.contains("non-string")));
    }

    #[test]
    fn test_overflow_display() {
        let err = SinkError::Overflow {
            capacity: 8,
            needed: 12,
        };
        assert_eq!(
            err.to_string(),
            "Buffer overflow: capacity 8 bytes, needed 12 bytes"
        );
    }
}
