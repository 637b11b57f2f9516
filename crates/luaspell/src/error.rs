//! Error taxonomy for the luaspell library.
//!
//! Every fallible operation returns [`EngineError`]. Each variant maps to
//! exactly one [`ErrorKind`] so callers can match on the kind tag without
//! inspecting messages:
//!
//! | kind | produced by |
//! |---|---|
//! | `Syntax` | parse/compile failure |
//! | `Runtime` | script raised an error, or the VM faulted |
//! | `Timeout` | execution deadline exceeded |
//! | `Cancelled` | explicit cancellation |
//! | `Resource` | pool exhausted, coroutine cap, channel cap |
//! | `Validation` | bridge argument check, unknown handle, bad input |
//! | `Closed` | operation after shutdown |
//!
//! Serialized with an internally-tagged `"type"` discriminator so JSON
//! consumers can switch on `error.type` without a wrapper object.

use serde::{Deserialize, Serialize};

/// Machine-matchable category of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Syntax,
    Runtime,
    Timeout,
    Cancelled,
    Resource,
    Validation,
    Closed,
}

/// Structured error produced by any engine operation.
///
/// # Examples (JSON)
/// ```json
/// {"type":"Syntax","message":"unexpected symbol near ')'","line":1}
/// {"type":"Runtime","message":"attempt to index a nil value","traceback":""}
/// {"type":"Timeout","limit_ms":5000}
/// {"type":"Cancelled"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type")]
pub enum EngineError {
    /// The script source could not be parsed or compiled.
    #[error("syntax error: {message}")]
    Syntax {
        /// Human-readable description of the parse error.
        message: String,
        /// 1-based line number of the error, or 0 if unknown.
        line: u32,
    },

    /// The script raised an error, or the language runtime faulted.
    #[error("runtime error: {message}")]
    Runtime {
        /// The error message (e.g. `"attempt to index a nil value"`).
        message: String,
        /// Interpreter-formatted traceback, or empty if unavailable.
        traceback: String,
    },

    /// Execution exceeded its deadline.
    #[error("execution timed out after {limit_ms} ms")]
    Timeout {
        /// The deadline that was exceeded, in milliseconds.
        limit_ms: u64,
    },

    /// The caller explicitly cancelled the operation.
    #[error("execution cancelled")]
    Cancelled,

    /// A bounded resource (pool, coroutines, channels) is exhausted.
    /// The caller may retry with backoff.
    #[error("resource exhausted: {message}")]
    Resource { message: String },

    /// Input failed validation before execution (bridge argument check,
    /// unknown handle, malformed request).
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// The component has been shut down and rejects new work.
    #[error("{component} is closed")]
    Closed { component: String },
}

impl EngineError {
    /// Returns the machine-matchable kind tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Syntax { .. } => ErrorKind::Syntax,
            EngineError::Runtime { .. } => ErrorKind::Runtime,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Resource { .. } => ErrorKind::Resource,
            EngineError::Validation { .. } => ErrorKind::Validation,
            EngineError::Closed { .. } => ErrorKind::Closed,
        }
    }

    /// Shorthand for a [`EngineError::Runtime`] without a traceback.
    pub fn runtime(message: impl Into<String>) -> Self {
        EngineError::Runtime {
            message: message.into(),
            traceback: String::new(),
        }
    }

    /// Shorthand for a [`EngineError::Resource`].
    pub fn resource(message: impl Into<String>) -> Self {
        EngineError::Resource {
            message: message.into(),
        }
    }

    /// Shorthand for a [`EngineError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a [`EngineError::Closed`].
    pub fn closed(component: impl Into<String>) -> Self {
        EngineError::Closed {
            component: component.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    // ── kind() mapping ────────────────────────────────────────────────────────

    #[test]
    fn test_kind_covers_all_variants() {
        let cases: Vec<(EngineError, ErrorKind)> = vec![
            (
                EngineError::Syntax {
                    message: "x".into(),
                    line: 1,
                },
                ErrorKind::Syntax,
            ),
            (EngineError::runtime("boom"), ErrorKind::Runtime),
            (EngineError::Timeout { limit_ms: 100 }, ErrorKind::Timeout),
            (EngineError::Cancelled, ErrorKind::Cancelled),
            (EngineError::resource("pool"), ErrorKind::Resource),
            (EngineError::validation("bad arg"), ErrorKind::Validation),
            (EngineError::closed("engine"), ErrorKind::Closed),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind, "wrong kind for {err:?}");
        }
    }

    // ── serde round-trips ─────────────────────────────────────────────────────

    #[test]
    fn test_syntax_error_round_trip() {
        let err = EngineError::Syntax {
            message: "unexpected symbol".to_string(),
            line: 3,
        };
        let json = serde_json::to_string(&err).expect("serialize Syntax");
        assert!(
            json.contains(r#""type":"Syntax""#),
            "JSON should carry the type discriminator: {json}"
        );
        assert!(json.contains(r#""line":3"#));
        let back: EngineError = serde_json::from_str(&json).expect("deserialize Syntax");
        assert_eq!(back, err);
    }

    #[test]
    fn test_timeout_error_round_trip() {
        let err = EngineError::Timeout { limit_ms: 5000 };
        let json = serde_json::to_string(&err).expect("serialize Timeout");
        assert!(json.contains(r#""type":"Timeout""#));
        assert!(json.contains(r#""limit_ms":5000"#));
        let back: EngineError = serde_json::from_str(&json).expect("deserialize Timeout");
        assert_eq!(back, err);
    }

    #[test]
    fn test_cancelled_distinct_from_timeout() {
        // Callers must be able to tell explicit cancellation from deadline
        // expiry; the two must never collapse into one kind.
        assert_ne!(ErrorKind::Cancelled, ErrorKind::Timeout);
        assert_eq!(EngineError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            EngineError::Timeout { limit_ms: 1 }.kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_display_messages() {
        let err = EngineError::closed("channel manager");
        assert_eq!(err.to_string(), "channel manager is closed");
        let err = EngineError::resource("max coroutines exceeded");
        assert_eq!(err.to_string(), "resource exhausted: max coroutines exceeded");
    }
}
