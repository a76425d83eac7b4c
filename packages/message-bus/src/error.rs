//! Structured error types for the bus and the outbox.
//!
//! `BusError` provides pattern-matchable errors instead of a bare `anyhow::Error`.
//! `HandlerFailure` is the isolated, non-fatal record of an event handler that
//! failed while its siblings kept running.
//!
//! # The Error Boundary Rule
//!
//! Handlers and repositories return `anyhow::Result`. It is ergonomic inside a
//! handler and lets repositories wrap whatever their driver returns. Everything
//! the engine hands back to a caller is a `BusError`, with the original
//! `anyhow::Error` kept as the source.
//!
//! # Example
//!
//! ```ignore
//! match bus.handle(AnyMessage::command(cmd), &mut ctx).await {
//!     Ok(dispatched) => { /* ... */ }
//!     Err(BusError::NoHandlerRegistered { message_type }) => {
//!         eprintln!("nobody handles {}", message_type);
//!     }
//!     Err(BusError::HandlerFailed { handler, source, .. }) => {
//!         eprintln!("{} failed: {:#}", handler, source);
//!     }
//!     Err(other) => eprintln!("{}", other),
//! }
//! ```

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::core::MessageKind;

/// Errors surfaced by the dispatch engine and the outbox coordinator.
#[derive(Debug, Error)]
pub enum BusError {
    /// A command was dispatched but no handler is registered for its type.
    ///
    /// Fatal to that dispatch; never retried automatically.
    #[error("no handler registered for command type {message_type}")]
    NoHandlerRegistered {
        /// The command's message type identifier.
        message_type: String,
    },

    /// A handler returned an error or panicked.
    #[error("handler {handler} failed for {message_type}: {source}")]
    HandlerFailed {
        /// Message type being handled.
        message_type: String,
        /// Type name of the failing handler.
        handler: &'static str,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// A message reached a handler registered for a different type (internal error).
    #[error("message type mismatch: expected {expected}, got {actual}")]
    MessageTypeMismatch {
        /// Expected type name.
        expected: &'static str,
        /// Actual message type identifier.
        actual: &'static str,
    },

    /// The outbox repository failed. Record state is left unchanged.
    #[error("outbox persistence failed: {0}")]
    Persistence(#[source] anyhow::Error),

    /// `processed_at` may only be set once.
    #[error("outbox record {id} was already processed")]
    AlreadyProcessed {
        /// The record id.
        id: Uuid,
    },

    /// No deserializer is registered for a type tag.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// A stored record's envelope disagrees with the kind its type is registered as.
    #[error("{message_type} is registered as a {registered} but was stored as {stored}")]
    EnvelopeMismatch {
        /// The record's message type identifier.
        message_type: String,
        /// Kind the codec registered the type under.
        registered: MessageKind,
        /// Kind recorded in the outbox envelope.
        stored: MessageKind,
    },

    /// A message could not be converted to or from its payload.
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A batch stopped before reaching this message.
    #[error("not attempted: batch stopped before {message_type}")]
    NotAttempted {
        /// The skipped message's type identifier.
        message_type: String,
    },

    /// An outbox write was attempted without an open transaction.
    #[error("no open transaction for outbox write")]
    MissingTransaction,
}

impl BusError {
    /// Returns true for [`BusError::NoHandlerRegistered`].
    pub fn is_no_handler(&self) -> bool {
        matches!(self, BusError::NoHandlerRegistered { .. })
    }

    /// Returns true for [`BusError::HandlerFailed`].
    pub fn is_handler_failure(&self) -> bool {
        matches!(self, BusError::HandlerFailed { .. })
    }

    /// Returns true for [`BusError::Persistence`].
    pub fn is_persistence(&self) -> bool {
        matches!(self, BusError::Persistence(_))
    }

    pub(crate) fn handler_failed(
        message_type: impl Into<String>,
        handler: &'static str,
        source: anyhow::Error,
    ) -> Self {
        BusError::HandlerFailed {
            message_type: message_type.into(),
            handler,
            source,
        }
    }
}

/// An event handler failure that was isolated from its siblings.
///
/// Event fan-out never aborts on one subscriber's error. The failure is logged
/// and collected here so the caller can still see it.
#[derive(Debug)]
pub struct HandlerFailure {
    /// Event type being handled.
    pub message_type: &'static str,
    /// Type name of the failing handler.
    pub handler: &'static str,
    /// The underlying error.
    pub error: anyhow::Error,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler {} failed for {}: {}",
            self.handler, self.message_type, self.error
        )
    }
}

impl From<HandlerFailure> for BusError {
    fn from(failure: HandlerFailure) -> Self {
        BusError::handler_failed(failure.message_type, failure.handler, failure.error)
    }
}

/// Extract a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_handler_registered_display() {
        let err = BusError::NoHandlerRegistered {
            message_type: "PlaceOrder".into(),
        };
        assert!(err.to_string().contains("no handler registered"));
        assert!(err.to_string().contains("PlaceOrder"));
        assert!(err.is_no_handler());
        assert!(!err.is_handler_failure());
    }

    #[test]
    fn test_handler_failed_keeps_source() {
        let err = BusError::handler_failed(
            "PlaceOrder",
            "PlaceOrderHandler",
            anyhow::anyhow!("out of stock"),
        );

        assert!(err.is_handler_failure());
        assert!(err.to_string().contains("PlaceOrderHandler"));
        assert!(err.to_string().contains("out of stock"));

        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("out of stock"));
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err = BusError::AlreadyProcessed { id: Uuid::nil() };

        match &err {
            BusError::AlreadyProcessed { id } => assert!(id.is_nil()),
            _ => panic!("Expected AlreadyProcessed"),
        }
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = BusError::NoHandlerRegistered {
            message_type: "PlaceOrder".into(),
        }
        .into();

        let bus_err = err.downcast_ref::<BusError>();
        assert!(matches!(
            bus_err,
            Some(BusError::NoHandlerRegistered { message_type }) if message_type == "PlaceOrder"
        ));
    }

    #[test]
    fn test_persistence_error() {
        let err = BusError::Persistence(anyhow::anyhow!("connection reset"));
        assert!(err.is_persistence());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_handler_failure_into_bus_error() {
        let failure = HandlerFailure {
            message_type: "OrderPlaced",
            handler: "SendReceipt",
            error: anyhow::anyhow!("smtp down"),
        };
        assert!(failure.to_string().contains("SendReceipt"));

        let err: BusError = failure.into();
        match err {
            BusError::HandlerFailed {
                message_type,
                handler,
                ..
            } => {
                assert_eq!(message_type, "OrderPlaced");
                assert_eq!(handler, "SendReceipt");
            }
            other => panic!("Expected HandlerFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
