//! MQ error taxonomy

use thiserror::Error;

/// Error kinds shared by the client façade, the transport adapters and the
/// handler pipeline.
///
/// Construction-time and publish-time errors are returned synchronously to
/// the caller; subscribe-loop errors are logged and handled internally
/// (retried, turned into a nak, or routed to the dead-letter topic) and
/// never surface here.
#[derive(Debug, Error)]
pub enum MqError {
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    #[error("mq is closed")]
    Closed,

    #[error("operation not supported by this transport: {operation}")]
    NotSupported { operation: String },

    #[error("transport failure: {message}")]
    TransportFailure { message: String },

    #[error("handler failure: {message}")]
    HandlerFailure { message: String },

    #[error("panic recovered")]
    PanicRecovered,

    #[error("subscription closed")]
    SubscriptionClosed,

    #[error("context cancelled")]
    ContextCancelled,
}

impl MqError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
        }
    }

    pub fn transport_failure(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
        }
    }

    pub fn handler_failure(message: impl Into<String>) -> Self {
        Self::HandlerFailure {
            message: message.into(),
        }
    }
}
