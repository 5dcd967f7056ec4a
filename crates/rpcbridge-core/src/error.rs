//! Error types for the bridge transports.
//!
//! Errors fall into four families: protocol errors (malformed inbound
//! messages), unsupported operations (server-initiated requests over a carrier
//! that cannot carry them), transport I/O failures, and lifecycle misuse.
//! Protocol and I/O errors stay scoped to the request or connection they occur
//! in; the other two are contract violations reported straight to the caller.

use std::time::Duration;
use thiserror::Error;

/// Main error type for rpcbridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Protocol errors
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Channel closed: {0}")]
    Closed(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("No correlated response within {0:?}")]
    Timeout(Duration),

    // Lifecycle errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BridgeError {
    /// Create a protocol error without an underlying serde cause.
    pub fn protocol(message: impl Into<String>) -> Self {
        BridgeError::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// - -32700: Parse error
    /// - -32601: Method not found (unsupported operation)
    /// - -32603: Internal error
    /// - -32000: Transport failure (I/O, closed channel, timeout)
    /// - -32004: Cancelled
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            BridgeError::Protocol { .. } => -32700,
            BridgeError::UnsupportedOperation(_) => -32601,
            BridgeError::Io { .. } | BridgeError::Closed(_) | BridgeError::Timeout(_) => -32000,
            BridgeError::Cancelled => -32004,
            BridgeError::Lifecycle(_) | BridgeError::Config { .. } => -32603,
        }
    }

    /// Whether the error is confined to the single request or connection it
    /// happened on.
    pub fn is_scoped(&self) -> bool {
        matches!(
            self,
            BridgeError::Protocol { .. }
                | BridgeError::Io { .. }
                | BridgeError::Closed(_)
                | BridgeError::Cancelled
                | BridgeError::Timeout(_)
        )
    }
}
