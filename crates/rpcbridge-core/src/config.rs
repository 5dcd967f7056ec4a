//! Centralized configuration for rpcbridge.
//!
//! Compile-time constants live on the unit structs; the runtime structs carry
//! the values a host application chooses (bind addresses, RPC path, bounds).

use crate::error::{BridgeError, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Queueing and framing constants shared by the transports.
pub struct TransportConfig;

impl TransportConfig {
    /// Capacity of the shared inbound hand-off to the engine.
    pub const INBOUND_CHANNEL_CAPACITY: usize = 1;
    /// Capacity of each per-request outbound channel.
    pub const OUTBOUND_CHANNEL_CAPACITY: usize = 1;
    pub const SSE_EVENT_PREFIX: &'static [u8] = b"event: message\r\ndata: ";
    pub const SSE_EVENT_SUFFIX: &'static [u8] = b"\r\n\r\n";
    pub const SSE_CONTENT_TYPE: &'static str = "text/event-stream";
    pub const INITIALIZE_METHOD: &'static str = "initialize";
    /// Largest newline-delimited message the stream transport accepts.
    pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024; // 10MB
}

/// TCP bridge constants.
pub struct BridgeConfig;

impl BridgeConfig {
    pub const COPY_CHUNK_SIZE: usize = 8192;
    pub const PIPE_CAPACITY: usize = 64 * 1024;
    pub const LISTEN_BACKLOG: u32 = 1024;
}

/// Runtime configuration for the HTTP streaming server.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind: SocketAddr,
    /// Path POSTs must target, e.g. `/mcp`.
    pub rpc_path: String,
    /// Upper bound on the wait for a request's correlated response.
    /// `None` streams progress events for as long as the engine keeps going.
    pub response_timeout: Option<Duration>,
    pub max_body_bytes: usize,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            rpc_path: "/mcp".to_string(),
            response_timeout: None,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

impl HttpServerConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.rpc_path.starts_with('/') {
            return Err(BridgeError::Config {
                message: format!("rpc path must start with '/': {:?}", self.rpc_path),
            });
        }
        // The path is matched literally; router capture syntax is not allowed.
        if let Some(c) = self
            .rpc_path
            .chars()
            .find(|c| matches!(c, ':' | '*' | '{' | '}'))
        {
            return Err(BridgeError::Config {
                message: format!("rpc path may not contain {:?}: {:?}", c, self.rpc_path),
            });
        }
        if self.response_timeout == Some(Duration::ZERO) {
            return Err(BridgeError::Config {
                message: "response timeout must be non-zero".to_string(),
            });
        }
        if self.max_body_bytes == 0 {
            return Err(BridgeError::Config {
                message: "max body size must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Runtime configuration for the TCP duplex bridge.
#[derive(Debug, Clone)]
pub struct TcpBridgeConfig {
    pub bind: SocketAddr,
    pub copy_chunk_size: usize,
    pub pipe_capacity: usize,
}

impl Default for TcpBridgeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8081)),
            copy_chunk_size: BridgeConfig::COPY_CHUNK_SIZE,
            pipe_capacity: BridgeConfig::PIPE_CAPACITY,
        }
    }
}

impl TcpBridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.copy_chunk_size == 0 || self.pipe_capacity == 0 {
            return Err(BridgeError::Config {
                message: "copy chunk size and pipe capacity must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(HttpServerConfig::default().validate().is_ok());
        assert!(TcpBridgeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rpc_path_must_be_absolute() {
        let config = HttpServerConfig {
            rpc_path: "mcp".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BridgeError::Config { .. })));
    }

    #[test]
    fn test_rpc_path_rejects_capture_syntax() {
        for path in ["/:name", "/*", "/*rest", "/{id}", "/mcp/}"] {
            let config = HttpServerConfig {
                rpc_path: path.to_string(),
                ..Default::default()
            };
            assert!(
                matches!(config.validate(), Err(BridgeError::Config { .. })),
                "accepted {:?}",
                path
            );
        }

        let nested = HttpServerConfig {
            rpc_path: "/api/v1/mcp".to_string(),
            ..Default::default()
        };
        assert!(nested.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = HttpServerConfig {
            response_timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_chunk_rejected() {
        let config = TcpBridgeConfig {
            copy_chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
