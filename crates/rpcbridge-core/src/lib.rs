//! rpcbridge - JSON-RPC transports with explicit request/response correlation.
//!
//! Two carriers connect clients to a business-logic [`Engine`]:
//!
//! - [`HttpStreamingServer`] accepts one JSON-RPC message per POST and streams
//!   the engine's replies back as Server-Sent Events, ending the response once
//!   the reply carrying the request's id has been written.
//! - [`TcpBridge`] gives every TCP connection its own engine over a pair of
//!   in-memory pipes and copies bytes in both directions.
//!
//! # Example
//!
//! ```rust,ignore
//! use rpcbridge::{engine_factory, DispatchEngine, HttpServerConfig, HttpStreamingServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> rpcbridge::Result<()> {
//!     let factory = engine_factory(|transport| DispatchEngine::new(transport, Arc::new(MyMethods)));
//!     let server = HttpStreamingServer::new(HttpServerConfig::default(), factory)?;
//!     let addr = server.start().await?;
//!     println!("listening on {}", addr);
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod message;
pub mod transport;

pub use bridge::TcpBridge;
pub use config::{BridgeConfig, HttpServerConfig, TcpBridgeConfig, TransportConfig};
pub use engine::{
    engine_factory, DispatchEngine, Engine, EngineFactory, RequestContext, RpcDispatch,
};
pub use error::{BridgeError, Result};
pub use http::HttpStreamingServer;
pub use message::{RequestId, RpcError, RpcMessage};
pub use transport::{
    InboundMessage, InitializeParams, PostOutcome, ReplySink, RequestScope, ResponseDrain,
    SharedTransport, StreamTransport, Transport,
};

/// Re-exported so engines can take a cancellation token without naming tokio-util.
pub use tokio_util::sync::CancellationToken;
