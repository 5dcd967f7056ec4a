//! HTTP streaming server: JSON-RPC over POST, replies over SSE.
//!
//! One [`SharedTransport`] and one engine serve every request. Each POST gets
//! its own [`RequestScope`](crate::transport::RequestScope), and its response
//! body is that scope's SSE drain, so HTTP flow control reaches all the way
//! back to the engine's `send`.

use crate::config::{HttpServerConfig, TransportConfig};
use crate::engine::{Engine, EngineFactory};
use crate::error::{BridgeError, Result};
use crate::transport::{InitializeParams, PostOutcome, SharedTransport};
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use futures::TryStreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// State shared across request handlers.
struct HttpState {
    transport: SharedTransport,
}

/// Build the router serving `config.rpc_path`.
///
/// Non-POST requests get 405, POSTs to any other path get 404. Bodies larger
/// than `config.max_body_bytes` are refused with 413 before any parsing.
/// `config` must have passed [`HttpServerConfig::validate`].
pub fn router(transport: SharedTransport, config: &HttpServerConfig) -> Router {
    let state = Arc::new(HttpState { transport });

    Router::new()
        .route(&config.rpc_path, post(handle_post))
        .fallback(handle_unrouted)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_post(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    let scope = state.transport.create_request_scope();

    match scope.accept(&body).await {
        Ok(PostOutcome::Accepted) => {
            debug!("Accepted message without correlation target");
            (
                StatusCode::ACCEPTED,
                [(header::CONTENT_TYPE, TransportConfig::SSE_CONTENT_TYPE)],
            )
                .into_response()
        }
        Ok(PostOutcome::Streaming(drain)) => {
            let pending = drain.pending().clone();
            debug!("Streaming response for request {}", pending);
            let frames = drain.into_stream().inspect_err(move |e| {
                warn!("SSE stream for request {} failed: {}", pending, e);
            });
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, TransportConfig::SSE_CONTENT_TYPE),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(frames),
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn handle_unrouted(method: Method) -> StatusCode {
    if method != Method::POST {
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        StatusCode::NOT_FOUND
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        warn!("Request failed: {}", self);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

/// HTTP server binding one shared transport to one engine.
pub struct HttpStreamingServer {
    config: HttpServerConfig,
    transport: SharedTransport,
    engine: Arc<dyn Engine>,
    started: AtomicBool,
    running: Arc<AtomicBool>,
    local_addr: OnceLock<SocketAddr>,
    listener_stop: CancellationToken,
    engine_stop: CancellationToken,
    tasks: TaskTracker,
}

impl HttpStreamingServer {
    /// Create the server and build its engine over a fresh shared transport.
    pub fn new(config: HttpServerConfig, factory: EngineFactory) -> Result<Self> {
        config.validate()?;
        let transport = SharedTransport::new(config.response_timeout);
        let engine = factory(Arc::new(transport.clone()));

        Ok(Self {
            config,
            transport,
            engine,
            started: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: OnceLock::new(),
            listener_stop: CancellationToken::new(),
            engine_stop: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Bind the listener and start serving in background tasks.
    ///
    /// Returns the bound address (useful when the configured port is 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::Lifecycle("server already started".to_string()));
        }
        if self.transport.is_disposed() {
            return Err(BridgeError::Lifecycle("server has been shut down".to_string()));
        }

        let bound = async {
            let listener = TcpListener::bind(self.config.bind).await?;
            let addr = listener.local_addr()?;
            Ok::<_, BridgeError>((listener, addr))
        };
        let (listener, addr) = match bound.await {
            Ok(bound) => bound,
            Err(e) => {
                // Nothing was spawned yet, so a later start may retry.
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let _ = self.local_addr.set(addr);

        debug!("Starting engine...");
        let engine = self.engine.clone();
        let engine_stop = self.engine_stop.clone();
        self.tasks.spawn(async move {
            if let Err(e) = engine.run(engine_stop).await {
                warn!("Engine stopped with error: {}", e);
            }
        });

        let app = router(self.transport.clone(), &self.config);
        let stop = self.listener_stop.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        info!(
            "Streamable HTTP server listening on {}{}",
            addr, self.config.rpc_path
        );

        self.tasks.spawn(async move {
            let shutdown = async move { stop.cancelled().await };
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await;
            running.store(false, Ordering::SeqCst);
            match result {
                Ok(()) => info!("HTTP server stopped"),
                Err(e) => error!("HTTP server error: {}", e),
            }
        });

        Ok(addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Shared transport the engine reads from.
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Parameters of the first `initialize` request seen by this server.
    pub fn initialize_request(&self) -> Option<&InitializeParams> {
        self.transport.initialize_request()
    }

    /// Stop accepting connections. In-flight requests run to completion.
    pub fn stop(&self) {
        if !self.listener_stop.is_cancelled() {
            info!("Stopping HTTP server...");
            self.listener_stop.cancel();
        }
    }

    /// Stop, cancel in-flight requests, dispose the engine, and wait for every
    /// background task to finish.
    pub async fn shutdown(&self) {
        debug!("Disposing HTTP server...");
        self.stop();
        self.transport.dispose();
        self.engine_stop.cancel();
        self.engine.dispose().await;
        self.tasks.close();
        self.tasks.wait().await;
    }
}
