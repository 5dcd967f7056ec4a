//! Engine contract and a dispatch-table engine built on it.
//!
//! The carriers know nothing about RPC methods. They build an engine through
//! an [`EngineFactory`], hand it a [`Transport`], run it, and dispose it when
//! the carrier goes away.

use crate::error::Result;
use crate::message::{RequestId, RpcError, RpcMessage};
use crate::transport::{ReplySink, Transport};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Business logic bound to one transport.
#[async_trait::async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Serve inbound messages until the transport closes or `cancel` fires.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;

    /// Release resources. Must tolerate repeated calls.
    async fn dispose(&self) {}
}

/// Builds an engine for a transport.
pub type EngineFactory = Arc<dyn Fn(Arc<dyn Transport>) -> Arc<dyn Engine> + Send + Sync>;

/// Wrap a closure as an [`EngineFactory`].
pub fn engine_factory<F, E>(build: F) -> EngineFactory
where
    F: Fn(Arc<dyn Transport>) -> E + Send + Sync + 'static,
    E: Engine,
{
    Arc::new(move |transport: Arc<dyn Transport>| {
        Arc::new(build(transport)) as Arc<dyn Engine>
    })
}

/// Per-request view handed to [`RpcDispatch::dispatch`].
pub struct RequestContext {
    pub id: RequestId,
    reply: ReplySink,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Send a notification ahead of the final response, e.g. progress.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.reply
            .send(RpcMessage::notification(method, Some(params)))
            .await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Trait for dispatching method calls to application logic.
#[async_trait::async_trait]
pub trait RpcDispatch: Send + Sync + 'static {
    /// Handle a request and produce its result.
    async fn dispatch(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, RpcError>;

    /// Handle a notification. Nothing is sent back.
    async fn notify(&self, method: &str, _params: Value) {
        debug!("Ignoring notification {}", method);
    }
}

/// Engine that answers each request through an [`RpcDispatch`].
///
/// Requests are served concurrently, each on its own tracked task, so one slow
/// method does not hold up the inbound channel.
pub struct DispatchEngine<D> {
    transport: Arc<dyn Transport>,
    dispatch: Arc<D>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl<D: RpcDispatch> DispatchEngine<D> {
    pub fn new(transport: Arc<dyn Transport>, dispatch: Arc<D>) -> Self {
        Self {
            transport,
            dispatch,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    async fn handle_request(
        dispatch: Arc<D>,
        id: RequestId,
        method: String,
        params: Value,
        reply: ReplySink,
        cancel: CancellationToken,
    ) {
        let ctx = RequestContext {
            id: id.clone(),
            reply: reply.clone(),
            cancel: cancel.clone(),
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = dispatch.dispatch(&ctx, &method, params) => result,
        };

        if let Err(e) = &result {
            debug!("Method {} failed: {}", method, e.message);
        }

        if id.is_unset() {
            return;
        }

        if let Err(e) = reply.send(RpcMessage::Response { id, result }).await {
            warn!("Failed to deliver response for {}: {}", method, e);
        }
    }
}

#[async_trait::async_trait]
impl<D: RpcDispatch> Engine for DispatchEngine<D> {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let cancel = cancel.child_token();
        let stop = self.shutdown.clone();

        loop {
            let inbound = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = stop.cancelled() => break,
                inbound = self.transport.receive() => inbound,
            };
            let Some(inbound) = inbound else {
                debug!("Transport closed; engine stopping");
                break;
            };

            let (message, reply) = inbound.into_parts();
            match message {
                RpcMessage::Request { id, method, params } => {
                    let dispatch = self.dispatch.clone();
                    let params = params.unwrap_or(Value::Object(Default::default()));
                    self.tasks.spawn(Self::handle_request(
                        dispatch,
                        id,
                        method,
                        params,
                        reply,
                        cancel.clone(),
                    ));
                }
                RpcMessage::Notification { method, params } => {
                    self.dispatch
                        .notify(&method, params.unwrap_or(Value::Null))
                        .await;
                }
                RpcMessage::Response { id, .. } => {
                    debug!("Ignoring unsolicited response {}", id);
                }
            }
        }

        // In-flight handlers finish unless the engine is disposed meanwhile.
        self.tasks.close();
        tokio::select! {
            _ = self.tasks.wait() => {}
            _ = stop.cancelled() => {
                cancel.cancel();
                self.tasks.wait().await;
            }
        }
        Ok(())
    }

    async fn dispose(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
