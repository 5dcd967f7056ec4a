//! The single logical connection an HTTP-hosted engine observes.
//!
//! Every POST gets its own [`RequestScope`], but all of them funnel their
//! inbound message through one bounded hand-off of capacity 1. A slow engine
//! therefore throttles every concurrent POST equally; nothing is dropped.

use super::request::RequestScope;
use super::{InboundMessage, Transport};
use crate::config::TransportConfig;
use crate::error::{BridgeError, Result};
use crate::message::RpcMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Parameters of the first `initialize` request, kept for management code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

struct SharedInner {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    initialize: OnceLock<InitializeParams>,
    dispose: CancellationToken,
    response_timeout: Option<Duration>,
}

/// Shared transport multiplexing many concurrent POSTs into one inbound stream.
///
/// Cloning is cheap; all clones refer to the same channel and snapshot.
#[derive(Clone)]
pub struct SharedTransport {
    inner: Arc<SharedInner>,
}

impl SharedTransport {
    pub fn new(response_timeout: Option<Duration>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(TransportConfig::INBOUND_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SharedInner {
                inbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
                initialize: OnceLock::new(),
                dispose: CancellationToken::new(),
                response_timeout,
            }),
        }
    }

    /// Hand one message to the engine.
    ///
    /// Suspends while the engine has not consumed the previous message.
    /// Fails with `Cancelled` if `cancel` fires first, or `Lifecycle` once the
    /// transport has been disposed.
    pub async fn accept_inbound(
        &self,
        inbound: InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.is_disposed() {
            return Err(BridgeError::Lifecycle("transport has been disposed".to_string()));
        }

        tokio::select! {
            _ = self.inner.dispose.cancelled() => {
                Err(BridgeError::Lifecycle("transport disposed while delivering".to_string()))
            }
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            sent = self.inner.inbound_tx.send(inbound) => {
                sent.map_err(|_| BridgeError::Closed("inbound channel".to_string()))
            }
        }
    }

    /// Create the adapter for one HTTP POST.
    ///
    /// Its cancellation token is a child of this transport's, so disposal
    /// reaches every in-flight request.
    pub fn create_request_scope(&self) -> RequestScope {
        RequestScope::new(
            self.clone(),
            self.inner.dispose.child_token(),
            self.inner.response_timeout,
        )
    }

    /// Record the first `initialize` request's parameters.
    ///
    /// Returns `false` when a snapshot already exists; the existing one is kept.
    pub(crate) fn record_initialize(&self, params: InitializeParams) -> bool {
        match self.inner.initialize.set(params) {
            Ok(()) => {
                debug!("Captured initialize parameters");
                true
            }
            Err(_) => {
                warn!("Ignoring repeated initialize request; snapshot already captured");
                false
            }
        }
    }

    /// Parameters of the first `initialize` request, if one has arrived.
    pub fn initialize_request(&self) -> Option<&InitializeParams> {
        self.inner.initialize.get()
    }

    /// Cancel outstanding operations. Repeated calls are no-ops.
    pub fn dispose(&self) {
        if !self.inner.dispose.is_cancelled() {
            debug!("Disposing shared transport");
            self.inner.dispose.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.dispose.is_cancelled()
    }
}

#[async_trait::async_trait]
impl Transport for SharedTransport {
    async fn receive(&self) -> Option<InboundMessage> {
        let mut rx = self.inner.inbound_rx.lock().await;
        tokio::select! {
            _ = self.inner.dispose.cancelled() => None,
            inbound = rx.recv() => inbound,
        }
    }

    async fn send(&self, _message: RpcMessage) -> Result<()> {
        Err(BridgeError::UnsupportedOperation(
            "unsolicited server-to-client messages are not supported in stateless mode"
                .to_string(),
        ))
    }

    async fn close(&self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReplySink;
    use serde_json::json;

    struct NullTarget;

    #[async_trait::async_trait]
    impl crate::transport::ReplyTarget for NullTarget {
        async fn deliver(&self, _message: RpcMessage) -> Result<()> {
            Ok(())
        }
    }

    fn inbound(id: i64) -> InboundMessage {
        InboundMessage {
            message: RpcMessage::request(id, "ping", json!({})),
            reply: ReplySink::new(Arc::new(NullTarget)),
        }
    }

    #[tokio::test]
    async fn test_accept_then_receive() {
        let transport = SharedTransport::new(None);
        let cancel = CancellationToken::new();

        transport.accept_inbound(inbound(1), &cancel).await.unwrap();
        let received = transport.receive().await.unwrap();
        assert_eq!(received.message.id(), Some(&1.into()));
    }

    #[tokio::test]
    async fn test_full_channel_suspends_until_consumed() {
        let transport = SharedTransport::new(None);
        let cancel = CancellationToken::new();

        transport.accept_inbound(inbound(1), &cancel).await.unwrap();

        let second = {
            let transport = transport.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { transport.accept_inbound(inbound(2), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished(), "second delivery should be suspended");

        let first = transport.receive().await.unwrap();
        assert_eq!(first.message.id(), Some(&1.into()));

        second.await.unwrap().unwrap();
        let next = transport.receive().await.unwrap();
        assert_eq!(next.message.id(), Some(&2.into()));
    }

    #[tokio::test]
    async fn test_cancel_releases_suspended_delivery() {
        let transport = SharedTransport::new(None);
        let cancel = CancellationToken::new();
        transport.accept_inbound(inbound(1), &cancel).await.unwrap();

        let request_cancel = CancellationToken::new();
        request_cancel.cancel();
        let result = transport.accept_inbound(inbound(2), &request_cancel).await;
        assert!(matches!(result, Err(BridgeError::Cancelled)));
    }

    #[tokio::test]
    async fn test_send_is_unsupported() {
        let transport = SharedTransport::new(None);
        let result = transport
            .send(RpcMessage::request(1, "sampling/createMessage", json!({})))
            .await;
        assert!(matches!(result, Err(BridgeError::UnsupportedOperation(_))));

        let result = transport
            .send(RpcMessage::notification("notifications/message", None))
            .await;
        assert!(matches!(result, Err(BridgeError::UnsupportedOperation(_))));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_ends_receive() {
        let transport = SharedTransport::new(None);
        transport.dispose();
        transport.dispose();

        assert!(transport.is_disposed());
        assert!(transport.receive().await.is_none());

        let result = transport
            .accept_inbound(inbound(1), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(BridgeError::Lifecycle(_))));
    }

    #[test]
    fn test_initialize_snapshot_is_write_once() {
        let transport = SharedTransport::new(None);
        assert!(transport.initialize_request().is_none());

        let first = InitializeParams {
            protocol_version: "2025-03-26".to_string(),
            ..Default::default()
        };
        let second = InitializeParams {
            protocol_version: "2024-11-05".to_string(),
            ..Default::default()
        };

        assert!(transport.record_initialize(first.clone()));
        assert!(!transport.record_initialize(second));
        assert_eq!(transport.initialize_request(), Some(&first));
    }
}
