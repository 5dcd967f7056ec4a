//! Per-POST adapter: one inbound message in, one SSE stream of replies out.
//!
//! A [`RequestScope`] parses the request body, forwards it to the shared
//! transport with a reply sink pointing back at itself, and then drains its
//! private capacity-1 outbound channel as SSE frames until the frame whose id
//! matches the pending request has been written.

use super::shared::{InitializeParams, SharedTransport};
use super::{InboundMessage, ReplySink, ReplyTarget};
use crate::config::TransportConfig;
use crate::error::{BridgeError, Result};
use crate::message::{RequestId, RpcMessage};
use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// What the caller should do with the HTTP response after acceptance.
#[derive(Debug)]
pub enum PostOutcome {
    /// No correlation target; close with an empty body.
    Accepted,
    /// Stream these frames as the response body.
    Streaming(ResponseDrain),
}

/// Adapter created for a single HTTP POST.
pub struct RequestScope {
    parent: SharedTransport,
    outbound_tx: mpsc::Sender<RpcMessage>,
    outbound_rx: mpsc::Receiver<RpcMessage>,
    cancel: CancellationToken,
    response_timeout: Option<Duration>,
}

impl RequestScope {
    pub(crate) fn new(
        parent: SharedTransport,
        cancel: CancellationToken,
        response_timeout: Option<Duration>,
    ) -> Self {
        let (outbound_tx, outbound_rx) =
            mpsc::channel(TransportConfig::OUTBOUND_CHANNEL_CAPACITY);
        Self {
            parent,
            outbound_tx,
            outbound_rx,
            cancel,
            response_timeout,
        }
    }

    /// Token cancelled on server disposal or when this request is abandoned.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Parse the body and hand the message to the engine.
    ///
    /// Notifications, and requests whose id is the unset sentinel, return
    /// [`PostOutcome::Accepted`] without touching the outbound channel.
    pub async fn accept(self, body: &[u8]) -> Result<PostOutcome> {
        let message = RpcMessage::from_slice(body)?;

        let mut snapshot = None;
        let pending = match &message {
            RpcMessage::Request { id, method, params } => {
                if method == TransportConfig::INITIALIZE_METHOD {
                    let params: InitializeParams = match params {
                        Some(params) => serde_json::from_value(params.clone())?,
                        None => InitializeParams::default(),
                    };
                    snapshot = Some(params);
                }
                (!id.is_unset()).then(|| id.clone())
            }
            _ => None,
        };

        let reply = ReplySink::new(Arc::new(RequestReplyTarget {
            outbound_tx: self.outbound_tx.clone(),
            cancel: self.cancel.clone(),
        }));

        debug!(
            "Forwarding {} to engine",
            message.method().unwrap_or("response")
        );
        self.parent
            .accept_inbound(InboundMessage { message, reply }, &self.cancel)
            .await?;

        // Only an initialize the engine actually received becomes the snapshot.
        if let Some(snapshot) = snapshot {
            self.parent.record_initialize(snapshot);
        }

        let Some(pending) = pending else {
            return Ok(PostOutcome::Accepted);
        };

        // Only the engine's sinks keep the channel open from here on.
        let RequestScope {
            outbound_tx,
            outbound_rx,
            cancel,
            response_timeout,
            ..
        } = self;
        drop(outbound_tx);

        Ok(PostOutcome::Streaming(ResponseDrain {
            pending,
            outbound_rx,
            deadline: response_timeout.map(|t| (Instant::now() + t, t)),
            finished: false,
            answered: false,
            _abandon_guard: cancel.clone().drop_guard(),
            cancel,
        }))
    }

    /// Run the whole request over a byte pipe.
    ///
    /// Reads the body to EOF, then writes every SSE frame to `output`.
    /// Returns `true` when a response body was written, `false` for
    /// notifications and for requests ended by cancellation.
    pub async fn run<R, W>(self, mut input: R, mut output: W) -> Result<bool>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let cancel = self.cancel.clone();
        let mut body = Vec::new();
        tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            read = input.read_to_end(&mut body) => { read?; }
        }

        let mut drain = match self.accept(&body).await {
            Ok(PostOutcome::Accepted) => return Ok(false),
            Ok(PostOutcome::Streaming(drain)) => drain,
            Err(BridgeError::Cancelled) => return Ok(false),
            Err(e) => return Err(e),
        };

        while let Some(frame) = drain.next_frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(BridgeError::Cancelled) => return Ok(false),
                Err(e) => return Err(e),
            };
            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                written = output.write_all(&frame) => written?,
            }
            output.flush().await?;
        }

        Ok(drain.is_complete())
    }
}

/// Reply target feeding a request's private outbound channel.
struct RequestReplyTarget {
    outbound_tx: mpsc::Sender<RpcMessage>,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl ReplyTarget for RequestReplyTarget {
    async fn deliver(&self, message: RpcMessage) -> Result<()> {
        if message.is_request() {
            return Err(BridgeError::UnsupportedOperation(
                "server-to-client requests are not supported in stateless mode".to_string(),
            ));
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(BridgeError::Cancelled),
            sent = self.outbound_tx.send(message) => {
                sent.map_err(|_| BridgeError::Closed("response stream".to_string()))
            }
        }
    }
}

/// Drains a request's outbound channel as SSE frames.
///
/// Dropping the drain before it completes (the client went away) cancels the
/// request's token, which releases any engine send blocked on this request.
#[derive(Debug)]
pub struct ResponseDrain {
    pending: RequestId,
    outbound_rx: mpsc::Receiver<RpcMessage>,
    cancel: CancellationToken,
    deadline: Option<(Instant, Duration)>,
    finished: bool,
    answered: bool,
    _abandon_guard: DropGuard,
}

impl ResponseDrain {
    /// Id of the request this drain is waiting to answer.
    pub fn pending(&self) -> &RequestId {
        &self.pending
    }

    /// Whether the correlated response has been framed.
    pub fn is_complete(&self) -> bool {
        self.answered
    }

    /// Next SSE frame, or `None` once the stream is over.
    ///
    /// Cancellation before the correlated response yields one
    /// `Err(Cancelled)`; a missed deadline yields one `Err(Timeout)`.
    pub async fn next_frame(&mut self) -> Option<Result<Bytes>> {
        if self.finished {
            return None;
        }

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        let received = tokio::select! {
            _ = self.cancel.cancelled() => {
                // Abort rather than end cleanly, so the client can tell the
                // stream was cut short.
                debug!("Request {} cancelled while draining", self.pending);
                self.finished = true;
                return Some(Err(BridgeError::Cancelled));
            }
            _ = expired => {
                self.finished = true;
                let timeout = deadline.map(|(_, t)| t).unwrap_or_default();
                warn!("Request {} saw no correlated response within {:?}", self.pending, timeout);
                return Some(Err(BridgeError::Timeout(timeout)));
            }
            received = self.outbound_rx.recv() => received,
        };

        let Some(message) = received else {
            self.finished = true;
            warn!("Engine released request {} without responding", self.pending);
            return Some(Err(BridgeError::Closed(
                "engine dropped the reply sink before responding".to_string(),
            )));
        };

        let frame = match encode_sse_frame(&message) {
            Ok(frame) => frame,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };

        if message.id() == Some(&self.pending) {
            debug!("Framed correlated response for request {}", self.pending);
            self.finished = true;
            self.answered = true;
        }

        Some(Ok(frame))
    }

    /// Convert into a byte stream suitable for an HTTP response body.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut drain| async move {
            drain.next_frame().await.map(|frame| (frame, drain))
        })
    }
}

/// Frame one message as `event: message\r\ndata: <json>\r\n\r\n`.
pub fn encode_sse_frame(message: &RpcMessage) -> Result<Bytes> {
    let json = serde_json::to_vec(message)?;
    let mut frame = BytesMut::with_capacity(
        TransportConfig::SSE_EVENT_PREFIX.len()
            + json.len()
            + TransportConfig::SSE_EVENT_SUFFIX.len(),
    );
    frame.put_slice(TransportConfig::SSE_EVENT_PREFIX);
    frame.put_slice(&json);
    frame.put_slice(TransportConfig::SSE_EVENT_SUFFIX);
    Ok(frame.freeze())
}
