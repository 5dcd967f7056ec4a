//! Newline-delimited JSON-RPC over a pair of byte streams.
//!
//! This is the framing a bridged engine speaks: one JSON document per line,
//! in both directions. Unlike the stateless HTTP scope, a stream is a real
//! duplex connection, so replies of any kind (including server-initiated
//! requests) are allowed.

use super::{InboundMessage, ReplySink, ReplyTarget, Transport};
use crate::config::TransportConfig;
use crate::error::{BridgeError, Result};
use crate::message::{RequestId, RpcError, RpcMessage};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shared, closable line writer.
struct LineWriter<W> {
    sink: Mutex<Option<FramedWrite<W, LinesCodec>>>,
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&self, message: &RpcMessage) -> Result<()> {
        let line = message.to_json()?;
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| BridgeError::Closed("stream output".to_string()))?;
        sink.send(line).await.map_err(codec_error)
    }

    async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = SinkExt::<String>::close(&mut sink).await {
                debug!("Error closing stream output: {}", e);
            }
        }
    }
}

#[async_trait::async_trait]
impl<W> ReplyTarget for LineWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn deliver(&self, message: RpcMessage) -> Result<()> {
        self.write(&message).await
    }
}

fn codec_error(err: LinesCodecError) -> BridgeError {
    match err {
        LinesCodecError::Io(e) => e.into(),
        LinesCodecError::MaxLineLengthExceeded => BridgeError::protocol(format!(
            "line exceeds {} bytes",
            TransportConfig::MAX_LINE_BYTES
        )),
    }
}

/// Transport over an input byte stream and an output byte stream.
pub struct StreamTransport<R, W> {
    reader: Mutex<FramedRead<R, LinesCodec>>,
    writer: Arc<LineWriter<W>>,
    cancel: CancellationToken,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(input: R, output: W, cancel: CancellationToken) -> Self {
        Self {
            reader: Mutex::new(FramedRead::new(
                input,
                LinesCodec::new_with_max_length(TransportConfig::MAX_LINE_BYTES),
            )),
            writer: Arc::new(LineWriter {
                sink: Mutex::new(Some(FramedWrite::new(output, LinesCodec::new()))),
            }),
            cancel,
        }
    }

    fn reply_sink(&self) -> ReplySink {
        ReplySink::new(self.writer.clone())
    }

    async fn reject(&self, error: RpcError) {
        let response = RpcMessage::error(RequestId::Unset, error);
        if let Err(e) = self.writer.write(&response).await {
            debug!("Failed to send parse error response: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn receive(&self) -> Option<InboundMessage> {
        let mut reader = self.reader.lock().await;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                next = reader.next() => next,
            };

            let line = match next? {
                Ok(line) => line,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(
                        "Discarding inbound line longer than {} bytes",
                        TransportConfig::MAX_LINE_BYTES
                    );
                    self.reject(RpcError::new(
                        RpcError::PARSE_ERROR,
                        "Parse error: message too large",
                    ))
                    .await;
                    continue;
                }
                Err(LinesCodecError::Io(e)) => {
                    warn!("Stream transport read failed: {}", e);
                    return None;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match RpcMessage::from_slice(trimmed.as_bytes()) {
                Ok(message) => {
                    return Some(InboundMessage {
                        message,
                        reply: self.reply_sink(),
                    })
                }
                Err(e) => {
                    warn!("Rejecting malformed inbound line: {}", e);
                    self.reject(RpcError::new(
                        RpcError::PARSE_ERROR,
                        format!("Parse error: {}", e),
                    ))
                    .await;
                }
            }
        }
    }

    async fn send(&self, message: RpcMessage) -> Result<()> {
        self.writer.write(&message).await
    }

    async fn close(&self) {
        self.writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_receive_parses_lines_and_replies_on_same_stream() {
        let (mut client_in, engine_in) = tokio::io::duplex(1024);
        let (engine_out, client_out) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(engine_in, engine_out, CancellationToken::new());

        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n\n")
            .await
            .unwrap();

        let (message, reply) = transport.receive().await.unwrap().into_parts();
        assert_eq!(message.method(), Some("ping"));
        reply
            .send(RpcMessage::success(1.into(), json!("pong")))
            .await
            .unwrap();

        let mut lines = BufReader::new(client_out).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#);
    }

    #[tokio::test]
    async fn test_malformed_line_gets_parse_error_and_is_skipped() {
        let (mut client_in, engine_in) = tokio::io::duplex(1024);
        let (engine_out, client_out) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(engine_in, engine_out, CancellationToken::new());

        client_in
            .write_all(b"garbage\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
            .await
            .unwrap();

        let inbound = transport.receive().await.unwrap();
        assert_eq!(inbound.message.method(), Some("notifications/initialized"));

        let mut lines = BufReader::new(client_out).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["error"]["code"], -32700);
        assert_eq!(response["id"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_eof_ends_receive() {
        let (client_in, engine_in) = tokio::io::duplex(64);
        let (engine_out, _client_out) = tokio::io::duplex(64);
        let transport = StreamTransport::new(engine_in, engine_out, CancellationToken::new());

        drop(client_in);
        assert!(transport.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_close_signals_eof_and_rejects_further_sends() {
        let (_client_in, engine_in) = tokio::io::duplex(64);
        let (engine_out, client_out) = tokio::io::duplex(64);
        let transport = StreamTransport::new(engine_in, engine_out, CancellationToken::new());

        transport.close().await;
        transport.close().await;

        let mut lines = BufReader::new(client_out).lines();
        assert!(lines.next_line().await.unwrap().is_none());

        let result = transport
            .send(RpcMessage::notification("notifications/message", None))
            .await;
        assert!(matches!(result, Err(BridgeError::Closed(_))));
    }

    #[tokio::test]
    async fn test_server_initiated_request_is_allowed() {
        let (_client_in, engine_in) = tokio::io::duplex(1024);
        let (engine_out, client_out) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(engine_in, engine_out, CancellationToken::new());

        transport
            .send(RpcMessage::request(5, "roots/list", json!({})))
            .await
            .unwrap();

        let mut lines = BufReader::new(client_out).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("\"method\":\"roots/list\""));
    }
}
