//! Transports between carriers and the business-logic engine.
//!
//! An engine only ever sees a [`Transport`]: a single-consumer source of
//! [`InboundMessage`]s. Each inbound message travels together with the
//! [`ReplySink`] of the carrier it arrived on, and every reply for it (progress
//! notifications first, correlated response last) goes back through that sink.
//!
//! - [`shared::SharedTransport`] multiplexes HTTP POSTs into one inbound stream.
//! - [`request::RequestScope`] is the per-POST adapter owning one correlation.
//! - [`stream::StreamTransport`] speaks newline-delimited JSON over byte pipes.

pub mod request;
pub mod shared;
pub mod stream;

pub use request::{PostOutcome, RequestScope, ResponseDrain};
pub use shared::{ClientInfo, InitializeParams, SharedTransport};
pub use stream::StreamTransport;

use crate::error::Result;
use crate::message::RpcMessage;
use std::fmt;
use std::sync::Arc;

/// The connection an engine reads from.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Wait for the next inbound message. `None` once the transport is closed.
    async fn receive(&self) -> Option<InboundMessage>;

    /// Send a message that is not a reply to any inbound message.
    async fn send(&self, message: RpcMessage) -> Result<()>;

    /// Close the outbound direction. Idempotent.
    async fn close(&self);
}

/// Carrier-side destination for replies to one inbound message.
#[async_trait::async_trait]
pub(crate) trait ReplyTarget: Send + Sync {
    async fn deliver(&self, message: RpcMessage) -> Result<()>;
}

/// Handle for replying to the inbound message it was delivered with.
#[derive(Clone)]
pub struct ReplySink {
    target: Arc<dyn ReplyTarget>,
}

impl ReplySink {
    pub(crate) fn new(target: Arc<dyn ReplyTarget>) -> Self {
        Self { target }
    }

    /// Send a reply. Suspends until the carrier has room for it.
    pub async fn send(&self, message: RpcMessage) -> Result<()> {
        self.target.deliver(message).await
    }
}

impl fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySink").finish_non_exhaustive()
    }
}

/// An inbound message paired with the sink its replies must use.
#[derive(Debug)]
pub struct InboundMessage {
    pub message: RpcMessage,
    pub reply: ReplySink,
}

impl InboundMessage {
    pub fn into_parts(self) -> (RpcMessage, ReplySink) {
        (self.message, self.reply)
    }
}
