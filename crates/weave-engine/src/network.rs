//! Transport seam — how the engine hands messages to the peer-to-peer
//! stream layer it is embedded in.

use async_trait::async_trait;

use weave_core::{Message, PeerId};

/// Errors surfaced by the transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("message dropped before reaching the wire")]
    Dropped,
}

/// An open outbound stream to one peer. Single-ownership: after `reset`
/// or `close` the sender is discarded, never reused.
#[async_trait]
pub trait MessageSender: Send {
    /// Deliver one message. The transport applies its own framing and
    /// enforces the maximum message size.
    async fn send(&mut self, message: Message) -> Result<(), NetworkError>;

    /// Graceful close: flush and tear down the stream.
    async fn close(&mut self) -> Result<(), NetworkError>;

    /// Abrupt teardown after a send failure.
    fn reset(&mut self);
}

/// Connection service the per-peer queues acquire senders from.
#[async_trait]
pub trait MessageNetwork: Send + Sync + 'static {
    async fn connect_to(&self, peer: PeerId) -> Result<(), NetworkError>;

    async fn new_message_sender(
        &self,
        peer: PeerId,
    ) -> Result<Box<dyn MessageSender>, NetworkError>;
}
