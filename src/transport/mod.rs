//! Realtime transport session.
//!
//! The core treats the vendor channel as an opaque duplex message stream:
//! encoded microphone frames and an initial text turn go out, decoded-speech
//! chunks and tool invocations come back, plus open/close/error lifecycle
//! signals. Reconnection and retry live on the vendor side, not here.

pub mod gemini;

use crate::audio::codec::EncodedChunk;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Session open failed: {0}")]
    Open(String),

    #[error("Session closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// A structured request from the remote agent, requiring acknowledgement.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Events emitted by the transport's reader task, in wire arrival order.
#[derive(Debug)]
pub enum TransportEvent {
    /// Synthesized speech payload.
    Audio(EncodedChunk),
    /// One batch of tool calls; order within the batch is preserved.
    ToolCalls(Vec<ToolInvocation>),
    /// Remote closed the channel.
    Closed,
    /// Mid-call transport failure.
    Error(String),
}

/// Send half of a live session. The receive half is the event channel handed
/// out at connect time; its reader task is owned by the implementation.
#[async_trait]
pub trait LiveSession: Send {
    /// Forward one encoded microphone frame. Frames must be sent in capture
    /// order.
    async fn send_media(&mut self, chunk: EncodedChunk) -> Result<(), TransportError>;

    /// Send a complete text turn (used for the initial greeting nudge).
    async fn send_turn(&mut self, text: &str) -> Result<(), TransportError>;

    /// Acknowledge a tool invocation.
    async fn send_tool_response(
        &mut self,
        id: &str,
        name: &str,
        result: Value,
    ) -> Result<(), TransportError>;

    /// Close the session. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;
}
