//! Gemini Live bidirectional session over WebSocket.
//!
//! One WebSocket carries everything: a setup handshake, streamed microphone
//! PCM out, synthesized-speech PCM and tool calls back. The socket is split
//! at connect time; the read half runs as its own task feeding the event
//! channel, the write half lives in the session handle.

use crate::audio::codec::EncodedChunk;
use crate::transport::{LiveSession, ToolInvocation, TransportError, TransportEvent};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

const LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const EVENT_CHANNEL_CAPACITY: usize = 128;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Per-call session parameters carried into the setup message.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub tool_declarations: Value,
}

pub struct GeminiSession {
    write: WsSink,
    reader: Option<tokio::task::JoinHandle<()>>,
    closed: bool,
}

/// Open a live session. Resolves once the server acknowledges the setup
/// message; the returned receiver carries all subsequent events.
pub async fn connect(
    api_key: &str,
    setup: SessionSetup,
) -> Result<(GeminiSession, mpsc::Receiver<TransportEvent>), TransportError> {
    let mut url = Url::parse(LIVE_ENDPOINT)?;
    url.query_pairs_mut().append_pair("key", api_key);

    let (ws_stream, _) = connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    let setup_msg = json!({
        "setup": {
            "model": format!("models/{}", setup.model),
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": setup.voice }
                    }
                }
            },
            "systemInstruction": {
                "parts": [{ "text": setup.system_instruction }]
            },
            "tools": [{ "functionDeclarations": setup.tool_declarations }]
        }
    });
    write
        .send(Message::Text(setup_msg.to_string().into()))
        .await?;

    // The first server message must acknowledge the setup.
    match read.next().await {
        Some(Ok(msg)) => {
            let text = message_text(&msg)
                .ok_or_else(|| TransportError::Open("non-text setup response".into()))?;
            let parsed: ServerMessage = serde_json::from_str(&text)
                .map_err(|e| TransportError::Open(format!("unparseable setup response: {}", e)))?;
            if parsed.setup_complete.is_none() {
                return Err(TransportError::Open(format!(
                    "expected setupComplete, got: {}",
                    text
                )));
            }
        }
        Some(Err(e)) => return Err(TransportError::WebSocket(e)),
        None => return Err(TransportError::Open("socket closed during setup".into())),
    }

    log::info!("Transport: session open (model {})", setup.model);

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let reader = tokio::spawn(read_loop(read, event_tx));

    Ok((
        GeminiSession {
            write,
            reader: Some(reader),
            closed: false,
        },
        event_rx,
    ))
}

async fn read_loop(mut read: WsSource, event_tx: mpsc::Sender<TransportEvent>) {
    while let Some(msg_result) = read.next().await {
        let msg = match msg_result {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("Transport: WebSocket error: {}", e);
                let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                return;
            }
        };

        match msg {
            Message::Close(frame) => {
                log::info!("Transport: server closed session: {:?}", frame);
                let _ = event_tx.send(TransportEvent::Closed).await;
                return;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => {
                let Some(text) = message_text(&other) else {
                    continue;
                };
                let parsed = match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        log::warn!("Transport: unparseable server message: {}", e);
                        continue;
                    }
                };
                for event in parsed.into_events() {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    log::info!("Transport: read stream ended");
    let _ = event_tx.send(TransportEvent::Closed).await;
}

/// Gemini sends JSON as both text and binary frames.
fn message_text(msg: &Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text.to_string()),
        Message::Binary(data) => String::from_utf8(data.as_slice().to_vec()).ok(),
        _ => None,
    }
}

#[async_trait]
impl LiveSession for GeminiSession {
    async fn send_media(&mut self, chunk: EncodedChunk) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let msg = json!({
            "realtimeInput": {
                "mediaChunks": [{
                    "mimeType": chunk.mime_type,
                    "data": chunk.data
                }]
            }
        });
        self.write
            .send(Message::Text(msg.to_string().into()))
            .await?;
        Ok(())
    }

    async fn send_turn(&mut self, text: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let msg = json!({
            "clientContent": {
                "turns": [{
                    "role": "user",
                    "parts": [{ "text": text }]
                }],
                "turnComplete": true
            }
        });
        self.write
            .send(Message::Text(msg.to_string().into()))
            .await?;
        Ok(())
    }

    async fn send_tool_response(
        &mut self,
        id: &str,
        name: &str,
        result: Value,
    ) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let msg = json!({
            "toolResponse": {
                "functionResponses": [{
                    "id": id,
                    "name": name,
                    "response": result
                }]
            }
        });
        self.write
            .send(Message::Text(msg.to_string().into()))
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Err(e) = self.write.close().await {
            log::debug!("Transport: close handshake failed: {}", e);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inbound wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCallMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    parts: Option<Vec<Part>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallMessage {
    function_calls: Option<Vec<FunctionCall>>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    id: Option<String>,
    name: String,
    args: Option<Value>,
}

impl ServerMessage {
    fn into_events(self) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if let Some(calls) = self.tool_call.and_then(|tc| tc.function_calls) {
            let batch: Vec<ToolInvocation> = calls
                .into_iter()
                .map(|fc| ToolInvocation {
                    id: fc.id.unwrap_or_default(),
                    name: fc.name,
                    args: fc.args.unwrap_or(Value::Null),
                })
                .collect();
            if !batch.is_empty() {
                events.push(TransportEvent::ToolCalls(batch));
            }
        }

        let parts = self
            .server_content
            .and_then(|sc| sc.model_turn)
            .and_then(|mt| mt.parts)
            .unwrap_or_default();
        for part in parts {
            if let Some(inline) = part.inline_data {
                events.push(TransportEvent::Audio(EncodedChunk {
                    data: inline.data,
                    mime_type: inline
                        .mime_type
                        .unwrap_or_else(|| "audio/pcm;rate=24000".to_string()),
                }));
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_audio_message() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAA" } }
                    ]
                }
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let events = msg.into_events();

        assert_eq!(events.len(), 1);
        match &events[0] {
            TransportEvent::Audio(chunk) => {
                assert_eq!(chunk.data, "AAAA");
                assert_eq!(chunk.mime_type, "audio/pcm;rate=24000");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_tool_call_batch() {
        let raw = r#"{
            "toolCall": {
                "functionCalls": [
                    { "id": "call-1", "name": "updateLeadInfo", "args": { "fullName": "Asha" } },
                    { "id": "call-2", "name": "updateLeadInfo", "args": { "mobile": "9999" } }
                ]
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let events = msg.into_events();

        assert_eq!(events.len(), 1);
        match &events[0] {
            TransportEvent::ToolCalls(batch) => {
                assert_eq!(batch.len(), 2);
                assert_eq!(batch[0].id, "call-1");
                assert_eq!(batch[0].args["fullName"], "Asha");
                assert_eq!(batch[1].id, "call-2");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_binary_frames_carry_json_too() {
        let msg = Message::binary(br#"{ "setupComplete": {} }"#.to_vec());
        let text = message_text(&msg).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&text).unwrap();
        assert!(parsed.setup_complete.is_some());
    }

    #[test]
    fn test_parse_setup_complete() {
        let msg: ServerMessage = serde_json::from_str(r#"{ "setupComplete": {} }"#).unwrap();
        assert!(msg.setup_complete.is_some());
        assert!(msg.into_events().is_empty());
    }

    #[test]
    fn test_unknown_message_yields_no_events() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{ "usageMetadata": { "totalTokens": 12 } }"#).unwrap();
        assert!(msg.into_events().is_empty());
    }
}
