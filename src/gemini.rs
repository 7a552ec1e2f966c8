//! Gemini Live API session adapter
//!
//! Connects to the Live API over a WebSocket, performs the setup handshake and
//! exposes the connection as a [`Session`]. A background task reads the socket
//! and turns server messages into [`ServerEvent`]s; `receive()` replays them
//! one model turn at a time.

use crate::events::{Outbound, SessionReply};
use crate::session::{Connector, ReplyStream, Session, SessionError};
use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use futures_util::stream::{self, SplitSink, StreamExt};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type Inbound = std::result::Result<ServerEvent, GeminiError>;

/// Error type for Gemini API operations
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Server requested disconnect")]
    GoAway,
}

pub type Result<T> = std::result::Result<T, GeminiError>;

/// Response modality options
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ResponseModality {
    Text,
    Audio,
}

impl ResponseModality {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Audio => "AUDIO",
        }
    }
}

/// Configuration for the Gemini session
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub api_version: String,
    pub model: String,
    pub response_modality: ResponseModality,
    pub system_instruction: Option<String>,
    /// Ask the server to transcribe its own speech so spoken replies also
    /// arrive as text.
    pub transcribe_output: bool,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_version: "v1alpha".to_string(),
            model: "models/gemini-2.0-flash-exp".to_string(),
            response_modality: ResponseModality::Audio,
            system_instruction: None,
            transcribe_output: true,
        }
    }
}

impl GeminiConfig {
    fn url(&self) -> String {
        format!(
            "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.{}.GenerativeService.BidiGenerateContent?key={}",
            self.api_version, self.api_key
        )
    }

    fn setup_message(&self) -> ClientMessage {
        let output_audio_transcription = (self.transcribe_output
            && self.response_modality == ResponseModality::Audio)
            .then(|| serde_json::json!({}));

        ClientMessage::Setup(BidiGenerateContentSetup {
            model: self.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec![self.response_modality.as_str().to_string()],
            }),
            system_instruction: self.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part::text(text.clone())],
            }),
            output_audio_transcription,
        })
    }
}

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            inline_data: None,
        }
    }
}

/// Base64 payload with its mime type.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
}

impl From<Outbound> for ClientMessage {
    fn from(msg: Outbound) -> Self {
        match msg {
            Outbound::Audio(chunk) => ClientMessage::RealtimeInput(RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: chunk.mime_type(),
                    data: general_purpose::STANDARD.encode(&chunk.pcm),
                }],
            }),
            Outbound::Frame(frame) => ClientMessage::RealtimeInput(RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: frame.mime_type.to_string(),
                    data: general_purpose::STANDARD.encode(&frame.data),
                }],
            }),
            Outbound::Text(turn) => ClientMessage::ClientContent(ClientContent {
                turns: vec![Content {
                    role: Some("user".to_string()),
                    parts: vec![Part::text(turn.text)],
                }],
                turn_complete: turn.end_of_turn,
            }),
        }
    }
}

/// Server -> client message. Exactly one field is normally present.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<serde_json::Value>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<Content>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Deserialize, Default)]
struct Transcription {
    #[serde(default)]
    text: String,
}

/// What the reader task hands to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    SetupComplete,
    Reply(SessionReply),
    /// The current model turn is over (completed or interrupted).
    TurnComplete,
    GoAway,
}

/// Decode one server message into events, in the order they should be
/// handled.
pub fn parse_server_message(text: &str) -> Result<Vec<ServerEvent>> {
    let msg: ServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if msg.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = msg.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    match general_purpose::STANDARD.decode(&blob.data) {
                        Ok(pcm) if !pcm.is_empty() => {
                            events.push(ServerEvent::Reply(SessionReply::Audio(pcm)))
                        }
                        Ok(_) => {}
                        Err(e) => error!("Failed to decode inline audio: {:?}", e),
                    }
                } else if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    events.push(ServerEvent::Reply(SessionReply::Text(text)));
                }
            }
        }
        if let Some(transcript) = content.output_transcription {
            if !transcript.text.is_empty() {
                events.push(ServerEvent::Reply(SessionReply::Text(transcript.text)));
            }
        }
        if content.interrupted {
            debug!("Model turn interrupted");
        }
        if content.turn_complete || content.interrupted {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(call) = msg.tool_call {
        warn!("Ignoring tool call: {}", call);
    }

    if msg.go_away.is_some() {
        events.push(ServerEvent::GoAway);
    }

    Ok(events)
}

/// Opens [`GeminiSession`]s.
pub struct GeminiConnector {
    config: GeminiConfig,
}

impl GeminiConnector {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    async fn connect(&self) -> std::result::Result<Arc<dyn Session>, SessionError> {
        let session = GeminiSession::open(&self.config)
            .await
            .map_err(SessionError::Connect)?;
        Ok(Arc::new(session))
    }
}

/// An open Live API connection.
pub struct GeminiSession {
    sink: Mutex<WsSink>,
    events: Mutex<mpsc::Receiver<Inbound>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl GeminiSession {
    /// Connect, start the reader and complete the setup handshake.
    pub async fn open(config: &GeminiConfig) -> Result<Self> {
        info!(
            "Connecting to Gemini API ({}, {})",
            config.api_version, config.model
        );
        let (ws, resp) = connect_async(config.url().as_str()).await?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::channel(100);
        let reader = tokio::spawn(read_socket(stream, tx));

        let session = Self {
            sink: Mutex::new(sink),
            events: Mutex::new(rx),
            reader: std::sync::Mutex::new(Some(reader)),
        };

        session.write(&config.setup_message()).await?;
        info!("Setup message sent, waiting for acknowledgment");
        session.wait_for_setup_complete().await?;
        info!("Gemini session setup complete");
        Ok(session)
    }

    async fn wait_for_setup_complete(&self) -> Result<()> {
        let mut events = self.events.lock().await;
        let mut attempts = 0;
        while attempts < 10 {
            match events.recv().await {
                Some(Ok(ServerEvent::SetupComplete)) => return Ok(()),
                Some(Ok(other)) => {
                    debug!("Ignoring {:?} before setup completed", other);
                    attempts += 1;
                }
                Some(Err(e)) => return Err(e),
                None => return Err(GeminiError::ConnectionClosed),
            }
        }
        Err(GeminiError::SetupNotComplete)
    }

    async fn write(&self, msg: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        debug!("Sending message ({} bytes)", json.len());
        let mut sink = self.sink.lock().await;
        sink.send(Message::text(json)).await?;
        Ok(())
    }

    fn stop_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl Session for GeminiSession {
    async fn send(&self, msg: Outbound) -> std::result::Result<(), SessionError> {
        self.write(&ClientMessage::from(msg))
            .await
            .map_err(SessionError::Send)
    }

    fn receive(&self) -> ReplyStream<'_> {
        turn_stream(&self.events)
    }

    async fn close(&self) -> std::result::Result<(), SessionError> {
        info!("Closing Gemini session");
        let result = {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        self.stop_reader();
        match result {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(SessionError::Close(e.into())),
        }
    }
}

impl Drop for GeminiSession {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

enum TurnState<'a> {
    Waiting(&'a Mutex<mpsc::Receiver<Inbound>>),
    Open(MutexGuard<'a, mpsc::Receiver<Inbound>>),
    Done,
}

/// Replies up to the next turn boundary. Errors end the stream.
fn turn_stream(events: &Mutex<mpsc::Receiver<Inbound>>) -> ReplyStream<'_> {
    stream::unfold(TurnState::Waiting(events), |state| async move {
        let mut rx = match state {
            TurnState::Waiting(events) => events.lock().await,
            TurnState::Open(rx) => rx,
            TurnState::Done => return None,
        };
        loop {
            match rx.recv().await {
                Some(Ok(ServerEvent::Reply(reply))) => {
                    return Some((Ok(reply), TurnState::Open(rx)))
                }
                Some(Ok(ServerEvent::TurnComplete)) => return None,
                Some(Ok(ServerEvent::SetupComplete)) => continue,
                Some(Ok(ServerEvent::GoAway)) => {
                    info!("Server requested disconnection");
                    return Some((Err(SessionError::Receive(GeminiError::GoAway)), TurnState::Done));
                }
                Some(Err(e)) => return Some((Err(SessionError::Receive(e)), TurnState::Done)),
                None => {
                    return Some((
                        Err(SessionError::Receive(GeminiError::ConnectionClosed)),
                        TurnState::Done,
                    ))
                }
            }
        }
    })
    .boxed()
}

/// Reader task: socket frames -> events.
async fn read_socket(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    tx: mpsc::Sender<Inbound>,
) {
    info!("Inbound message task started");
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.to_string(),
            // The Live API delivers JSON in binary frames too.
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Received non-UTF-8 binary message ({} bytes)", bytes.len());
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                info!("WebSocket closed: {:?}", frame);
                let _ = tx.send(Err(GeminiError::ConnectionClosed)).await;
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("WebSocket error: {:?}", e);
                let _ = tx.send(Err(GeminiError::WebSocket(e))).await;
                break;
            }
        };

        match parse_server_message(&text) {
            Ok(events) => {
                for event in events {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => error!("Failed to parse server message: {:?}", e),
        }
    }
    info!("Inbound message task terminated");
}
