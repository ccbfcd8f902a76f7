//! Wire frames for the streaming channel and the stateful frame decoder.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::core::ids::StreamId;

fn default_frame_type() -> String {
    "message".to_string()
}

const fn default_confidence() -> f64 {
    1.0
}

/// Inbound JSON envelope. Unknown keys are ignored; every field has a
/// wire default so partial frames still parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEnvelope {
    /// Frame discriminator, `"message"` when absent.
    #[serde(rename = "type", default = "default_frame_type")]
    pub frame_type: String,
    /// Agent name attached to broadcast messages.
    #[serde(default)]
    pub agent: String,
    /// Inline content for legacy `message` frames.
    #[serde(default)]
    pub chunk: String,
    /// Confidence score, `1.0` when absent.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Server-side timestamp string, empty when absent.
    #[serde(default)]
    pub timestamp: String,
    /// Type-specific payload object.
    #[serde(default)]
    pub data: Option<Value>,
    /// Id of the message this frame belongs to, when the server sends one.
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Affective state pushed by the backend alongside replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionSignal {
    /// Pleasantness in `-1.0..=1.0`.
    #[serde(default)]
    pub valence: f32,
    /// Activation in `0.0..=1.0`.
    #[serde(default)]
    pub arousal: f32,
    /// Dominant labelled emotion, when classified.
    #[serde(default)]
    pub primary_emotion: Option<String>,
    /// Whether the backend suggests a supportive response style.
    #[serde(default)]
    pub needs_support: bool,
    /// Coarse mood label for display.
    #[serde(default)]
    pub mood_label: Option<String>,
}

/// Closed set of events a streaming session can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Handshake acknowledged by the server.
    Connected,
    /// Assistant started or stopped composing.
    AiTyping(bool),
    /// A streamed reply began; any prior accumulation is discarded.
    StreamStart(StreamId),
    /// One increment of a streamed reply.
    StreamChunk {
        /// The new fragment by itself.
        chunk: String,
        /// Server-cumulative content so far.
        full_content: String,
        /// Completion estimate in `0.0..=1.0`.
        progress: f64,
    },
    /// A streamed reply finished with this final content.
    StreamEnd(String),
    /// Affective state update.
    EmotionUpdate(EmotionSignal),
    /// Out-of-band notification payload.
    Notification(Value),
    /// Server-reported or locally detected error.
    Error(String),
    /// Forward-compatible passthrough for legacy and unknown frames.
    Message(FrameEnvelope),
    /// The session ended; no further events follow.
    Disconnected,
}

/// Stateful decoder translating inbound text frames into [`StreamEvent`]s.
///
/// Holds the accumulated content of the current stream so `stream_end`
/// frames without a payload can still close with the full text. The buffer
/// is reset by every `stream_start`, so a straggling final chunk of a
/// superseded stream is dropped rather than misattributed.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    accumulated: String,
}

impl FrameDecoder {
    /// Fresh decoder with an empty accumulation buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one text frame. `None` means the frame was consumed without
    /// producing an event (absent payload on a payload-carrying type).
    pub fn decode(&mut self, text: &str) -> Option<StreamEvent> {
        let envelope: FrameEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Dropping unparseable frame: {err}");
                return Some(StreamEvent::Error(format!("Parse error: {err}")));
            }
        };

        match envelope.frame_type.as_str() {
            "connected" => Some(StreamEvent::Connected),
            "ai_typing" => Some(StreamEvent::AiTyping(bool_field(
                envelope.data.as_ref(),
                "is_typing",
            ))),
            "stream_start" => {
                self.accumulated.clear();
                let stream_id = text_field(envelope.data.as_ref(), "stream_id");
                Some(StreamEvent::StreamStart(StreamId::from_raw(stream_id)))
            }
            "stream_chunk" => {
                let data = envelope.data.as_ref()?;
                let chunk = text_field(Some(data), "chunk");
                let full_content = text_field(Some(data), "full_content");
                let progress = float_field(Some(data), "progress");
                self.accumulated.clone_from(&full_content);
                Some(StreamEvent::StreamChunk {
                    chunk,
                    full_content,
                    progress,
                })
            }
            "stream_end" => {
                let full_content = envelope
                    .data
                    .as_ref()
                    .and_then(|data| data.get("full_content"))
                    .and_then(Value::as_str)
                    .map_or_else(|| self.accumulated.clone(), str::to_string);
                self.accumulated.clear();
                Some(StreamEvent::StreamEnd(full_content))
            }
            "emotion_update" => {
                let data = envelope.data.as_ref()?;
                match serde_json::from_value::<EmotionSignal>(data.clone()) {
                    Ok(signal) => Some(StreamEvent::EmotionUpdate(signal)),
                    Err(err) => {
                        warn!("Failed to parse emotion update: {err}");
                        None
                    }
                }
            }
            "notification" => envelope.data.map(StreamEvent::Notification),
            "error" => {
                let message = envelope
                    .data
                    .as_ref()
                    .and_then(|data| data.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string();
                Some(StreamEvent::Error(message))
            }
            // "message", "typing", and anything the server adds later.
            _ => Some(StreamEvent::Message(envelope)),
        }
    }
}

fn text_field(data: Option<&Value>, key: &str) -> String {
    data.and_then(|data| data.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn bool_field(data: Option<&Value>, key: &str) -> bool {
    data.and_then(|data| data.get(key))
        .and_then(Value::as_bool)
        .unwrap_or_default()
}

fn float_field(data: Option<&Value>, key: &str) -> f64 {
    data.and_then(|data| data.get(key))
        .and_then(Value::as_f64)
        .unwrap_or_default()
}

/// Outbound `chat_message` frame carrying user text.
#[must_use]
pub fn chat_message_frame(text: &str, conversation_id: Option<&str>, stream: bool) -> String {
    let mut data = serde_json::json!({ "message": text, "stream": stream });
    if let Some(id) = conversation_id {
        data["conversation_id"] = Value::String(id.to_string());
    }
    serde_json::json!({ "type": "chat_message", "data": data }).to_string()
}

/// Outbound typing indicator frame.
#[must_use]
pub fn typing_frame(active: bool) -> String {
    let frame_type = if active { "typing_start" } else { "typing_stop" };
    serde_json::json!({ "type": frame_type }).to_string()
}

/// Outbound keepalive frame.
#[must_use]
pub fn ping_frame() -> String {
    serde_json::json!({ "type": "ping" }).to_string()
}
