//! Wire frames exchanged with the room server.
//!
//! Every transport message carries exactly one UTF-8 JSON envelope of the
//! form `{"type": <tag>, "payload": {...}}`. Inbound envelopes are decoded
//! into the closed [`InboundFrame`] set, with [`InboundFrame::Unknown`]
//! absorbing tags this agent does not understand.
//!
//! The legacy tags (`participant_joined`, `participant_left`,
//! `data_received`, `audio_frame`) are also accepted in their older flat
//! layout, e.g. `{"type": "participant_joined", "participant": {...}}`.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use std::collections::HashMap;

/// Structural decoding failure for an inbound frame. Always recoverable.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("frame is not a JSON envelope: {0}")]
    Envelope(serde_json::Error),
    #[error("invalid payload for `{tag}` frame: {source}")]
    Payload {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid base64 audio data: {0}")]
    Audio(#[from] base64::DecodeError),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    tag: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JoinPayload {
    pub sid: String,
    pub identity: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LeavePayload {
    pub sid: String,
    #[serde(default)]
    pub identity: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackPayload {
    pub sid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "type")]
    pub kind: TrackKind,
    #[serde(default)]
    pub participant_sid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DataPayload {
    pub content: String,
    #[serde(default = "unknown_sender")]
    pub sender: String,
}

fn unknown_sender() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct AudioPayload {
    data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PingPayload {
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Join(JoinPayload),
    Leave(LeavePayload),
    TrackPublished(TrackPayload),
    TrackUnpublished(TrackPayload),
    Data(DataPayload),
    /// One unit of raw audio, already base64-decoded.
    Audio(Vec<u8>),
    Ping(PingPayload),
    Pong(PingPayload),
    Unknown { tag: String },
}

impl InboundFrame {
    /// Decodes one transport message.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(raw)?;
        let envelope: Envelope = serde_json::from_str(text).map_err(DecodeError::Envelope)?;
        let Envelope { tag, payload, rest } = envelope;
        let payload = match payload.filter(|p| !p.is_null()) {
            Some(payload) => payload,
            None => legacy_payload(&tag, rest).unwrap_or_else(|| Value::Object(Map::new())),
        };

        let frame = match tag.as_str() {
            "join" | "participant_joined" => Self::Join(payload_as(&tag, payload)?),
            "leave" | "participant_left" => Self::Leave(payload_as(&tag, payload)?),
            "track_published" => Self::TrackPublished(payload_as(&tag, payload)?),
            "track_unpublished" => Self::TrackUnpublished(payload_as(&tag, payload)?),
            "data" | "data_received" => Self::Data(payload_as(&tag, payload)?),
            "audio" | "audio_frame" => {
                use base64::Engine;
                let audio: AudioPayload = payload_as(&tag, payload)?;
                Self::Audio(base64::engine::general_purpose::STANDARD.decode(audio.data)?)
            }
            "ping" => Self::Ping(payload_as(&tag, payload)?),
            "pong" => Self::Pong(payload_as(&tag, payload)?),
            _ => Self::Unknown { tag },
        };
        Ok(frame)
    }

    /// The tag used for logging.
    pub fn kind(&self) -> &str {
        match self {
            Self::Join(_) => "join",
            Self::Leave(_) => "leave",
            Self::TrackPublished(_) => "track_published",
            Self::TrackUnpublished(_) => "track_unpublished",
            Self::Data(_) => "data",
            Self::Audio(_) => "audio",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Unknown { tag } => tag,
        }
    }
}

/// Rebuilds a payload from the flat layout of the legacy tags, which carry
/// their fields beside `type` instead of under `payload`.
fn legacy_payload(tag: &str, mut rest: Map<String, Value>) -> Option<Value> {
    match tag {
        "participant_joined" | "participant_left" => rest.remove("participant"),
        "track_published" | "track_unpublished" => rest.remove("track"),
        "data_received" => {
            let content = rest.get("data").and_then(|d| d.get("content")).cloned()?;
            let mut payload = Map::new();
            payload.insert("content".to_string(), content);
            if let Some(sender) = rest.get("sender").and_then(|s| s.get("identity")).cloned() {
                payload.insert("sender".to_string(), sender);
            }
            Some(Value::Object(payload))
        }
        "audio_frame" => rest.remove("audio_data").map(|data| json!({ "data": data })),
        _ => None,
    }
}

fn payload_as<T: DeserializeOwned>(tag: &str, payload: Value) -> Result<T, DecodeError> {
    serde_json::from_value(payload).map_err(|source| DecodeError::Payload {
        tag: tag.to_string(),
        source,
    })
}

/// Counters reported with every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub audio_units_processed: u64,
    pub participants_count: usize,
}

/// A frame produced by this agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundFrame {
    Data { content: String },
    Subscribe { track_sid: String },
    Ping { timestamp: i64, stats: HeartbeatStats },
    Pong { timestamp: i64 },
}

impl OutboundFrame {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Data { .. } => "data",
            Self::Subscribe { .. } => "subscribe",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}
