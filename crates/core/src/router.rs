//! Inbound event dispatch.
//!
//! The [`EventRouter`] owns the participant table and turns each decoded
//! [`InboundFrame`] into zero or more [`OutboundFrame`]s. External
//! collaborators (text replies, audio analysis) are injected at construction
//! time and isolated per call: a failing or slow collaborator is logged and
//! never aborts dispatch.

use crate::frame::{InboundFrame, OutboundFrame, TrackKind};
use crate::stats::ConnectionStats;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on a single collaborator call.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    #[error("callback timed out after {0:?}")]
    Timeout(Duration),
    #[error("callback failed: {0}")]
    Failed(String),
}

impl CallbackError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

/// Produces replies to inbound text messages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Returns the reply for `text` sent by `sender`, if any.
    async fn handle(&self, text: &str, sender: &str) -> Result<Option<String>, CallbackError>;
}

/// Result of analysing one unit of audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioAnalysis {
    /// Normalised to `0.0..=1.0`.
    pub volume_level: f32,
    pub has_speech: bool,
    pub duration: Duration,
}

/// Receives raw audio units.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn consume(&self, audio: &[u8]) -> Result<AudioAnalysis, CallbackError>;
}

/// A participant currently present in the room.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantRecord {
    pub session_id: String,
    pub identity: String,
    pub display_name: String,
    pub metadata: HashMap<String, String>,
    pub joined_at: DateTime<Utc>,
}

/// Per-dispatch view of session state.
pub struct DispatchContext<'a> {
    pub stats: &'a ConnectionStats,
}

pub struct EventRouter {
    handler: Arc<dyn MessageHandler>,
    audio_sink: Option<Arc<dyn AudioSink>>,
    participants: RwLock<HashMap<String, ParticipantRecord>>,
    callback_timeout: Duration,
}

impl EventRouter {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            handler,
            audio_sink: None,
            participants: RwLock::new(HashMap::new()),
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }

    pub fn with_audio_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.audio_sink = Some(sink);
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    pub fn participants(&self) -> Vec<ParticipantRecord> {
        self.participants.read().values().cloned().collect()
    }

    pub fn participant(&self, session_id: &str) -> Option<ParticipantRecord> {
        self.participants.read().get(session_id).cloned()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.read().len()
    }

    /// Handles one inbound frame and returns the frames to send in reply.
    pub async fn dispatch(
        &self,
        frame: InboundFrame,
        ctx: &DispatchContext<'_>,
    ) -> Vec<OutboundFrame> {
        match frame {
            InboundFrame::Join(join) => {
                let display_name = join.name.unwrap_or_else(|| join.identity.clone());
                let record = ParticipantRecord {
                    session_id: join.sid.clone(),
                    identity: join.identity,
                    display_name: display_name.clone(),
                    metadata: join.metadata,
                    joined_at: Utc::now(),
                };
                info!(sid = %record.session_id, identity = %record.identity, "Participant joined");
                self.participants.write().insert(join.sid, record);
                vec![OutboundFrame::Data {
                    content: format!("Welcome {display_name}!"),
                }]
            }
            InboundFrame::Leave(leave) => {
                let removed = self.participants.write().remove(&leave.sid);
                match removed {
                    Some(record) => {
                        info!(sid = %record.session_id, identity = %record.identity, "Participant left");
                        vec![OutboundFrame::Data {
                            content: format!("Goodbye {}!", record.display_name),
                        }]
                    }
                    None => {
                        debug!(sid = %leave.sid, "Leave for unknown participant ignored");
                        Vec::new()
                    }
                }
            }
            InboundFrame::TrackPublished(track) => {
                info!(sid = %track.sid, name = ?track.name, kind = ?track.kind, "Track published");
                if track.kind == TrackKind::Audio {
                    vec![OutboundFrame::Subscribe {
                        track_sid: track.sid,
                    }]
                } else {
                    Vec::new()
                }
            }
            InboundFrame::TrackUnpublished(track) => {
                info!(sid = %track.sid, name = ?track.name, kind = ?track.kind, "Track unpublished");
                Vec::new()
            }
            InboundFrame::Data(data) => {
                info!(sender = %data.sender, content = %data.content, "Data message received");
                let reply = tokio::time::timeout(
                    self.callback_timeout,
                    self.handler.handle(&data.content, &data.sender),
                )
                .await
                .unwrap_or(Err(CallbackError::Timeout(self.callback_timeout)));
                match reply {
                    Ok(Some(text)) if !text.is_empty() => {
                        vec![OutboundFrame::Data { content: text }]
                    }
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        warn!(error = %e, sender = %data.sender, "Message handler failed");
                        Vec::new()
                    }
                }
            }
            InboundFrame::Audio(audio) => {
                let analysis = match &self.audio_sink {
                    Some(sink) => {
                        let result =
                            tokio::time::timeout(self.callback_timeout, sink.consume(&audio))
                                .await
                                .unwrap_or(Err(CallbackError::Timeout(self.callback_timeout)));
                        match result {
                            Ok(analysis) => {
                                if analysis.has_speech {
                                    debug!(volume = analysis.volume_level, "Speech activity detected");
                                }
                                Some(analysis)
                            }
                            Err(e) => {
                                warn!(error = %e, bytes = audio.len(), "Audio sink failed");
                                None
                            }
                        }
                    }
                    None => None,
                };
                ctx.stats.record_audio(analysis);
                Vec::new()
            }
            InboundFrame::Ping(_) => {
                let now = Utc::now();
                ctx.stats.mark_heartbeat(now);
                vec![OutboundFrame::Pong {
                    timestamp: now.timestamp(),
                }]
            }
            InboundFrame::Pong(_) => Vec::new(),
            InboundFrame::Unknown { tag } => {
                debug!(%tag, "Ignoring frame with unknown type");
                Vec::new()
            }
        }
    }
}
