//! Default collaborators plugged into the event router by the `agent` binary.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use roomlink_core::{AudioAnalysis, AudioSink, CallbackError, MessageHandler};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

const DEFAULT_HISTORY: usize = 100;

/// One message seen by [`KeywordReplies`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub sender: String,
    pub text: String,
    pub received_at: DateTime<Local>,
}

/// Answers a handful of keywords and acknowledges everything else.
pub struct KeywordReplies {
    agent_name: String,
    history: Mutex<VecDeque<HistoryEntry>>,
    max_history: usize,
}

impl KeywordReplies {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            history: Mutex::new(VecDeque::new()),
            max_history: DEFAULT_HISTORY,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// The most recent `limit` messages, oldest first.
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    fn remember(&self, text: &str, sender: &str) {
        let mut history = self.history.lock();
        history.push_back(HistoryEntry {
            sender: sender.to_string(),
            text: text.to_string(),
            received_at: Local::now(),
        });
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    fn reply_to(&self, text: &str, sender: &str) -> String {
        let lower = text.to_lowercase();
        let has = |keywords: &[&str]| {
            lower
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| keywords.contains(&word))
        };

        if has(&["hello", "hi"]) {
            format!("Hello {sender}! I'm {}, nice to meet you!", self.agent_name)
        } else if has(&["time"]) {
            format!("The time is {}", Local::now().format("%Y-%m-%d %H:%M:%S"))
        } else if has(&["help"]) {
            "I'm a local room agent. I handle audio and text messages; try saying hello or asking for the time!".to_string()
        } else if has(&["bye", "goodbye"]) {
            format!("Goodbye {sender}! See you next time!")
        } else {
            format!("Got your message: {text}")
        }
    }
}

#[async_trait]
impl MessageHandler for KeywordReplies {
    async fn handle(&self, text: &str, sender: &str) -> Result<Option<String>, CallbackError> {
        self.remember(text, sender);
        let reply = self.reply_to(text.trim(), sender);
        info!(%sender, %text, %reply, "Replying to message");
        Ok(Some(reply))
    }
}

/// Estimates audio activity from chunk size alone. Assumes 16 kHz, 16-bit
/// mono PCM.
pub struct ByteLengthAudioSink {
    sample_rate: u32,
    speaking: AtomicBool,
}

impl ByteLengthAudioSink {
    pub const SPEECH_THRESHOLD_BYTES: usize = 100;

    pub fn new() -> Self {
        Self {
            sample_rate: 16_000,
            speaking: AtomicBool::new(false),
        }
    }

    pub fn analyze(&self, audio: &[u8]) -> AudioAnalysis {
        let volume_level = (audio.len() as f32 / 1000.0).min(1.0);
        let bytes_per_second = f64::from(self.sample_rate) * 2.0;
        AudioAnalysis {
            volume_level,
            has_speech: audio.len() > Self::SPEECH_THRESHOLD_BYTES,
            duration: Duration::from_secs_f64(audio.len() as f64 / bytes_per_second),
        }
    }
}

impl Default for ByteLengthAudioSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioSink for ByteLengthAudioSink {
    async fn consume(&self, audio: &[u8]) -> Result<AudioAnalysis, CallbackError> {
        let analysis = self.analyze(audio);
        let was_speaking = self.speaking.swap(analysis.has_speech, Ordering::Relaxed);
        if was_speaking != analysis.has_speech {
            info!(
                speaking = analysis.has_speech,
                volume = analysis.volume_level,
                "Voice activity changed"
            );
        }
        Ok(analysis)
    }
}
