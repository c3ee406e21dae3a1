//! Connection statistics shared between the session tasks.
//!
//! Counters are independent atomics so the receive and heartbeat loops can
//! bump them concurrently without read-modify-write races. No cross-field
//! consistency is promised by [`ConnectionStats::snapshot`].

use crate::router::AudioAnalysis;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ConnectionStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    audio_units_processed: AtomicU64,
    connected_since: Mutex<Option<DateTime<Utc>>>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    last_audio: Mutex<Option<AudioAnalysis>>,
}

/// A point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub audio_units_processed: u64,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_audio: Option<AudioAnalysis>,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one audio unit and keeps its analysis, if the sink produced one.
    pub fn record_audio(&self, analysis: Option<AudioAnalysis>) {
        self.audio_units_processed.fetch_add(1, Ordering::Relaxed);
        if let Some(analysis) = analysis {
            *self.last_audio.lock() = Some(analysis);
        }
    }

    pub fn mark_connected(&self, at: DateTime<Utc>) {
        *self.connected_since.lock() = Some(at);
    }

    pub fn mark_heartbeat(&self, at: DateTime<Utc>) {
        *self.last_heartbeat.lock() = Some(at);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn audio_units_processed(&self) -> u64 {
        self.audio_units_processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent(),
            messages_received: self.messages_received(),
            audio_units_processed: self.audio_units_processed(),
            connected_since: *self.connected_since.lock(),
            last_heartbeat: *self.last_heartbeat.lock(),
            last_audio: self.last_audio.lock().clone(),
        }
    }
}
