//! Engine configuration and the shared state snapshot store.
//!
//! [`SpeakerStateStore`] is the read-optimized snapshot map. The state
//! coordinator is its only writer; every other component only reads.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::airplay::types::{DeviceState, NowPlaying, PlaybackState, SpeakerId};
use crate::utils::now_millis;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the speaker engine.
///
/// All fields have sensible defaults; durations are whole seconds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    // State coordination
    /// Interval between scheduled state polls.
    pub poll_interval_secs: u64,
    /// Deadline for one state poll.
    pub poll_timeout_secs: u64,

    // Supervision
    /// Interval between session health checks.
    pub health_check_interval_secs: u64,
    /// Deadline for one health check.
    pub health_check_timeout_secs: u64,
    /// Consecutive health check failures that mark a session crashed.
    pub health_failure_threshold: u32,
    /// First restart delay; doubles per consecutive crash.
    pub restart_backoff_base_secs: u64,
    /// Upper bound on the restart delay.
    pub restart_backoff_max_secs: u64,
    /// Consecutive crashes tolerated before giving up.
    pub max_consecutive_restarts: u32,
    /// Time in `Running` after which the crash counter resets.
    pub stability_threshold_secs: u64,
    /// Deadline for starting a session process.
    pub spawn_timeout_secs: u64,
    /// Grace period between the termination signal and a forced kill.
    pub stop_timeout_secs: u64,

    // Commands
    /// Deadline for volume and mute commands.
    pub command_timeout_secs: u64,
    /// Deadline for media playback commands.
    pub play_timeout_secs: u64,
    /// Step applied by volume up/down, as a fraction of full scale.
    pub volume_step: f32,

    // Pairing
    /// Wrong PINs tolerated per pairing step.
    pub pairing_max_attempts: u32,
    /// How long the user has to enter each PIN.
    pub pairing_pin_timeout_secs: u64,

    // Group leader
    /// Interval between group-leader enumerations.
    pub bridge_refresh_interval_secs: u64,

    // Discovery
    /// Enable mDNS/Bonjour discovery.
    pub discovery_mdns: bool,

    /// Capacity of the event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            poll_timeout_secs: 10,
            health_check_interval_secs: 10,
            health_check_timeout_secs: 5,
            health_failure_threshold: 3,
            restart_backoff_base_secs: 2,
            restart_backoff_max_secs: 60,
            max_consecutive_restarts: 5,
            stability_threshold_secs: 120,
            spawn_timeout_secs: 10,
            stop_timeout_secs: 5,
            command_timeout_secs: 10,
            play_timeout_secs: 30,
            volume_step: 0.05,
            pairing_max_attempts: 3,
            pairing_pin_timeout_secs: 300,
            bridge_refresh_interval_secs: 30,
            discovery_mdns: true,
            event_channel_capacity: 100,
        }
    }
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        let non_zero = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("poll_timeout_secs", self.poll_timeout_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("health_check_timeout_secs", self.health_check_timeout_secs),
            ("restart_backoff_base_secs", self.restart_backoff_base_secs),
            ("spawn_timeout_secs", self.spawn_timeout_secs),
            ("command_timeout_secs", self.command_timeout_secs),
            ("play_timeout_secs", self.play_timeout_secs),
            ("pairing_pin_timeout_secs", self.pairing_pin_timeout_secs),
            (
                "bridge_refresh_interval_secs",
                self.bridge_refresh_interval_secs,
            ),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(format!("{name} must be >= 1"));
            }
        }
        if self.health_failure_threshold == 0 {
            return Err("health_failure_threshold must be >= 1".to_string());
        }
        if self.pairing_max_attempts == 0 {
            return Err("pairing_max_attempts must be >= 1".to_string());
        }
        if self.restart_backoff_max_secs < self.restart_backoff_base_secs {
            return Err(
                "restart_backoff_max_secs must be >= restart_backoff_base_secs".to_string(),
            );
        }
        if !(self.volume_step > 0.0 && self.volume_step <= 1.0) {
            return Err("volume_step must be in (0, 1]".to_string());
        }
        if self.event_channel_capacity == 0 {
            return Err(
                "event_channel_capacity must be >= 1 (broadcast::channel panics on 0)".to_string(),
            );
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn restart_backoff_base(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_base_secs)
    }

    pub fn restart_backoff_max(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_max_secs)
    }

    pub fn stability_threshold(&self) -> Duration {
        Duration::from_secs(self.stability_threshold_secs)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn play_timeout(&self) -> Duration {
        Duration::from_secs(self.play_timeout_secs)
    }

    pub fn pairing_pin_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_pin_timeout_secs)
    }

    pub fn bridge_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.bridge_refresh_interval_secs)
    }

    /// Oldest snapshot that may still be reported as available.
    pub fn staleness_bound(&self) -> Duration {
        self.poll_interval() * 2
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Speaker State Snapshots
// ─────────────────────────────────────────────────────────────────────────────

/// Whether the latest snapshot reflects a reachable speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Available,
    Unavailable,
}

/// Coordinator-owned snapshot of one speaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerState {
    /// Volume in `[0.0, 1.0]`.
    pub volume: f32,
    pub muted: bool,
    pub playback: PlaybackState,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub availability: Availability,
    /// Unix timestamp (ms) of the last successful poll.
    pub last_updated_at: u64,
    #[serde(skip)]
    polled_at: Instant,
}

impl SpeakerState {
    fn from_device(device: DeviceState) -> Self {
        Self {
            volume: device.volume.clamp(0.0, 1.0),
            muted: device.muted,
            playback: device.playback,
            title: device.title,
            artist: device.artist,
            availability: Availability::Available,
            last_updated_at: now_millis(),
            polled_at: Instant::now(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }

    /// Age of the data in this snapshot.
    pub fn age(&self) -> Duration {
        self.polled_at.elapsed()
    }
}

/// Shared, read-optimized map of speaker snapshots.
///
/// Each entry is written under its own shard lock, so writers for different
/// speakers never contend on a global lock.
#[derive(Debug, Default)]
pub struct SpeakerStateStore {
    snapshots: DashMap<SpeakerId, SpeakerState>,
}

impl SpeakerStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a fresh snapshot from a successful poll.
    ///
    /// Returns the stored snapshot.
    pub(crate) fn publish(&self, id: &SpeakerId, device: DeviceState) -> SpeakerState {
        let state = SpeakerState::from_device(device);
        self.snapshots.insert(id.clone(), state.clone());
        state
    }

    /// Flips an existing snapshot to unavailable, keeping the last values.
    ///
    /// Returns the updated snapshot if it changed.
    pub(crate) fn mark_unavailable(&self, id: &SpeakerId) -> Option<SpeakerState> {
        let mut entry = self.snapshots.get_mut(id)?;
        if entry.availability == Availability::Unavailable {
            return None;
        }
        entry.availability = Availability::Unavailable;
        Some(entry.clone())
    }

    /// Overlays group-leader playback info onto an available snapshot.
    pub(crate) fn apply_now_playing(&self, id: &SpeakerId, now_playing: &NowPlaying) -> bool {
        match self.snapshots.get_mut(id) {
            Some(mut entry) if entry.is_available() => {
                entry.playback = now_playing.playback;
                entry.title = now_playing.title.clone();
                entry.artist = now_playing.artist.clone();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove(&self, id: &SpeakerId) -> bool {
        self.snapshots.remove(id).is_some()
    }

    /// Reads a snapshot, demoting it to unavailable if older than `max_age`.
    pub fn get(&self, id: &SpeakerId, max_age: Duration) -> Option<SpeakerState> {
        self.snapshots
            .get(id)
            .map(|entry| enforce_staleness(entry.clone(), max_age))
    }
}

fn enforce_staleness(mut state: SpeakerState, max_age: Duration) -> SpeakerState {
    if state.is_available() && state.age() > max_age {
        state.availability = Availability::Unavailable;
    }
    state
}
