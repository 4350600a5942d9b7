//! Event system for real-time state publication.
//!
//! This module provides:
//! - [`EventEmitter`] trait for domain services to emit events
//! - [`BroadcastEventBridge`] for fan-out to any number of subscribers
//! - Event types for speakers, sessions, pairing and the group-leader bridge

mod bridge;
mod emitter;

pub use bridge::BroadcastEventBridge;
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

use crate::airplay::types::{PairingStep, ProtocolVersion, SpeakerId};
use crate::services::session_supervisor::{SessionPhase, StopReason};
use crate::state::SpeakerState;

/// Events broadcast to subscribers.
///
/// Each category has its own inner event type with specific variants.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum BroadcastEvent {
    /// Identity and state snapshot changes.
    Speaker(SpeakerEvent),

    /// Session lifecycle transitions.
    Session(SessionEvent),

    /// Pairing flow progress.
    Pairing(PairingEvent),

    /// Group-leader bridge attachment changes.
    Bridge(BridgeEvent),
}

/// Events about speaker identities and their state snapshots.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SpeakerEvent {
    /// A new identity was accepted.
    Discovered {
        #[serde(rename = "speakerId")]
        speaker_id: SpeakerId,
        name: String,
        protocol: ProtocolVersion,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// An announcement was not turned into a session.
    Ignored {
        #[serde(rename = "speakerId")]
        speaker_id: SpeakerId,
        reason: String,
        timestamp: u64,
    },
    /// The coordinator published a new snapshot.
    StateChanged {
        #[serde(rename = "speakerId")]
        speaker_id: SpeakerId,
        state: SpeakerState,
        timestamp: u64,
    },
    /// The speaker was removed (user action or lost from the network).
    Removed {
        #[serde(rename = "speakerId")]
        speaker_id: SpeakerId,
        timestamp: u64,
    },
}

/// Events about session supervision.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// The supervisor moved a session to a new phase.
    PhaseChanged {
        #[serde(rename = "speakerId")]
        speaker_id: SpeakerId,
        phase: SessionPhase,
        timestamp: u64,
    },
    /// The session crashed and a restart is scheduled.
    RestartScheduled {
        #[serde(rename = "speakerId")]
        speaker_id: SpeakerId,
        attempt: u32,
        /// Unix timestamp (ms) when the restart will be attempted.
        #[serde(rename = "backoffUntil")]
        backoff_until: u64,
        timestamp: u64,
    },
    /// The supervisor stopped for good.
    Stopped {
        #[serde(rename = "speakerId")]
        speaker_id: SpeakerId,
        reason: StopReason,
        timestamp: u64,
    },
}

/// Events about the HAP pairing flow.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PairingEvent {
    /// The device is displaying a PIN for `step`.
    PinRequested {
        #[serde(rename = "speakerId")]
        speaker_id: SpeakerId,
        step: PairingStep,
        timestamp: u64,
    },
    /// A wrong PIN was entered; the same step is waiting again.
    PinRejected {
        #[serde(rename = "speakerId")]
        speaker_id: SpeakerId,
        step: PairingStep,
        #[serde(rename = "attemptsLeft")]
        attempts_left: u32,
        timestamp: u64,
    },
    /// Pairing produced a credential.
    Completed {
        #[serde(rename = "speakerId")]
        speaker_id: SpeakerId,
        timestamp: u64,
    },
    /// Pairing ended without a credential.
    Failed {
        #[serde(rename = "speakerId")]
        speaker_id: SpeakerId,
        reason: String,
        timestamp: u64,
    },
}

/// Events about the group-leader bridge.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeEvent {
    /// The bridge enumerated its managed identities.
    Attached {
        #[serde(rename = "leaderId")]
        leader_id: SpeakerId,
        exclusive: Vec<SpeakerId>,
        #[serde(rename = "groupMembers")]
        group_members: Vec<SpeakerId>,
        timestamp: u64,
    },
    /// The bridge became unavailable; its command surface is withdrawn.
    Detached {
        #[serde(rename = "leaderId")]
        leader_id: SpeakerId,
        reason: String,
        timestamp: u64,
    },
}
