//! The seam between engine services and whatever consumes their events.

use super::{BridgeEvent, PairingEvent, SessionEvent, SpeakerEvent};

/// Sink for engine events, one method per event category.
///
/// Services hold an `Arc<dyn EventEmitter>`; emitting must never block.
pub trait EventEmitter: Send + Sync {
    fn emit_speaker(&self, event: SpeakerEvent);

    fn emit_session(&self, event: SessionEvent);

    fn emit_pairing(&self, event: PairingEvent);

    fn emit_bridge(&self, event: BridgeEvent);
}

/// Drops everything.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_speaker(&self, _event: SpeakerEvent) {}

    fn emit_session(&self, _event: SessionEvent) {}

    fn emit_pairing(&self, _event: PairingEvent) {}

    fn emit_bridge(&self, _event: BridgeEvent) {}
}

/// Writes events to the `tracing` log.
///
/// Lifecycle changes go out at info, failures at warn. Snapshot updates
/// arrive every poll and are kept at debug.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_speaker(&self, event: SpeakerEvent) {
        match &event {
            SpeakerEvent::Discovered {
                speaker_id, name, ..
            } => tracing::info!(%speaker_id, %name, "speaker discovered"),
            SpeakerEvent::Removed { speaker_id, .. } => {
                tracing::info!(%speaker_id, "speaker removed")
            }
            _ => tracing::debug!(?event, "speaker_event"),
        }
    }

    fn emit_session(&self, event: SessionEvent) {
        match &event {
            SessionEvent::RestartScheduled {
                speaker_id,
                attempt,
                ..
            } => tracing::warn!(%speaker_id, attempt, "session restart scheduled"),
            SessionEvent::Stopped { speaker_id, reason, .. } => {
                tracing::info!(%speaker_id, ?reason, "session stopped")
            }
            _ => tracing::debug!(?event, "session_event"),
        }
    }

    fn emit_pairing(&self, event: PairingEvent) {
        match &event {
            PairingEvent::Failed {
                speaker_id, reason, ..
            } => tracing::warn!(%speaker_id, %reason, "pairing failed"),
            _ => tracing::info!(?event, "pairing_event"),
        }
    }

    fn emit_bridge(&self, event: BridgeEvent) {
        match &event {
            BridgeEvent::Detached {
                leader_id, reason, ..
            } => tracing::warn!(%leader_id, %reason, "group leader detached"),
            BridgeEvent::Attached {
                leader_id,
                exclusive,
                group_members,
                ..
            } => tracing::info!(
                %leader_id,
                exclusive = exclusive.len(),
                members = group_members.len(),
                "group leader attached"
            ),
        }
    }
}
