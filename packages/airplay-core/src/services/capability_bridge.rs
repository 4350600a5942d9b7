//! Optional group-leader bridge.
//!
//! When a configured group leader (e.g. an Apple TV) is seen on the network,
//! the bridge enumerates the identities it manages. Its exclusive set feeds the
//! identity registry's externally-owned set; its group members keep their
//! direct sessions but get playback and grouping routed through the leader.
//!
//! If the leader becomes unreachable the command surface is withdrawn
//! immediately. Snapshots and direct sessions are untouched.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::airplay::traits::{BridgeError, BridgeResult, GroupLeader, ManagedIdentities};
use crate::airplay::types::{GroupOp, NowPlaying, PlaybackCommand, SpeakerId};
use crate::error::{ErrorCode, SpeakerError, SpeakerResult};
use crate::events::{BridgeEvent, EventEmitter};
use crate::protocol_constants::{
    BRIDGE_MAX_RECONNECT_ATTEMPTS, BRIDGE_RECONNECT_BACKOFF_BASE_SECS,
    BRIDGE_RECONNECT_BACKOFF_MAX_SECS,
};
use crate::state::Config;
use crate::utils::{backoff_delay, now_millis};

/// Command categories the bridge may take over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCategory {
    Volume,
    Playback,
    Grouping,
}

/// Snapshot of the bridge for the outward surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub leader_id: Option<SpeakerId>,
    pub attached: bool,
    pub exclusive: Vec<SpeakerId>,
    pub group_members: Vec<SpeakerId>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct BridgeState {
    attached: bool,
    managed: ManagedIdentities,
    last_error: Option<String>,
}

/// Routes rich commands through an attached group leader.
pub struct CapabilityBridge {
    leader: RwLock<Option<Arc<dyn GroupLeader>>>,
    state: RwLock<BridgeState>,
    emitter: Arc<dyn EventEmitter>,
    config: Config,
}

impl CapabilityBridge {
    pub fn new(emitter: Arc<dyn EventEmitter>, config: Config) -> Self {
        Self {
            leader: RwLock::new(None),
            state: RwLock::new(BridgeState::default()),
            emitter,
            config,
        }
    }

    /// Registers the group leader to watch for. The bridge stays detached
    /// until [`attach`](Self::attach) succeeds.
    pub fn configure(&self, leader: Arc<dyn GroupLeader>) {
        log::info!("[Bridge] Group leader configured: {}", leader.leader_id());
        *self.leader.write() = Some(leader);
    }

    pub fn leader_id(&self) -> Option<SpeakerId> {
        self.leader.read().as_ref().map(|l| l.leader_id().clone())
    }

    pub fn is_leader(&self, id: &SpeakerId) -> bool {
        self.leader
            .read()
            .as_ref()
            .is_some_and(|l| l.leader_id() == id)
    }

    pub fn is_attached(&self) -> bool {
        self.state.read().attached
    }

    fn leader(&self) -> Option<Arc<dyn GroupLeader>> {
        self.leader.read().clone()
    }

    /// Enumerates the leader's identities and activates the command surface.
    ///
    /// The leader's own id is always part of the exclusive set.
    pub async fn attach(&self) -> BridgeResult<ManagedIdentities> {
        let leader = self
            .leader()
            .ok_or_else(|| BridgeError::Unavailable("no group leader configured".into()))?;

        let limit = self.config.command_timeout();
        let listed = tokio::time::timeout(limit, leader.list_managed_identities())
            .await
            .map_err(|_| BridgeError::Timeout(limit))
            .and_then(|r| r);

        let mut managed = match listed {
            Ok(managed) => managed,
            Err(e) => {
                self.detach(&e.to_string());
                return Err(e);
            }
        };
        managed.exclusive.insert(leader.leader_id().clone());
        managed.group_members.retain(|id| !managed.exclusive.contains(id));

        let changed = {
            let mut state = self.state.write();
            let changed = !state.attached || state.managed != managed;
            state.attached = true;
            state.managed = managed.clone();
            state.last_error = None;
            changed
        };

        if changed {
            log::info!(
                "[Bridge] Attached to {}: {} exclusive, {} group member(s)",
                leader.leader_id(),
                managed.exclusive.len(),
                managed.group_members.len()
            );
            self.emitter.emit_bridge(BridgeEvent::Attached {
                leader_id: leader.leader_id().clone(),
                exclusive: managed.exclusive.iter().cloned().collect(),
                group_members: managed.group_members.iter().cloned().collect(),
                timestamp: now_millis(),
            });
        }
        Ok(managed)
    }

    /// Re-enumerates the leader, retrying with exponential backoff.
    ///
    /// Gives up after the reconnect budget and leaves the bridge detached.
    pub async fn reconnect(&self, cancel: &CancellationToken) -> BridgeResult<ManagedIdentities> {
        let base = Duration::from_secs(BRIDGE_RECONNECT_BACKOFF_BASE_SECS);
        let max = Duration::from_secs(BRIDGE_RECONNECT_BACKOFF_MAX_SECS);
        let mut attempt = 0;

        loop {
            match self.attach().await {
                Ok(managed) => return Ok(managed),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= BRIDGE_MAX_RECONNECT_ATTEMPTS {
                        log::warn!(
                            "[Bridge] Giving up after {} reconnect attempts ({}): {}",
                            attempt,
                            e.code(),
                            e
                        );
                        return Err(e);
                    }
                    let delay = backoff_delay(base, max, attempt);
                    log::debug!("[Bridge] Reconnect attempt {} in {:?}", attempt + 1, delay);
                    tokio::select! {
                        () = cancel.cancelled() => return Err(e),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Withdraws the command surface. The exclusive set is kept so that
    /// devices the leader owns are not taken over while it is unreachable.
    pub fn detach(&self, reason: &str) {
        let was_attached = {
            let mut state = self.state.write();
            let was = state.attached;
            state.attached = false;
            state.managed.group_members.clear();
            state.last_error = Some(reason.to_string());
            was
        };
        if !was_attached {
            return;
        }
        let Some(leader_id) = self.leader_id() else {
            return;
        };
        log::warn!("[Bridge] Detached from {}: {}", leader_id, reason);
        self.emitter.emit_bridge(BridgeEvent::Detached {
            leader_id,
            reason: reason.to_string(),
            timestamp: now_millis(),
        });
    }

    /// Ids that must never get a direct session.
    pub fn externally_owned(&self) -> BTreeSet<SpeakerId> {
        self.state.read().managed.exclusive.clone()
    }

    /// Whether the bridge currently serves `category` for `id`.
    ///
    /// Volume and mute always stay on the direct session.
    pub fn owns(&self, id: &SpeakerId, category: CommandCategory) -> bool {
        if category == CommandCategory::Volume {
            return false;
        }
        let state = self.state.read();
        state.attached
            && (state.managed.group_members.contains(id) || state.managed.exclusive.contains(id))
    }

    /// Group members whose playback info comes from the leader.
    pub fn group_members(&self) -> Vec<SpeakerId> {
        let state = self.state.read();
        if state.attached {
            state.managed.group_members.iter().cloned().collect()
        } else {
            Vec::new()
        }
    }

    pub async fn dispatch_playback(
        &self,
        id: &SpeakerId,
        command: &PlaybackCommand,
    ) -> SpeakerResult<()> {
        let leader = self.owning_leader(id, CommandCategory::Playback)?;
        let limit = match command {
            PlaybackCommand::PlayMedia(_) => self.config.play_timeout(),
            PlaybackCommand::Transport(_) => self.config.command_timeout(),
        };
        let result = tokio::time::timeout(limit, leader.dispatch_playback(id, command))
            .await
            .map_err(|_| BridgeError::Timeout(limit))
            .and_then(|r| r);
        self.settle(id, result)
    }

    pub async fn dispatch_grouping(&self, id: &SpeakerId, op: &GroupOp) -> SpeakerResult<()> {
        let leader = self.owning_leader(id, CommandCategory::Grouping)?;
        let limit = self.config.command_timeout();
        let result = tokio::time::timeout(limit, leader.dispatch_grouping(id, op))
            .await
            .map_err(|_| BridgeError::Timeout(limit))
            .and_then(|r| r);
        self.settle(id, result)
    }

    /// Leader's now-playing info, if attached.
    pub async fn now_playing(&self) -> Option<NowPlaying> {
        if !self.is_attached() {
            return None;
        }
        let leader = self.leader()?;
        let limit = self.config.poll_timeout();
        match tokio::time::timeout(limit, leader.now_playing()).await {
            Ok(Ok(now_playing)) => Some(now_playing),
            Ok(Err(e)) => {
                log::debug!("[Bridge] now_playing failed: {}", e);
                if matches!(e, BridgeError::Unavailable(_)) {
                    self.detach(&e.to_string());
                }
                None
            }
            Err(_) => {
                log::debug!("[Bridge] now_playing timed out after {:?}", limit);
                None
            }
        }
    }

    pub fn status(&self) -> BridgeStatus {
        let state = self.state.read();
        BridgeStatus {
            leader_id: self.leader_id(),
            attached: state.attached,
            exclusive: state.managed.exclusive.iter().cloned().collect(),
            group_members: state.managed.group_members.iter().cloned().collect(),
            last_error: state.last_error.clone(),
        }
    }

    fn owning_leader(
        &self,
        id: &SpeakerId,
        category: CommandCategory,
    ) -> SpeakerResult<Arc<dyn GroupLeader>> {
        if !self.owns(id, category) {
            return Err(SpeakerError::Unsupported(format!(
                "no group leader serves {category:?} commands for {id}"
            )));
        }
        self.leader()
            .ok_or_else(|| SpeakerError::Unsupported("no group leader configured".into()))
    }

    fn settle(&self, id: &SpeakerId, result: BridgeResult<()>) -> SpeakerResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e, BridgeError::Unavailable(_)) {
                    self.detach(&e.to_string());
                }
                Err(SpeakerError::command(id, e))
            }
        }
    }
}
