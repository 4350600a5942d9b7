//! Per-speaker command execution.
//!
//! Commands for one speaker run through that speaker's lane one at a time,
//! in arrival order. Different speakers never wait on each other.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::airplay::traits::{SessionError, SessionHandle, SpeakerBackend};
use crate::airplay::types::{GroupOp, MediaRef, PlaybackCommand, SpeakerId, TransportAction};
use crate::error::{SpeakerError, SpeakerResult};
use crate::services::capability_bridge::{CapabilityBridge, CommandCategory};
use crate::services::session_supervisor::{SessionEntry, SessionTable};
use crate::services::state_coordinator::StateCoordinator;
use crate::state::Config;
use crate::utils::bounded;

/// Direction of a relative volume change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStep {
    Up,
    Down,
}

/// A command addressed to one speaker.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeakerCommand {
    /// Absolute volume in `[0.0, 1.0]`.
    SetVolume(f32),
    StepVolume(VolumeStep),
    SetMute(bool),
    PlayMedia(MediaRef),
    /// Transport control; only a group leader can serve these.
    Transport(TransportAction),
}

impl SpeakerCommand {
    pub fn category(&self) -> CommandCategory {
        match self {
            Self::SetVolume(_) | Self::StepVolume(_) | Self::SetMute(_) => {
                CommandCategory::Volume
            }
            Self::PlayMedia(_) | Self::Transport(_) => CommandCategory::Playback,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SetVolume(_) => "set_volume",
            Self::StepVolume(_) => "step_volume",
            Self::SetMute(_) => "set_mute",
            Self::PlayMedia(_) => "play_media",
            Self::Transport(_) => "transport",
        }
    }

    /// Rejects malformed arguments before anything reaches a session.
    fn validate(&self) -> SpeakerResult<()> {
        match self {
            Self::SetVolume(v) if !(0.0..=1.0).contains(v) => Err(SpeakerError::InvalidArgument(
                format!("volume must be within [0, 1], got {v}"),
            )),
            Self::PlayMedia(media) if media.url.trim().is_empty() => Err(
                SpeakerError::InvalidArgument("media url must not be empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// The bridge form of a playback command.
    fn as_playback(&self) -> Option<PlaybackCommand> {
        match self {
            Self::PlayMedia(media) => Some(PlaybackCommand::PlayMedia(media.clone())),
            Self::Transport(action) => Some(PlaybackCommand::Transport(*action)),
            _ => None,
        }
    }
}

pub struct CommandDispatcher {
    backend: Arc<dyn SpeakerBackend>,
    table: Arc<SessionTable>,
    coordinator: Arc<StateCoordinator>,
    bridge: Arc<CapabilityBridge>,
    config: Config,
}

impl CommandDispatcher {
    pub fn new(
        backend: Arc<dyn SpeakerBackend>,
        table: Arc<SessionTable>,
        coordinator: Arc<StateCoordinator>,
        bridge: Arc<CapabilityBridge>,
        config: Config,
    ) -> Self {
        Self {
            backend,
            table,
            coordinator,
            bridge,
            config,
        }
    }

    /// Applies `command` to `id`.
    ///
    /// Fails with `SessionNotReady` unless the session is running. A
    /// successful command schedules a state refresh for `id`.
    pub async fn dispatch(&self, id: &SpeakerId, command: SpeakerCommand) -> SpeakerResult<()> {
        command.validate()?;
        let category = command.category();

        let Some(entry) = self.table.get(id) else {
            // The leader's own devices have no session but can still take
            // playback through the bridge.
            if let Some(playback) = command.as_playback() {
                if self.bridge.owns(id, category) {
                    return self.bridge.dispatch_playback(id, &playback).await;
                }
            }
            return Err(SpeakerError::SpeakerNotFound(id.to_string()));
        };

        let _lane = entry.lane().lock().await;
        log::debug!("[Dispatcher] {} -> {}", command.name(), id);

        if let Some(playback) = command.as_playback() {
            if self.bridge.owns(id, category) {
                self.bridge.dispatch_playback(id, &playback).await?;
                self.coordinator.request_refresh(id);
                return Ok(());
            }
            if matches!(command, SpeakerCommand::Transport(_)) {
                return Err(SpeakerError::Unsupported(format!(
                    "transport control for {id} needs a group leader"
                )));
            }
        }

        let handle = entry
            .ready_handle()
            .ok_or_else(|| SpeakerError::SessionNotReady(id.clone()))?;
        let run = entry.run_token();
        let cancel = &run;
        let limit = self.config.command_timeout();

        let result = match &command {
            SpeakerCommand::SetVolume(volume) => {
                bounded(cancel, limit, self.backend.set_volume(&handle, *volume)).await
            }
            SpeakerCommand::StepVolume(direction) => {
                let target = self.stepped_volume(&entry, &handle, cancel, *direction).await?;
                bounded(cancel, limit, self.backend.set_volume(&handle, target)).await
            }
            SpeakerCommand::SetMute(muted) => {
                bounded(cancel, limit, self.backend.set_mute(&handle, *muted)).await
            }
            SpeakerCommand::PlayMedia(media) => {
                bounded(
                    cancel,
                    self.config.play_timeout(),
                    self.backend.play(&handle, media),
                )
                .await
            }
            SpeakerCommand::Transport(_) => Ok(()),
        };

        result.map_err(|e| command_error(id, e))?;
        self.coordinator.request_refresh(id);
        Ok(())
    }

    /// Applies a grouping operation through the group leader.
    pub async fn group(&self, id: &SpeakerId, op: GroupOp) -> SpeakerResult<()> {
        if let GroupOp::Set(members) = &op {
            if members.is_empty() {
                return Err(SpeakerError::InvalidArgument(
                    "group must contain at least one speaker".to_string(),
                ));
            }
        }
        if !self.bridge.owns(id, CommandCategory::Grouping) {
            return Err(SpeakerError::Unsupported(format!(
                "grouping for {id} needs a group leader"
            )));
        }

        match self.table.get(id) {
            Some(entry) => {
                let _lane = entry.lane().lock().await;
                self.bridge.dispatch_grouping(id, &op).await?;
            }
            None => self.bridge.dispatch_grouping(id, &op).await?,
        }
        self.coordinator.request_refresh(id);
        Ok(())
    }

    async fn stepped_volume(
        &self,
        entry: &SessionEntry,
        handle: &SessionHandle,
        cancel: &CancellationToken,
        direction: VolumeStep,
    ) -> SpeakerResult<f32> {
        let current = match self.coordinator.snapshot(entry.id()) {
            Some(state) if state.is_available() => state.volume,
            _ => {
                bounded(
                    cancel,
                    self.config.poll_timeout(),
                    self.backend.get_state(handle),
                )
                .await
                .map_err(|e| command_error(entry.id(), e))?
                .volume
            }
        };
        let step = match direction {
            VolumeStep::Up => self.config.volume_step,
            VolumeStep::Down => -self.config.volume_step,
        };
        Ok((current + step).clamp(0.0, 1.0))
    }
}

fn command_error(id: &SpeakerId, err: SessionError) -> SpeakerError {
    match err {
        SessionError::Cancelled | SessionError::NotRunning => {
            SpeakerError::SessionNotReady(id.clone())
        }
        other => {
            log::warn!("[Dispatcher] Command for {} failed: {}", id, other);
            SpeakerError::command(id, other)
        }
    }
}
