//! Group leader backed by the `atvremote` command-line remote.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::airplay::traits::{BridgeError, BridgeResult, GroupLeader, ManagedIdentities};
use crate::airplay::types::{
    GroupOp, NowPlaying, PlaybackCommand, PlaybackState, SpeakerId,
};
use crate::protocol_constants::ATVREMOTE_BINARY_NAME;

/// Settings for [`AtvRemoteLeader`].
#[derive(Debug, Clone)]
pub struct AtvRemoteConfig {
    /// Hardware id of the leader (as announced over mDNS).
    pub id: SpeakerId,
    pub binary: PathBuf,
    pub companion_credentials: Option<String>,
    pub airplay_credentials: Option<String>,
    pub timeout: Duration,
}

impl AtvRemoteConfig {
    pub fn new(id: SpeakerId) -> Self {
        Self {
            id,
            binary: PathBuf::from(ATVREMOTE_BINARY_NAME),
            companion_credentials: None,
            airplay_credentials: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Apple TV (or HomePod) leader driven through `atvremote`.
pub struct AtvRemoteLeader {
    config: AtvRemoteConfig,
}

impl AtvRemoteLeader {
    pub fn new(config: AtvRemoteConfig) -> Self {
        Self { config }
    }

    async fn run(&self, action: &str) -> BridgeResult<String> {
        let mut command = Command::new(&self.config.binary);
        command.arg("--id").arg(self.config.id.as_str());
        if let Some(creds) = &self.config.companion_credentials {
            command.arg("--companion-credentials").arg(creds);
        }
        if let Some(creds) = &self.config.airplay_credentials {
            command.arg("--airplay-credentials").arg(creds);
        }
        command
            .arg(action)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!("[Bridge] atvremote {}", action);
        let child = command
            .spawn()
            .map_err(|e| BridgeError::Unavailable(format!("failed to run atvremote: {e}")))?;

        let limit = self.config.timeout;
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| BridgeError::Timeout(limit))?
            .map_err(|e| BridgeError::Unavailable(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let detail = if stderr.is_empty() { stdout } else { stderr };
        if is_unreachable(&detail) {
            Err(BridgeError::Unavailable(detail))
        } else {
            Err(BridgeError::CommandFailed {
                command: action.split('=').next().unwrap_or(action).to_string(),
                status: output.status.code(),
                stderr: detail,
            })
        }
    }
}

fn is_unreachable(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    ["could not find", "connection", "timed out", "no route"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Pulls every `(ID)` that parses as a hardware id out of `output_devices`.
fn parse_output_devices(output: &str) -> BTreeSet<SpeakerId> {
    let mut ids = BTreeSet::new();
    let mut rest = output;
    while let Some(open) = rest.find('(') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(')') else {
            break;
        };
        if let Some(id) = SpeakerId::parse(&after[..close]) {
            ids.insert(id);
        }
        rest = &after[close + 1..];
    }
    ids
}

/// Parses the `key: value` report printed by `playing`.
fn parse_playing(output: &str) -> NowPlaying {
    let mut now_playing = NowPlaying::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "device state" => now_playing.playback = PlaybackState::from_label(value),
            "title" if !value.is_empty() => now_playing.title = Some(value.to_string()),
            "artist" if !value.is_empty() => now_playing.artist = Some(value.to_string()),
            _ => {}
        }
    }
    now_playing
}

#[async_trait]
impl GroupLeader for AtvRemoteLeader {
    fn leader_id(&self) -> &SpeakerId {
        &self.config.id
    }

    async fn list_managed_identities(&self) -> BridgeResult<ManagedIdentities> {
        let output = self.run("output_devices").await?;
        let mut group_members = parse_output_devices(&output);
        group_members.remove(&self.config.id);
        Ok(ManagedIdentities {
            exclusive: BTreeSet::from([self.config.id.clone()]),
            group_members,
        })
    }

    async fn dispatch_playback(
        &self,
        _target: &SpeakerId,
        command: &PlaybackCommand,
    ) -> BridgeResult<()> {
        // The leader plays for its whole group; the target only selects the group.
        let action = match command {
            PlaybackCommand::Transport(action) => action.as_str().to_string(),
            PlaybackCommand::PlayMedia(media) => format!("play_url={}", media.url),
        };
        self.run(&action).await.map(|_| ())
    }

    async fn dispatch_grouping(&self, target: &SpeakerId, op: &GroupOp) -> BridgeResult<()> {
        let action = match op {
            GroupOp::Join => format!("add_output_devices={target}"),
            GroupOp::Leave => format!("remove_output_devices={target}"),
            GroupOp::Set(members) => {
                let mut ids = vec![target.as_str()];
                ids.extend(
                    members
                        .iter()
                        .filter(|id| *id != target)
                        .map(SpeakerId::as_str),
                );
                format!("set_output_devices={}", ids.join(","))
            }
        };
        self.run(&action).await.map(|_| ())
    }

    async fn now_playing(&self) -> BridgeResult<NowPlaying> {
        let output = self.run("playing").await?;
        Ok(parse_playing(&output))
    }
}
