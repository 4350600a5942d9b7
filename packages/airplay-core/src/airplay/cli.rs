//! Session backend driving the external `cliairplay` binary.
//!
//! One long-running process per speaker holds the session; state queries,
//! volume, playback and pairing run as one-shot invocations addressed to the
//! same host and port.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::airplay::traits::{
    PairingBackend, SessionBackend, SessionError, SessionHandle, SessionResult, SessionTarget,
};
use crate::airplay::types::{DeviceState, MediaRef, PairingCredential, PairingStep, PlaybackState};
use crate::protocol_constants::{
    CLI_BINARY_NAME, EXIT_CREDENTIAL_REJECTED, EXIT_WRONG_PIN, STARTUP_GRACE_MS,
    SUPPORTED_PLATFORMS,
};
use crate::runtime::{TaskSpawner, TokioSpawner};

/// Settings for [`CliAirplayBackend`].
#[derive(Debug, Clone)]
pub struct CliAirplayConfig {
    /// Explicit binary path; overrides the per-platform lookup in `bin_dir`.
    pub binary: Option<PathBuf>,
    /// Directory holding `cliairplay-<os>-<arch>` builds.
    pub bin_dir: PathBuf,
    /// How long a fresh process must survive before it counts as started.
    pub startup_grace: Duration,
    pub command_timeout: Duration,
    pub play_timeout: Duration,
}

impl Default for CliAirplayConfig {
    fn default() -> Self {
        Self {
            binary: None,
            bin_dir: PathBuf::from("bin"),
            startup_grace: Duration::from_millis(STARTUP_GRACE_MS),
            command_timeout: Duration::from_secs(10),
            play_timeout: Duration::from_secs(30),
        }
    }
}

/// Platform suffix of the bundled binary for `os`/`arch`, if one is shipped.
pub fn platform_suffix(os: &str, arch: &str) -> Option<&'static str> {
    SUPPORTED_PLATFORMS
        .iter()
        .find(|(o, a, _)| *o == os && *a == arch)
        .map(|(_, _, suffix)| *suffix)
}

/// Locates the binary for the running platform.
pub fn resolve_binary(config: &CliAirplayConfig) -> SessionResult<PathBuf> {
    let path = match &config.binary {
        Some(path) => path.clone(),
        None => {
            let suffix = platform_suffix(std::env::consts::OS, std::env::consts::ARCH)
                .ok_or_else(|| {
                    SessionError::BinaryNotFound(format!(
                        "no {} build for {}-{}",
                        CLI_BINARY_NAME,
                        std::env::consts::OS,
                        std::env::consts::ARCH
                    ))
                })?;
            config.bin_dir.join(format!("{CLI_BINARY_NAME}-{suffix}"))
        }
    };
    if path.is_file() {
        Ok(path)
    } else {
        Err(SessionError::BinaryNotFound(path.display().to_string()))
    }
}

/// `status` reply of the binary.
#[derive(Debug, Deserialize)]
struct StatusReply {
    /// Percent, 0-100.
    volume: f64,
    #[serde(default)]
    muted: bool,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    artist: Option<String>,
}

fn parse_status(stdout: &str) -> SessionResult<DeviceState> {
    let reply: StatusReply = serde_json::from_str(stdout.trim())
        .map_err(|e| SessionError::InvalidResponse(format!("status: {e}")))?;
    Ok(DeviceState {
        volume: (reply.volume / 100.0).clamp(0.0, 1.0) as f32,
        muted: reply.muted,
        playback: reply
            .state
            .as_deref()
            .map(PlaybackState::from_label)
            .unwrap_or_default(),
        title: reply.title.filter(|t| !t.is_empty()),
        artist: reply.artist.filter(|a| !a.is_empty()),
    })
}

/// Volume in `[0, 1]` as the binary's integer percent.
fn volume_percent(volume: f32) -> u8 {
    (volume * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Backend spawning `cliairplay` processes.
pub struct CliAirplayBackend {
    config: CliAirplayConfig,
    spawner: TokioSpawner,
}

impl CliAirplayBackend {
    pub fn new(config: CliAirplayConfig, spawner: TokioSpawner) -> Self {
        Self { config, spawner }
    }

    fn command(
        &self,
        binary: &Path,
        target: &SessionTarget,
        credential: Option<&PairingCredential>,
    ) -> Command {
        let mut command = Command::new(binary);
        command
            .arg("--host")
            .arg(target.route.address.to_string())
            .arg("--port")
            .arg(target.route.port.to_string());
        if let Some(credential) = credential {
            command.arg("--credentials").arg(credential.expose());
        }
        command.kill_on_drop(true);
        command
    }

    /// Runs a one-shot invocation and returns its trimmed stdout.
    async fn run(
        &self,
        target: &SessionTarget,
        credential: Option<&PairingCredential>,
        args: &[&str],
        limit: Duration,
    ) -> SessionResult<String> {
        let binary = resolve_binary(&self.config)?;
        // Never log more than the subcommand; later args may carry a PIN.
        let label = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
        log::debug!("[CliAirplay] {} `{}`", target.id, label);

        let child = self
            .command(&binary, target, credential)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SessionError::Spawn)?;

        // Dropping the child on timeout kills it.
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| SessionError::Timeout(limit))?
            .map_err(SessionError::Spawn)?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            log::debug!("[CliAirplay] {} stderr: {}", target.id, stderr);
        }

        if output.status.success() {
            Ok(stdout)
        } else {
            Err(SessionError::CommandFailed {
                command: label,
                status: output.status.code(),
                stderr: if stderr.is_empty() { stdout } else { stderr },
            })
        }
    }

    /// Forwards the long-running process's stderr to the debug log.
    fn drain_stderr(&self, child: &mut Child, target: &SessionTarget) {
        let Some(stderr) = child.stderr.take() else {
            return;
        };
        let id = target.id.clone();
        self.spawner.spawn("cliairplay_stderr", async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("[CliAirplay] {}: {}", id, line);
            }
        });
    }
}

#[async_trait]
impl SessionBackend for CliAirplayBackend {
    async fn start(
        &self,
        target: &SessionTarget,
        credential: Option<&PairingCredential>,
    ) -> SessionResult<SessionHandle> {
        let binary = resolve_binary(&self.config)?;
        let mut child = self
            .command(&binary, target, credential)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SessionError::Spawn)?;
        self.drain_stderr(&mut child, target);

        tokio::time::sleep(self.config.startup_grace).await;
        match child.try_wait().map_err(SessionError::Spawn)? {
            Some(status) if status.code() == Some(EXIT_CREDENTIAL_REJECTED) => {
                Err(SessionError::CredentialRejected)
            }
            Some(status) => Err(SessionError::Exited(status.code())),
            None => {
                log::info!(
                    "[CliAirplay] Session for {} started (pid {:?})",
                    target.id,
                    child.id()
                );
                Ok(SessionHandle::with_process(
                    target.clone(),
                    credential.cloned(),
                    child,
                ))
            }
        }
    }

    async fn health_check(&self, handle: &SessionHandle) -> SessionResult<()> {
        let mut slot = handle.process().lock().await;
        let child = slot.as_mut().ok_or(SessionError::NotRunning)?;
        match child.try_wait().map_err(SessionError::Spawn)? {
            None => Ok(()),
            Some(status) => Err(SessionError::Exited(status.code())),
        }
    }

    async fn authenticate_legacy(
        &self,
        handle: &SessionHandle,
        credential: Option<&PairingCredential>,
    ) -> SessionResult<()> {
        let Some(credential) = credential else {
            return Ok(());
        };
        self.run(
            handle.target(),
            None,
            &["auth", "--credentials", credential.expose()],
            self.config.command_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn get_state(&self, handle: &SessionHandle) -> SessionResult<DeviceState> {
        let stdout = self
            .run(
                handle.target(),
                handle.credential(),
                &["status"],
                self.config.command_timeout,
            )
            .await?;
        parse_status(&stdout)
    }

    async fn set_volume(&self, handle: &SessionHandle, volume: f32) -> SessionResult<()> {
        let percent = volume_percent(volume).to_string();
        self.run(
            handle.target(),
            handle.credential(),
            &["volume", "set", &percent],
            self.config.command_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn set_mute(&self, handle: &SessionHandle, muted: bool) -> SessionResult<()> {
        let value = if muted { "on" } else { "off" };
        self.run(
            handle.target(),
            handle.credential(),
            &["mute", "set", value],
            self.config.command_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn play(&self, handle: &SessionHandle, media: &MediaRef) -> SessionResult<()> {
        self.run(
            handle.target(),
            handle.credential(),
            &["play", &media.url, "--content-type", &media.content_type],
            self.config.play_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn stop(&self, handle: &SessionHandle, grace: Duration) -> SessionResult<()> {
        let Some(mut child) = handle.process().lock().await.take() else {
            return Ok(());
        };
        let id = &handle.target().id;

        terminate(&child);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                log::debug!("[CliAirplay] {} exited with {}", id, status);
                Ok(())
            }
            Ok(Err(e)) => Err(SessionError::Spawn(e)),
            Err(_) => {
                log::warn!(
                    "[CliAirplay] {} ignored SIGTERM for {:?}, killing",
                    id,
                    grace
                );
                child.kill().await.map_err(SessionError::Spawn)
            }
        }
    }
}

/// Asks the process to exit.
#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` belongs to a child we still own and have not reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

/// No graceful signal off unix; the grace period just elapses before the kill.
#[cfg(not(unix))]
fn terminate(_child: &Child) {}

#[async_trait]
impl PairingBackend for CliAirplayBackend {
    async fn request_pin(&self, target: &SessionTarget, step: PairingStep) -> SessionResult<()> {
        let step = step.number().to_string();
        self.run(
            target,
            None,
            &["pair", "begin", "--step", &step],
            self.config.command_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn verify_pin(
        &self,
        target: &SessionTarget,
        step: PairingStep,
        pin: &str,
    ) -> SessionResult<()> {
        let step = step.number().to_string();
        match self
            .run(
                target,
                None,
                &["pair", "verify", "--step", &step, "--pin", pin],
                self.config.command_timeout,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(SessionError::CommandFailed {
                status: Some(EXIT_WRONG_PIN),
                ..
            }) => Err(SessionError::WrongPin),
            Err(e) => Err(e),
        }
    }

    async fn finish(&self, target: &SessionTarget) -> SessionResult<PairingCredential> {
        let stdout = self
            .run(target, None, &["pair", "finish"], self.config.command_timeout)
            .await?;
        if stdout.is_empty() {
            return Err(SessionError::InvalidResponse(
                "pairing returned an empty credential".to_string(),
            ));
        }
        Ok(PairingCredential::new(stdout))
    }

    async fn abort(&self, target: &SessionTarget) {
        if let Err(e) = self
            .run(target, None, &["pair", "abort"], self.config.command_timeout)
            .await
        {
            log::debug!("[CliAirplay] pair abort for {} failed: {}", target.id, e);
        }
    }
}
