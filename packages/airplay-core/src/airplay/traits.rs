//! Trait abstractions for the external speaker capabilities.
//!
//! These traits enable dependency injection for testability and modularity.
//! The engine depends on them rather than on the concrete protocol binary or
//! group-leader remote, so every service can be exercised with fakes.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::airplay::types::{
    DeviceState, GroupOp, MediaRef, NowPlaying, PairingCredential, PairingStep, PlaybackCommand,
    ProtocolVersion, SpeakerId, SpeakerRoute,
};

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by a session backend.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The protocol binary could not be located for this platform.
    #[error("protocol binary not found: {0}")]
    BinaryNotFound(String),

    /// Spawning the session process failed.
    #[error("failed to spawn session process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The call did not complete within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The long-running session process has exited.
    #[error("session process exited (code {0:?})")]
    Exited(Option<i32>),

    /// A one-shot control command reported failure.
    #[error("command `{command}` failed (code {status:?}): {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// The peer answered with something we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The device refused the stored pairing credential.
    #[error("device rejected the pairing credential")]
    CredentialRejected,

    /// The device refused a pairing PIN.
    #[error("wrong pairing PIN")]
    WrongPin,

    /// The handle no longer refers to a live session.
    #[error("session is not running")]
    NotRunning,

    /// The operation was abandoned because its session is stopping.
    #[error("operation cancelled")]
    Cancelled,
}

impl SessionError {
    /// Returns true if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::BinaryNotFound(_) | Self::CredentialRejected | Self::Cancelled
        )
    }
}

/// Convenient Result alias for session backend operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised by a group-leader controller.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The leader could not be reached.
    #[error("group leader unavailable: {0}")]
    Unavailable(String),

    /// A remote command reported failure.
    #[error("group leader command `{command}` failed (code {status:?}): {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// The leader's output could not be parsed.
    #[error("invalid group leader response: {0}")]
    InvalidResponse(String),

    /// The call did not complete within its deadline.
    #[error("group leader call timed out after {0:?}")]
    Timeout(Duration),
}

impl BridgeError {
    /// Returns true if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidResponse(_))
    }
}

/// Convenient Result alias for group-leader operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

// ─────────────────────────────────────────────────────────────────────────────
// Session Handles
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a backend needs to address one speaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub id: SpeakerId,
    pub route: SpeakerRoute,
    pub protocol: ProtocolVersion,
}

/// A live session produced by [`SessionBackend::start`].
///
/// The optional process slot is owned exclusively by this handle; `stop`
/// takes the child out of the slot so it is released exactly once.
#[derive(Debug)]
pub struct SessionHandle {
    target: SessionTarget,
    credential: Option<PairingCredential>,
    process: Mutex<Option<Child>>,
}

impl SessionHandle {
    /// Handle backed by a long-running child process.
    pub fn with_process(
        target: SessionTarget,
        credential: Option<PairingCredential>,
        child: Child,
    ) -> Self {
        Self {
            target,
            credential,
            process: Mutex::new(Some(child)),
        }
    }

    /// Handle with no local process (remote or simulated sessions).
    pub fn detached(target: SessionTarget, credential: Option<PairingCredential>) -> Self {
        Self {
            target,
            credential,
            process: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    pub fn credential(&self) -> Option<&PairingCredential> {
        self.credential.as_ref()
    }

    /// Slot holding the session process, if any.
    pub fn process(&self) -> &Mutex<Option<Child>> {
        &self.process
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Control
// ─────────────────────────────────────────────────────────────────────────────

/// Control interface to one speaker's protocol session.
///
/// Implementations must not apply their own retry policy; callers bound every
/// call with a timeout and treat a timeout like any other failure.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Starts a session, optionally presenting a stored credential.
    ///
    /// Returns [`SessionError::CredentialRejected`] when the device refuses it.
    async fn start(
        &self,
        target: &SessionTarget,
        credential: Option<&PairingCredential>,
    ) -> SessionResult<SessionHandle>;

    /// Liveness check.
    async fn health_check(&self, handle: &SessionHandle) -> SessionResult<()>;

    /// Legacy (AirPlay 1) credential exchange. A `None` credential is a no-op.
    async fn authenticate_legacy(
        &self,
        handle: &SessionHandle,
        credential: Option<&PairingCredential>,
    ) -> SessionResult<()>;

    /// Queries volume, mute, playback and metadata.
    async fn get_state(&self, handle: &SessionHandle) -> SessionResult<DeviceState>;

    /// Sets the volume (`volume` in `[0.0, 1.0]`).
    async fn set_volume(&self, handle: &SessionHandle, volume: f32) -> SessionResult<()>;

    async fn set_mute(&self, handle: &SessionHandle, muted: bool) -> SessionResult<()>;

    /// Starts playback of a media reference.
    async fn play(&self, handle: &SessionHandle, media: &MediaRef) -> SessionResult<()>;

    /// Gracefully terminates the session, forcing termination after `grace`.
    ///
    /// Must release the underlying process on every path, including errors.
    async fn stop(&self, handle: &SessionHandle, grace: Duration) -> SessionResult<()>;
}

/// HAP two-step pairing primitives.
#[async_trait]
pub trait PairingBackend: Send + Sync {
    /// Asks the device to display a one-time PIN for `step`.
    async fn request_pin(&self, target: &SessionTarget, step: PairingStep) -> SessionResult<()>;

    /// Performs the key-exchange verification for `step` using a user PIN.
    ///
    /// Returns [`SessionError::WrongPin`] when the device rejects the PIN.
    async fn verify_pin(
        &self,
        target: &SessionTarget,
        step: PairingStep,
        pin: &str,
    ) -> SessionResult<()>;

    /// Derives the long-term credential after both steps verified.
    async fn finish(&self, target: &SessionTarget) -> SessionResult<PairingCredential>;

    /// Discards any partial key-exchange state held for `target`.
    async fn abort(&self, target: &SessionTarget);
}

// ─────────────────────────────────────────────────────────────────────────────
// Group Leader
// ─────────────────────────────────────────────────────────────────────────────

/// Identities a group leader reports managing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedIdentities {
    /// Devices the leader owns outright; no direct session may exist.
    pub exclusive: BTreeSet<SpeakerId>,
    /// Secondary speakers in the leader's group; direct sessions stay but
    /// playback and grouping route through the leader.
    pub group_members: BTreeSet<SpeakerId>,
}

/// Optional secondary controller with a richer command surface.
#[async_trait]
pub trait GroupLeader: Send + Sync {
    /// Hardware id of the leader device itself.
    fn leader_id(&self) -> &SpeakerId;

    async fn list_managed_identities(&self) -> BridgeResult<ManagedIdentities>;

    async fn dispatch_playback(
        &self,
        target: &SpeakerId,
        command: &PlaybackCommand,
    ) -> BridgeResult<()>;

    async fn dispatch_grouping(&self, target: &SpeakerId, op: &GroupOp) -> BridgeResult<()>;

    async fn now_playing(&self) -> BridgeResult<NowPlaying>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Combined Traits (for trait objects)
// ─────────────────────────────────────────────────────────────────────────────

/// Combined trait for everything the supervisor needs from a backend.
#[async_trait]
pub trait SpeakerBackend: SessionBackend + PairingBackend {}

/// Blanket implementation for any type implementing both traits.
impl<T: SessionBackend + PairingBackend> SpeakerBackend for T {}
