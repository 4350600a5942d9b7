//! Shared fakes for service tests.
//!
//! [`FakeBackend`] implements both session and pairing control with a call
//! log, so tests can assert exactly which calls reached the "device".

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::airplay::discovery::{Announcement, ServiceKind};
use crate::airplay::traits::{
    BridgeError, BridgeResult, GroupLeader, ManagedIdentities, PairingBackend, SessionBackend,
    SessionError, SessionHandle, SessionResult, SessionTarget,
};
use crate::airplay::types::{
    DeviceState, GroupOp, MediaRef, NowPlaying, PairingCredential, PairingStep, PlaybackCommand,
    PlaybackState, ProtocolVersion, SpeakerId, SpeakerRoute,
};
use crate::events::{BridgeEvent, EventEmitter, PairingEvent, SessionEvent, SpeakerEvent};

pub(crate) const GOOD_PIN: &str = "1234";
pub(crate) const PAIRED_SECRET: &str = "paired-secret";

pub(crate) fn sid(raw: &str) -> SpeakerId {
    SpeakerId::parse(raw).unwrap()
}

pub(crate) fn target(raw: &str, protocol: ProtocolVersion) -> SessionTarget {
    SessionTarget {
        id: sid(raw),
        route: SpeakerRoute {
            address: IpAddr::from([10, 0, 0, 2]),
            port: 7000,
        },
        protocol,
    }
}

/// `_airplay._tcp` record for `raw`; AirPlay 2 advertises buffered audio.
pub(crate) fn airplay_record(raw: &str, name: &str, protocol: ProtocolVersion) -> Announcement {
    let features = match protocol {
        ProtocolVersion::AirPlay1 => "0x77",
        ProtocolVersion::AirPlay2 => "0x0,0x100",
    };
    Announcement {
        kind: ServiceKind::AirPlay,
        instance_name: name.to_string(),
        address: Some(IpAddr::from([10, 0, 0, 2])),
        port: 7000,
        txt: HashMap::from([
            ("deviceid".to_string(), raw.to_string()),
            ("features".to_string(), features.to_string()),
            ("model".to_string(), "AudioAccessory5,1".to_string()),
        ]),
    }
}

/// `_raop._tcp` record for `raw`, named `MAC@name`.
pub(crate) fn raop_record(raw: &str, name: &str) -> Announcement {
    Announcement {
        kind: ServiceKind::Raop,
        instance_name: format!("{}@{}", raw.replace(':', ""), name),
        address: Some(IpAddr::from([10, 0, 0, 2])),
        port: 7000,
        txt: HashMap::from([("am".to_string(), "AirPort10,115".to_string())]),
    }
}

/// Every call that reached the fake device, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Start(SpeakerId, Option<String>),
    AuthLegacy(SpeakerId),
    GetState(SpeakerId),
    SetVolume(SpeakerId, f32),
    SetMute(SpeakerId, bool),
    Play(SpeakerId, String),
    Stop(SpeakerId),
    RequestPin(SpeakerId, u8),
    VerifyPin(SpeakerId, u8, String),
    Finish(SpeakerId),
    Abort(SpeakerId),
}

/// Scriptable session + pairing backend.
pub(crate) struct FakeBackend {
    pub calls: Mutex<Vec<Call>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub health_checks: AtomicUsize,
    /// Health checks fail while set.
    pub unhealthy: AtomicBool,
    /// Polls fail while set.
    pub poll_fails: AtomicBool,
    /// Starts fail while set.
    pub start_fails: AtomicBool,
    /// Starts with a credential are rejected while set.
    pub reject_credential: AtomicBool,
    /// Remaining starts that fail before starts succeed again.
    pub failing_starts: AtomicU32,
    /// Artificial latency for the first command, in milliseconds.
    pub first_command_delay_ms: AtomicU32,
    /// Latency of every state poll, in milliseconds.
    pub poll_delay_ms: AtomicU32,
    /// Latency of every pairing abort, in milliseconds.
    pub abort_delay_ms: AtomicU32,
    pub state: Mutex<DeviceState>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            health_checks: AtomicUsize::new(0),
            unhealthy: AtomicBool::new(false),
            poll_fails: AtomicBool::new(false),
            start_fails: AtomicBool::new(false),
            reject_credential: AtomicBool::new(false),
            failing_starts: AtomicU32::new(0),
            first_command_delay_ms: AtomicU32::new(0),
            poll_delay_ms: AtomicU32::new(0),
            abort_delay_ms: AtomicU32::new(0),
            state: Mutex::new(DeviceState {
                volume: 0.4,
                muted: false,
                playback: PlaybackState::Idle,
                title: None,
                artist: None,
            }),
        }
    }
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn log(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Calls that count as commands (volume, mute, play).
    pub fn commands(&self) -> Vec<Call> {
        self.log()
            .into_iter()
            .filter(|call| {
                matches!(
                    call,
                    Call::SetVolume(..) | Call::SetMute(..) | Call::Play(..)
                )
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    async fn command_latency(&self) {
        let delay = self.first_command_delay_ms.swap(0, Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
    }
}

#[async_trait]
impl SessionBackend for FakeBackend {
    async fn start(
        &self,
        target: &SessionTarget,
        credential: Option<&PairingCredential>,
    ) -> SessionResult<SessionHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.record(Call::Start(
            target.id.clone(),
            credential.map(|c| c.expose().to_string()),
        ));
        if self.start_fails.load(Ordering::SeqCst) {
            return Err(SessionError::Exited(Some(1)));
        }
        if self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SessionError::Exited(Some(1)));
        }
        if credential.is_some() && self.reject_credential.load(Ordering::SeqCst) {
            return Err(SessionError::CredentialRejected);
        }
        Ok(SessionHandle::detached(target.clone(), credential.cloned()))
    }

    async fn health_check(&self, _handle: &SessionHandle) -> SessionResult<()> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.unhealthy.load(Ordering::SeqCst) {
            Err(SessionError::Exited(None))
        } else {
            Ok(())
        }
    }

    async fn authenticate_legacy(
        &self,
        handle: &SessionHandle,
        _credential: Option<&PairingCredential>,
    ) -> SessionResult<()> {
        self.record(Call::AuthLegacy(handle.target().id.clone()));
        Ok(())
    }

    async fn get_state(&self, handle: &SessionHandle) -> SessionResult<DeviceState> {
        self.record(Call::GetState(handle.target().id.clone()));
        let delay = self.poll_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        if self.poll_fails.load(Ordering::SeqCst) {
            return Err(SessionError::Timeout(Duration::from_secs(1)));
        }
        Ok(self.state.lock().clone())
    }

    async fn set_volume(&self, handle: &SessionHandle, volume: f32) -> SessionResult<()> {
        self.command_latency().await;
        self.record(Call::SetVolume(handle.target().id.clone(), volume));
        self.state.lock().volume = volume;
        Ok(())
    }

    async fn set_mute(&self, handle: &SessionHandle, muted: bool) -> SessionResult<()> {
        self.command_latency().await;
        self.record(Call::SetMute(handle.target().id.clone(), muted));
        self.state.lock().muted = muted;
        Ok(())
    }

    async fn play(&self, handle: &SessionHandle, media: &MediaRef) -> SessionResult<()> {
        self.command_latency().await;
        self.record(Call::Play(handle.target().id.clone(), media.url.clone()));
        self.state.lock().playback = PlaybackState::Playing;
        Ok(())
    }

    async fn stop(&self, handle: &SessionHandle, _grace: Duration) -> SessionResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.record(Call::Stop(handle.target().id.clone()));
        Ok(())
    }
}

#[async_trait]
impl PairingBackend for FakeBackend {
    async fn request_pin(&self, target: &SessionTarget, step: PairingStep) -> SessionResult<()> {
        self.record(Call::RequestPin(target.id.clone(), step.number()));
        Ok(())
    }

    async fn verify_pin(
        &self,
        target: &SessionTarget,
        step: PairingStep,
        pin: &str,
    ) -> SessionResult<()> {
        self.record(Call::VerifyPin(
            target.id.clone(),
            step.number(),
            pin.to_string(),
        ));
        if pin == GOOD_PIN {
            Ok(())
        } else {
            Err(SessionError::WrongPin)
        }
    }

    async fn finish(&self, target: &SessionTarget) -> SessionResult<PairingCredential> {
        self.record(Call::Finish(target.id.clone()));
        Ok(PairingCredential::new(PAIRED_SECRET))
    }

    async fn abort(&self, target: &SessionTarget) {
        self.record(Call::Abort(target.id.clone()));
        let delay = self.abort_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Group leader
// ─────────────────────────────────────────────────────────────────────────────

/// Scriptable group leader.
pub(crate) struct FakeLeader {
    pub id: SpeakerId,
    pub managed: Mutex<ManagedIdentities>,
    pub available: AtomicBool,
    pub playback: Mutex<Vec<(SpeakerId, PlaybackCommand)>>,
    pub grouping: Mutex<Vec<(SpeakerId, GroupOp)>>,
    pub now_playing: Mutex<NowPlaying>,
}

impl FakeLeader {
    pub fn new(id: &str, exclusive: &[&str], members: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            id: sid(id),
            managed: Mutex::new(ManagedIdentities {
                exclusive: exclusive.iter().map(|raw| sid(raw)).collect::<BTreeSet<_>>(),
                group_members: members.iter().map(|raw| sid(raw)).collect::<BTreeSet<_>>(),
            }),
            available: AtomicBool::new(true),
            playback: Mutex::new(Vec::new()),
            grouping: Mutex::new(Vec::new()),
            now_playing: Mutex::new(NowPlaying::default()),
        })
    }

    fn check(&self) -> BridgeResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::Unavailable("leader offline".into()))
        }
    }
}

#[async_trait]
impl GroupLeader for FakeLeader {
    fn leader_id(&self) -> &SpeakerId {
        &self.id
    }

    async fn list_managed_identities(&self) -> BridgeResult<ManagedIdentities> {
        self.check()?;
        Ok(self.managed.lock().clone())
    }

    async fn dispatch_playback(
        &self,
        target: &SpeakerId,
        command: &PlaybackCommand,
    ) -> BridgeResult<()> {
        self.check()?;
        self.playback.lock().push((target.clone(), command.clone()));
        Ok(())
    }

    async fn dispatch_grouping(&self, target: &SpeakerId, op: &GroupOp) -> BridgeResult<()> {
        self.check()?;
        self.grouping.lock().push((target.clone(), op.clone()));
        Ok(())
    }

    async fn now_playing(&self) -> BridgeResult<NowPlaying> {
        self.check()?;
        Ok(self.now_playing.lock().clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// Test emitter that records every event it sees.
#[derive(Default)]
pub(crate) struct RecordingEventEmitter {
    pub speaker: Mutex<Vec<SpeakerEvent>>,
    pub session: Mutex<Vec<SessionEvent>>,
    pub pairing: Mutex<Vec<PairingEvent>>,
    pub bridge: Mutex<Vec<BridgeEvent>>,
}

impl EventEmitter for RecordingEventEmitter {
    fn emit_speaker(&self, event: SpeakerEvent) {
        self.speaker.lock().push(event);
    }

    fn emit_session(&self, event: SessionEvent) {
        self.session.lock().push(event);
    }

    fn emit_pairing(&self, event: PairingEvent) {
        self.pairing.lock().push(event);
    }

    fn emit_bridge(&self, event: BridgeEvent) {
        self.bridge.lock().push(event);
    }
}
