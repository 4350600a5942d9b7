//! Speaker engine facade.
//!
//! Composes the identity registry, session supervisor, state coordinator,
//! command dispatcher and capability bridge behind one API used by the HTTP
//! layer and the discovery loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::airplay::discovery::{Announcement, DiscoveryEvent, ServiceKind};
use crate::airplay::traits::{GroupLeader, SpeakerBackend};
use crate::airplay::types::{GroupOp, SpeakerId, SpeakerIdentity, SpeakerRoute};
use crate::credentials::CredentialStore;
use crate::error::{SpeakerError, SpeakerResult};
use crate::events::{EventEmitter, SpeakerEvent};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::state::{Config, SpeakerState, SpeakerStateStore};
use crate::utils::now_millis;

use super::capability_bridge::{BridgeStatus, CapabilityBridge, CommandCategory};
use super::command_dispatcher::{CommandDispatcher, SpeakerCommand};
use super::identity_registry::{IdentityRegistry, IgnoreReason, Resolution};
use super::pairing::{PairingProgress, PairingStatus};
use super::session_supervisor::{SessionStatus, SessionSupervisor, SessionTable, StopReason};
use super::state_coordinator::StateCoordinator;

/// Everything known about one speaker, for the outward surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerView {
    #[serde(flatten)]
    pub identity: SpeakerIdentity,
    pub route: Option<SpeakerRoute>,
    pub session: Option<SessionStatus>,
    pub state: Option<SpeakerState>,
    /// Playback and grouping currently route through the group leader.
    pub bridged: bool,
}

/// Engine facade over all speaker services.
pub struct SpeakerService {
    registry: Arc<IdentityRegistry>,
    supervisor: Arc<SessionSupervisor>,
    coordinator: Arc<StateCoordinator>,
    dispatcher: CommandDispatcher,
    bridge: Arc<CapabilityBridge>,
    credentials: Arc<dyn CredentialStore>,
    emitter: Arc<dyn EventEmitter>,
    config: Config,
    spawner: TokioSpawner,
    cancel: CancellationToken,
    /// The configured leader is on the network and worth re-enumerating.
    leader_present: AtomicBool,
    /// Ids whose `Discovered` event went out, once per process lifetime.
    announced: DashSet<SpeakerId>,
}

impl SpeakerService {
    /// Wires the engine around `backend`.
    ///
    /// `leader` enables the capability bridge; it attaches once the leader's
    /// own id is announced.
    pub fn new(
        backend: Arc<dyn SpeakerBackend>,
        credentials: Arc<dyn CredentialStore>,
        leader: Option<Arc<dyn GroupLeader>>,
        emitter: Arc<dyn EventEmitter>,
        config: Config,
        spawner: TokioSpawner,
        cancel: CancellationToken,
    ) -> Self {
        let table = Arc::new(SessionTable::new());
        let bridge = Arc::new(CapabilityBridge::new(
            Arc::clone(&emitter),
            config.clone(),
        ));
        if let Some(leader) = leader {
            bridge.configure(leader);
        }

        let coordinator = Arc::new(StateCoordinator::new(
            Arc::clone(&backend),
            Arc::clone(&table),
            Arc::new(SpeakerStateStore::new()),
            Arc::clone(&bridge),
            Arc::clone(&emitter),
            config.clone(),
        ));
        let supervisor = Arc::new(SessionSupervisor::new(
            Arc::clone(&backend),
            Arc::clone(&credentials),
            Arc::clone(&coordinator),
            Arc::clone(&emitter),
            Arc::clone(&table),
            config.clone(),
            spawner.clone(),
        ));
        let dispatcher = CommandDispatcher::new(
            backend,
            table,
            Arc::clone(&coordinator),
            Arc::clone(&bridge),
            config.clone(),
        );

        Self {
            registry: Arc::new(IdentityRegistry::new()),
            supervisor,
            coordinator,
            dispatcher,
            bridge,
            credentials,
            emitter,
            config,
            spawner,
            cancel,
            leader_present: AtomicBool::new(false),
            announced: DashSet::new(),
        }
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    pub fn coordinator(&self) -> &Arc<StateCoordinator> {
        &self.coordinator
    }

    pub fn bridge(&self) -> &Arc<CapabilityBridge> {
        &self.bridge
    }

    // ─────────────────────────────────────────────────────────────────────
    // Discovery
    // ─────────────────────────────────────────────────────────────────────

    /// Feeds one discovery event into the engine.
    pub async fn ingest(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Announced(announcement) => {
                self.handle_announcement(announcement).await;
            }
            DiscoveryEvent::Lost {
                kind,
                instance_name,
            } => self.handle_loss(kind, &instance_name).await,
        }
    }

    /// Resolves an announcement and makes sure an accepted identity has a
    /// supervised session.
    pub async fn handle_announcement(&self, announcement: Announcement) -> Resolution {
        if let Some(id) = announcement.hardware_id() {
            if self.bridge.is_leader(&id) {
                self.leader_present.store(true, Ordering::SeqCst);
                if !self.bridge.is_attached() {
                    self.attach_bridge().await;
                }
            }
        }
        self.admit(&announcement)
    }

    fn admit(&self, announcement: &Announcement) -> Resolution {
        let resolution = self.registry.resolve(announcement);
        match &resolution {
            Resolution::NewIdentity(id) | Resolution::KnownIdentity(id) => {
                self.ensure_session(id);
            }
            Resolution::Ignored(IgnoreReason::ExternallyOwned(id)) => {
                log::debug!("[SpeakerService] {} is managed by the group leader", id);
                self.emitter.emit_speaker(SpeakerEvent::Ignored {
                    speaker_id: id.clone(),
                    reason: IgnoreReason::ExternallyOwned(id.clone()).to_string(),
                    timestamp: now_millis(),
                });
            }
            Resolution::Ignored(IgnoreReason::MissingIdentifier) => {}
        }
        resolution
    }

    /// Emits `Discovered` the first time `id` actually gets a session.
    fn ensure_session(&self, id: &SpeakerId) {
        let (Some(identity), Some(route)) = (self.registry.identity(id), self.registry.route(id))
        else {
            log::warn!("[SpeakerService] {} has no reachable address yet", id);
            return;
        };

        if self.announced.insert(id.clone()) {
            self.emitter.emit_speaker(SpeakerEvent::Discovered {
                speaker_id: id.clone(),
                name: identity.display_name.clone(),
                protocol: identity.protocol_version,
                timestamp: now_millis(),
            });
        }
        let credential = self.credentials.get(id);
        self.supervisor.ensure(identity, route, credential);
    }

    async fn handle_loss(&self, kind: ServiceKind, instance_name: &str) {
        let Some(id) = self.registry.record_loss(kind, instance_name) else {
            return;
        };
        if self.bridge.is_leader(&id) {
            self.leader_present.store(false, Ordering::SeqCst);
            self.bridge.detach("group leader left the network");
        }
        self.supervisor.stop(&id, StopReason::IdentityLost).await;
        self.coordinator.forget(&id);
        self.emit_removed(&id);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Capability Bridge
    // ─────────────────────────────────────────────────────────────────────

    async fn attach_bridge(&self) {
        match self.bridge.attach().await {
            Ok(_) => self.apply_ownership().await,
            Err(e) => log::warn!("[SpeakerService] Group leader enumeration failed: {}", e),
        }
    }

    /// Re-enumerates the leader, reconnecting with backoff after a failure.
    pub async fn refresh_bridge(&self) {
        if self.bridge.leader_id().is_none() || !self.leader_present.load(Ordering::SeqCst) {
            return;
        }
        let result = match self.bridge.attach().await {
            Ok(managed) => Ok(managed),
            Err(_) => self.bridge.reconnect(&self.cancel).await,
        };
        match result {
            Ok(_) => self.apply_ownership().await,
            Err(e) => {
                log::warn!(
                    "[SpeakerService] Group leader unreachable, waiting for it to reappear: {}",
                    e
                );
                self.leader_present.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Publishes the bridge's exclusive set to the registry, stopping
    /// sessions it now owns and re-admitting those it released.
    async fn apply_ownership(&self) {
        let change = self
            .registry
            .set_externally_owned(self.bridge.externally_owned());

        for id in &change.excluded {
            log::info!("[SpeakerService] Handing {} over to the group leader", id);
            self.supervisor.stop(id, StopReason::ExternallyOwned).await;
            self.coordinator.forget(id);
            self.emitter.emit_speaker(SpeakerEvent::Ignored {
                speaker_id: id.clone(),
                reason: IgnoreReason::ExternallyOwned(id.clone()).to_string(),
                timestamp: now_millis(),
            });
        }
        for announcement in &change.released {
            self.admit(announcement);
        }
    }

    pub fn bridge_status(&self) -> BridgeStatus {
        self.bridge.status()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Speakers
    // ─────────────────────────────────────────────────────────────────────

    pub fn speakers(&self) -> Vec<SpeakerView> {
        self.registry
            .identities()
            .into_iter()
            .filter(|identity| !self.registry.is_externally_owned(&identity.id))
            .map(|identity| self.view(identity))
            .collect()
    }

    pub fn speaker(&self, id: &SpeakerId) -> SpeakerResult<SpeakerView> {
        if self.registry.is_externally_owned(id) {
            return Err(SpeakerError::SpeakerNotFound(id.to_string()));
        }
        self.registry
            .identity(id)
            .map(|identity| self.view(identity))
            .ok_or_else(|| SpeakerError::SpeakerNotFound(id.to_string()))
    }

    fn view(&self, identity: SpeakerIdentity) -> SpeakerView {
        let id = &identity.id;
        SpeakerView {
            route: self.registry.route(id),
            session: self.supervisor.status(id),
            state: self.coordinator.snapshot(id),
            bridged: self.bridge.owns(id, CommandCategory::Playback),
            identity,
        }
    }

    /// Latest snapshot for `id`, subject to the staleness bound.
    pub fn state(&self, id: &SpeakerId) -> Option<SpeakerState> {
        self.coordinator.snapshot(id)
    }

    /// Stops and forgets a speaker. A later announcement brings it back.
    pub async fn remove(&self, id: &SpeakerId) -> SpeakerResult<()> {
        let had_session = self.supervisor.stop(id, StopReason::Requested).await;
        let had_record = self.registry.forget(id);
        if !had_session && !had_record {
            return Err(SpeakerError::SpeakerNotFound(id.to_string()));
        }
        self.coordinator.forget(id);
        self.emit_removed(id);
        log::info!("[SpeakerService] Removed {}", id);
        Ok(())
    }

    /// Starts a fresh session, clearing a permanent failure.
    pub async fn restart(&self, id: &SpeakerId) -> SpeakerResult<()> {
        if self.supervisor.status(id).is_some() {
            return self.supervisor.restart(id).await;
        }
        // The session may have been stopped and removed; rebuild it from the
        // registry record.
        if self.registry.identity(id).is_some() && !self.registry.is_externally_owned(id) {
            self.ensure_session(id);
            return Ok(());
        }
        Err(SpeakerError::SpeakerNotFound(id.to_string()))
    }

    pub async fn dispatch(&self, id: &SpeakerId, command: SpeakerCommand) -> SpeakerResult<()> {
        self.dispatcher.dispatch(id, command).await
    }

    pub async fn group(&self, id: &SpeakerId, op: GroupOp) -> SpeakerResult<()> {
        self.dispatcher.group(id, op).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pairing
    // ─────────────────────────────────────────────────────────────────────

    pub async fn begin_pairing(&self, id: &SpeakerId) -> SpeakerResult<PairingProgress> {
        self.supervisor.begin_pairing(id).await
    }

    pub async fn submit_pin(&self, id: &SpeakerId, pin: &str) -> SpeakerResult<PairingProgress> {
        self.supervisor.submit_pin(id, pin).await
    }

    pub async fn pairing_status(&self, id: &SpeakerId) -> SpeakerResult<PairingStatus> {
        self.supervisor.pairing_status(id).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Starts polling, bridge refresh and the discovery intake loop.
    pub fn start(self: &Arc<Self>, discovery: Option<mpsc::Receiver<DiscoveryEvent>>) {
        self.coordinator.start(&self.spawner, self.cancel.clone());

        let this = Arc::clone(self);
        self.spawner.spawn("bridge_refresh", async move {
            let period = this.config.bridge_refresh_interval();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => break,
                    _ = ticker.tick() => this.refresh_bridge().await,
                }
            }
        });

        if let Some(mut rx) = discovery {
            let this = Arc::clone(self);
            self.spawner.spawn("discovery_intake", async move {
                loop {
                    tokio::select! {
                        () = this.cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(event) => this.ingest(event).await,
                            None => {
                                log::info!("[SpeakerService] Discovery channel closed");
                                break;
                            }
                        },
                    }
                }
            });
        }
    }

    /// Cancels background work and stops every session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.supervisor.shutdown().await;
    }

    fn emit_removed(&self, id: &SpeakerId) {
        self.emitter.emit_speaker(SpeakerEvent::Removed {
            speaker_id: id.clone(),
            timestamp: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::airplay::types::ProtocolVersion;
    use crate::credentials::MemoryCredentialStore;
    use crate::services::session_supervisor::SessionPhase;
    use crate::test_fixtures::{
        airplay_record, raop_record, sid, FakeBackend, FakeLeader, RecordingEventEmitter,
    };

    struct Harness {
        backend: Arc<FakeBackend>,
        emitter: Arc<RecordingEventEmitter>,
        service: Arc<SpeakerService>,
    }

    fn harness(leader: Option<Arc<FakeLeader>>) -> Harness {
        let backend = FakeBackend::new();
        let emitter = Arc::new(RecordingEventEmitter::default());
        let service = Arc::new(SpeakerService::new(
            backend.clone(),
            Arc::new(MemoryCredentialStore::new()),
            leader.map(|l| l as Arc<dyn GroupLeader>),
            emitter.clone(),
            Config::default(),
            TokioSpawner::current(),
            CancellationToken::new(),
        ));
        service.start(None);
        Harness {
            backend,
            emitter,
            service,
        }
    }

    async fn wait_phase(service: &SpeakerService, id: &SpeakerId, phase: SessionPhase) {
        let mut rx = service.supervisor().subscribe(id).expect("session exists");
        rx.wait_for(|s| s.phase == phase).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn discovered(emitter: &RecordingEventEmitter) -> usize {
        emitter
            .speaker
            .lock()
            .iter()
            .filter(|e| matches!(e, SpeakerEvent::Discovered { .. }))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_announcement_yields_ready_session_and_snapshot() {
        let h = harness(None);
        let id = sid("AA:BB");

        let first = h
            .service
            .handle_announcement(airplay_record("AA:BB", "Kitchen", ProtocolVersion::AirPlay1))
            .await;
        assert_eq!(first, Resolution::NewIdentity(id.clone()));
        wait_phase(&h.service, &id, SessionPhase::Running).await;
        assert!(h.service.state(&id).unwrap().is_available());

        // Same device via the other service type.
        let second = h
            .service
            .handle_announcement(raop_record("AA:BB", "Kitchen"))
            .await;
        assert_eq!(second, Resolution::KnownIdentity(id.clone()));
        assert_eq!(h.service.speakers().len(), 1);
        assert_eq!(h.backend.starts.load(Ordering::SeqCst), 1);
        assert_eq!(discovered(&h.emitter), 1);
        h.service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn externally_owned_speaker_never_spawns() {
        let leader = FakeLeader::new("11:11", &["AA:BB"], &[]);
        let h = harness(Some(leader));

        h.service
            .handle_announcement(airplay_record("11:11", "Living Room", ProtocolVersion::AirPlay2))
            .await;
        let resolution = h
            .service
            .handle_announcement(airplay_record("AA:BB", "Den", ProtocolVersion::AirPlay1))
            .await;

        assert!(matches!(
            resolution,
            Resolution::Ignored(IgnoreReason::ExternallyOwned(_))
        ));
        assert_eq!(h.backend.starts.load(Ordering::SeqCst), 0);
        assert!(h.service.speakers().is_empty());
        h.service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn speaker_announced_before_leader_is_handed_over() {
        let leader = FakeLeader::new("11:11", &["AA:BB"], &[]);
        let h = harness(Some(leader));
        let id = sid("AA:BB");

        h.service
            .handle_announcement(airplay_record("AA:BB", "Den", ProtocolVersion::AirPlay1))
            .await;
        wait_phase(&h.service, &id, SessionPhase::Running).await;

        h.service
            .handle_announcement(airplay_record("11:11", "Living Room", ProtocolVersion::AirPlay2))
            .await;

        assert!(h.service.supervisor().status(&id).is_none());
        assert_eq!(h.backend.stops.load(Ordering::SeqCst), 1);
        assert!(matches!(
            h.service.speaker(&id),
            Err(SpeakerError::SpeakerNotFound(_))
        ));
        h.service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn losing_every_source_stops_the_session() {
        let h = harness(None);
        let id = sid("AA:BB");
        h.service
            .handle_announcement(airplay_record("AA:BB", "Kitchen", ProtocolVersion::AirPlay1))
            .await;
        h.service
            .handle_announcement(raop_record("AA:BB", "Kitchen"))
            .await;
        wait_phase(&h.service, &id, SessionPhase::Running).await;

        h.service
            .ingest(DiscoveryEvent::Lost {
                kind: ServiceKind::AirPlay,
                instance_name: "Kitchen".into(),
            })
            .await;
        assert!(h.service.supervisor().status(&id).is_some());

        h.service
            .ingest(DiscoveryEvent::Lost {
                kind: ServiceKind::Raop,
                instance_name: "AABB@Kitchen".into(),
            })
            .await;
        assert!(h.service.supervisor().status(&id).is_none());
        assert!(h.service.state(&id).is_none());
        assert!(h
            .emitter
            .speaker
            .lock()
            .iter()
            .any(|e| matches!(e, SpeakerEvent::Removed { .. })));
        h.service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn removed_speaker_returns_as_known_identity() {
        let h = harness(None);
        let id = sid("AA:BB");
        h.service
            .handle_announcement(airplay_record("AA:BB", "Kitchen", ProtocolVersion::AirPlay1))
            .await;
        wait_phase(&h.service, &id, SessionPhase::Running).await;

        h.service.remove(&id).await.unwrap();
        assert!(h.service.speakers().is_empty());
        assert!(matches!(
            h.service.remove(&id).await,
            Err(SpeakerError::SpeakerNotFound(_))
        ));

        let again = h
            .service
            .handle_announcement(airplay_record("AA:BB", "Kitchen", ProtocolVersion::AirPlay1))
            .await;
        assert_eq!(again, Resolution::KnownIdentity(id.clone()));
        wait_phase(&h.service, &id, SessionPhase::Running).await;
        assert_eq!(discovered(&h.emitter), 1);
        h.service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn discovered_waits_for_a_reachable_address() {
        let h = harness(None);
        let id = sid("AA:BB");
        let mut unroutable = airplay_record("AA:BB", "Kitchen", ProtocolVersion::AirPlay1);
        unroutable.address = None;

        let first = h.service.handle_announcement(unroutable).await;
        assert_eq!(first, Resolution::NewIdentity(id.clone()));
        assert!(h.service.supervisor().status(&id).is_none());
        assert_eq!(discovered(&h.emitter), 0);

        let second = h
            .service
            .handle_announcement(airplay_record("AA:BB", "Kitchen", ProtocolVersion::AirPlay1))
            .await;
        assert_eq!(second, Resolution::KnownIdentity(id.clone()));
        wait_phase(&h.service, &id, SessionPhase::Running).await;
        assert_eq!(discovered(&h.emitter), 1);

        h.service
            .handle_announcement(airplay_record("AA:BB", "Kitchen", ProtocolVersion::AirPlay1))
            .await;
        assert_eq!(discovered(&h.emitter), 1);
        h.service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_instance_of_same_kind_keeps_session_alive() {
        let h = harness(None);
        let id = sid("AA:BB");
        for name in ["Kitchen", "Kitchen Speaker"] {
            h.service
                .handle_announcement(airplay_record("AA:BB", name, ProtocolVersion::AirPlay1))
                .await;
        }
        wait_phase(&h.service, &id, SessionPhase::Running).await;

        h.service
            .ingest(DiscoveryEvent::Lost {
                kind: ServiceKind::AirPlay,
                instance_name: "Kitchen".into(),
            })
            .await;
        assert!(h.service.supervisor().status(&id).is_some());
        assert_eq!(h.backend.stops.load(Ordering::SeqCst), 0);
        h.service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_every_session() {
        let h = harness(None);
        for raw in ["AA:BB", "CC:DD"] {
            h.service
                .handle_announcement(airplay_record(raw, raw, ProtocolVersion::AirPlay1))
                .await;
            wait_phase(&h.service, &sid(raw), SessionPhase::Running).await;
        }

        h.service.shutdown().await;
        assert_eq!(h.backend.stops.load(Ordering::SeqCst), 2);
    }
}
