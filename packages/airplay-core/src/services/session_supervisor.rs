//! Per-speaker session supervision.
//!
//! Each accepted identity gets one [`SessionEntry`] and one independent
//! supervisor task that drives it through
//!
//! ```text
//! Spawning → HealthChecking → AwaitingAuth → Running ⇄ Degraded
//!                                              │
//!                                           Crashed → Restarting → Spawning
//!                                              │
//!                                           Stopped
//! ```
//!
//! The supervisor task is the only writer of its entry's phase and process
//! handle. Other components read the published status and take the handle
//! only while the session is `Running` or `Degraded`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::airplay::traits::{SessionError, SessionHandle, SessionTarget, SpeakerBackend};
use crate::airplay::types::{
    PairingCredential, ProtocolVersion, SpeakerId, SpeakerIdentity, SpeakerRoute,
};
use crate::credentials::CredentialStore;
use crate::error::{ErrorCode, SpeakerError, SpeakerResult};
use crate::events::{EventEmitter, PairingEvent, SessionEvent};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::services::pairing::{
    AuthState, PairingContext, PairingMachine, PairingProgress, PairingStatus,
};
use crate::services::state_coordinator::StateCoordinator;
use crate::state::Config;
use crate::utils::{backoff_delay, bounded, millis_from_now, now_millis};

// ─────────────────────────────────────────────────────────────────────────────
// Status Types
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle phase of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Spawning,
    HealthChecking,
    /// Process is up; waiting for authentication to reach `Ready`.
    AwaitingAuth,
    Running,
    /// Running, but recent health checks failed.
    Degraded,
    Crashed,
    /// Waiting out the restart backoff.
    Restarting,
    Stopped,
}

/// Why a supervisor stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    /// Explicit stop or removal.
    Requested,
    /// Restart budget exhausted or unrecoverable error.
    PermanentFailure,
    /// The group leader took ownership of the device.
    ExternallyOwned,
    /// Every discovery source for the identity disappeared.
    IdentityLost,
}

/// Published status of one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub auth_state: AuthState,
    /// Consecutive crashes since the last stable run.
    pub restart_count: u32,
    pub consecutive_health_failures: u32,
    /// Unix timestamp (ms) of the last health check.
    pub last_health_check_at: Option<u64>,
    /// Unix timestamp (ms) until which a restart is deferred.
    pub backoff_until: Option<u64>,
    pub stop_reason: Option<StopReason>,
    pub last_error: Option<String>,
}

impl SessionStatus {
    fn initial() -> Self {
        Self {
            phase: SessionPhase::Spawning,
            auth_state: AuthState::Unauthenticated,
            restart_count: 0,
            consecutive_health_failures: 0,
            last_health_check_at: None,
            backoff_until: None,
            stop_reason: None,
            last_error: None,
        }
    }

    /// Whether commands and polls may use the session.
    pub fn accepts_commands(&self) -> bool {
        matches!(self.phase, SessionPhase::Running | SessionPhase::Degraded)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Table
// ─────────────────────────────────────────────────────────────────────────────

/// Supervised state for one identity.
pub struct SessionEntry {
    identity: SpeakerIdentity,
    route: RwLock<SpeakerRoute>,
    status: watch::Sender<SessionStatus>,
    handle: RwLock<Option<Arc<SessionHandle>>>,
    credential: RwLock<Option<PairingCredential>>,
    pairing: Mutex<PairingMachine>,
    credential_ready: Notify,
    stop_reason: RwLock<Option<StopReason>>,
    cancel: CancellationToken,
    /// Child of `cancel` scoped to the current running period.
    run: RwLock<CancellationToken>,
    lane: Mutex<()>,
}

impl SessionEntry {
    fn new(
        identity: SpeakerIdentity,
        route: SpeakerRoute,
        credential: Option<PairingCredential>,
        config: &Config,
        cancel: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::initial());
        Self {
            identity,
            route: RwLock::new(route),
            status,
            handle: RwLock::new(None),
            credential: RwLock::new(credential),
            pairing: Mutex::new(PairingMachine::new(
                config.pairing_max_attempts,
                config.pairing_pin_timeout(),
            )),
            credential_ready: Notify::new(),
            stop_reason: RwLock::new(None),
            run: RwLock::new(cancel.child_token()),
            cancel,
            lane: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &SpeakerIdentity {
        &self.identity
    }

    pub fn id(&self) -> &SpeakerId {
        &self.identity.id
    }

    pub fn route(&self) -> SpeakerRoute {
        *self.route.read()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// The live handle, if the session currently accepts commands.
    pub fn ready_handle(&self) -> Option<Arc<SessionHandle>> {
        if self.status.borrow().accepts_commands() {
            self.handle.read().clone()
        } else {
            None
        }
    }

    /// Per-identity FIFO command lane.
    pub fn lane(&self) -> &Mutex<()> {
        &self.lane
    }

    /// Cancelled as soon as the current running period ends (crash, stop or
    /// respawn). Calls made on a ready handle bind to this token.
    pub fn run_token(&self) -> CancellationToken {
        self.run.read().clone()
    }

    /// Whether `handle` is still the live handle of a command-ready session.
    pub fn is_current(&self, handle: &Arc<SessionHandle>) -> bool {
        self.ready_handle()
            .is_some_and(|current| Arc::ptr_eq(&current, handle))
    }

    fn begin_run(&self) {
        *self.run.write() = self.cancel.child_token();
    }

    fn end_run(&self) {
        self.run.read().cancel();
    }

    fn target(&self) -> SessionTarget {
        SessionTarget {
            id: self.identity.id.clone(),
            route: self.route(),
            protocol: self.identity.protocol_version,
        }
    }

    fn update<F: FnOnce(&mut SessionStatus)>(&self, f: F) {
        self.status.send_modify(f);
    }

    fn is_stopped(&self) -> bool {
        self.status.borrow().phase == SessionPhase::Stopped
    }
}

/// Shared map of supervised sessions.
///
/// Written only by the [`SessionSupervisor`]; the coordinator and dispatcher
/// read from it.
#[derive(Default)]
pub struct SessionTable {
    entries: DashMap<SpeakerId, Arc<SessionEntry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &SpeakerId) -> Option<Arc<SessionEntry>> {
        self.entries.get(id).map(|entry| entry.clone())
    }

    /// Entries whose session currently accepts commands.
    pub fn ready_entries(&self) -> Vec<Arc<SessionEntry>> {
        self.entries
            .iter()
            .filter(|entry| entry.status.borrow().accepts_commands())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<SpeakerId> {
        let mut ids: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&self, entry: Arc<SessionEntry>) {
        self.entries.insert(entry.id().clone(), entry);
    }

    /// Removes `entry` only if it is still the registered one.
    fn remove_if_same(&self, entry: &Arc<SessionEntry>) {
        self.entries
            .remove_if(entry.id(), |_, current| Arc::ptr_eq(current, entry));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

/// How one spawn-to-exit run of a session ended.
enum RunOutcome {
    /// Stop requested; the handle has been released.
    Cancelled,
    /// Failure that counts against the restart budget.
    Crashed { stable: bool },
    /// Respawn immediately without counting a crash (credential changed).
    Respawn,
    /// Unrecoverable; do not retry.
    Fatal(String),
}

struct SupervisorContext {
    backend: Arc<dyn SpeakerBackend>,
    credentials: Arc<dyn CredentialStore>,
    coordinator: Arc<StateCoordinator>,
    emitter: Arc<dyn EventEmitter>,
    table: Arc<SessionTable>,
    config: Config,
}

/// Owns the lifecycle of every speaker session.
pub struct SessionSupervisor {
    ctx: Arc<SupervisorContext>,
    spawner: TokioSpawner,
    shutdown: CancellationToken,
}

impl SessionSupervisor {
    pub fn new(
        backend: Arc<dyn SpeakerBackend>,
        credentials: Arc<dyn CredentialStore>,
        coordinator: Arc<StateCoordinator>,
        emitter: Arc<dyn EventEmitter>,
        table: Arc<SessionTable>,
        config: Config,
        spawner: TokioSpawner,
    ) -> Self {
        Self {
            ctx: Arc::new(SupervisorContext {
                backend,
                credentials,
                coordinator,
                emitter,
                table,
                config,
            }),
            spawner,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.ctx.table
    }

    /// Starts supervising `identity` unless a live supervisor already exists.
    ///
    /// A known, live session only has its route refreshed; it is never
    /// restarted by this call. A session stopped after `PermanentFailure`
    /// is replaced by a fresh supervisor.
    ///
    /// Returns true if a new supervisor was started.
    pub fn ensure(
        &self,
        identity: SpeakerIdentity,
        route: SpeakerRoute,
        credential: Option<PairingCredential>,
    ) -> bool {
        if let Some(existing) = self.ctx.table.get(&identity.id) {
            if !existing.is_stopped() && !existing.cancel.is_cancelled() {
                self.update_route(&identity.id, route);
                return false;
            }
        }
        self.start(identity, route, credential);
        true
    }

    fn start(
        &self,
        identity: SpeakerIdentity,
        route: SpeakerRoute,
        credential: Option<PairingCredential>,
    ) {
        let entry = Arc::new(SessionEntry::new(
            identity,
            route,
            credential,
            &self.ctx.config,
            self.shutdown.child_token(),
        ));
        log::info!(
            "[Supervisor] Starting session for {} ({}) at {}",
            entry.id(),
            entry.identity.display_name,
            route
        );
        self.ctx.table.insert(entry.clone());

        let ctx = self.ctx.clone();
        self.spawner
            .spawn("session_supervisor", async move { supervise(ctx, entry).await });
    }

    /// Records new transport info without disturbing the session.
    pub fn update_route(&self, id: &SpeakerId, route: SpeakerRoute) {
        if let Some(entry) = self.ctx.table.get(id) {
            let mut current = entry.route.write();
            if *current != route {
                log::info!("[Supervisor] Route for {} is now {}", id, route);
                *current = route;
            }
        }
    }

    /// Stops a session and waits until its process is released.
    ///
    /// Returns false if no session exists.
    pub async fn stop(&self, id: &SpeakerId, reason: StopReason) -> bool {
        let Some(entry) = self.ctx.table.get(id) else {
            return false;
        };
        stop_entry(&self.ctx, &entry, reason).await;
        self.ctx.table.remove_if_same(&entry);
        true
    }

    /// Replaces the session with a fresh supervisor (clears `PermanentFailure`).
    pub async fn restart(&self, id: &SpeakerId) -> SpeakerResult<()> {
        let entry = self
            .ctx
            .table
            .get(id)
            .ok_or_else(|| SpeakerError::SpeakerNotFound(id.to_string()))?;
        let identity = entry.identity.clone();
        let route = entry.route();
        let credential = entry.credential.read().clone();

        stop_entry(&self.ctx, &entry, StopReason::Requested).await;
        self.ctx.table.remove_if_same(&entry);
        self.start(identity, route, credential);
        Ok(())
    }

    /// Stops every session and prevents new work from starting.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self
            .ctx
            .table
            .ids()
            .into_iter()
            .filter_map(|id| self.ctx.table.get(&id))
            .collect();
        log::info!("[Supervisor] Stopping {} session(s)", entries.len());
        join_all(
            entries
                .iter()
                .map(|entry| stop_entry(&self.ctx, entry, StopReason::Requested)),
        )
        .await;
        self.shutdown.cancel();
    }

    pub fn status(&self, id: &SpeakerId) -> Option<SessionStatus> {
        self.ctx.table.get(id).map(|entry| entry.status())
    }

    pub fn subscribe(&self, id: &SpeakerId) -> Option<watch::Receiver<SessionStatus>> {
        self.ctx.table.get(id).map(|entry| entry.subscribe())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pairing
    // ─────────────────────────────────────────────────────────────────────

    /// Starts (or restarts) HAP pairing for an AirPlay 2 speaker.
    pub async fn begin_pairing(&self, id: &SpeakerId) -> SpeakerResult<PairingProgress> {
        let entry = self.pairable(id)?;
        let target = entry.target();
        let progress = {
            let mut machine = entry.pairing.lock().await;
            let result = machine
                .begin(&self.pairing_context(&entry, &target))
                .await;
            publish_auth(&entry, &machine);
            result
        };
        self.report_pairing(id, &progress);
        progress
    }

    /// Submits a PIN for the current pairing step.
    ///
    /// On completion the credential is stored and handed to the session,
    /// which restarts with it.
    pub async fn submit_pin(&self, id: &SpeakerId, pin: &str) -> SpeakerResult<PairingProgress> {
        let entry = self.pairable(id)?;
        let target = entry.target();
        let progress = {
            let mut machine = entry.pairing.lock().await;
            let result = machine
                .submit(&self.pairing_context(&entry, &target), pin)
                .await;
            publish_auth(&entry, &machine);
            result
        };

        if let Ok(PairingProgress::Completed(credential)) = &progress {
            if let Err(e) = self.ctx.credentials.put(id, credential.clone()) {
                log::warn!("[Supervisor] Failed to persist credential for {}: {}", id, e);
            }
            *entry.credential.write() = Some(credential.clone());
            entry.credential_ready.notify_one();
        }

        self.report_pairing(id, &progress);
        progress
    }

    pub async fn pairing_status(&self, id: &SpeakerId) -> SpeakerResult<PairingStatus> {
        let entry = self
            .ctx
            .table
            .get(id)
            .ok_or_else(|| SpeakerError::SpeakerNotFound(id.to_string()))?;
        let machine = entry.pairing.lock().await;
        Ok(machine.status())
    }

    fn pairable(&self, id: &SpeakerId) -> SpeakerResult<Arc<SessionEntry>> {
        let entry = self
            .ctx
            .table
            .get(id)
            .ok_or_else(|| SpeakerError::SpeakerNotFound(id.to_string()))?;
        if entry.identity.protocol_version != ProtocolVersion::AirPlay2 {
            return Err(SpeakerError::Unsupported(format!(
                "{id} is an AirPlay 1 speaker and does not use PIN pairing"
            )));
        }
        if entry.is_stopped() {
            return Err(SpeakerError::SessionNotReady(id.clone()));
        }
        Ok(entry)
    }

    fn pairing_context<'a>(
        &'a self,
        entry: &'a SessionEntry,
        target: &'a SessionTarget,
    ) -> PairingContext<'a, dyn SpeakerBackend> {
        PairingContext {
            backend: self.ctx.backend.as_ref(),
            target,
            call_timeout: self.ctx.config.command_timeout(),
            cancel: &entry.cancel,
        }
    }

    fn report_pairing(&self, id: &SpeakerId, progress: &SpeakerResult<PairingProgress>) {
        let timestamp = now_millis();
        let event = match progress {
            Ok(PairingProgress::PinRequested(step)) => PairingEvent::PinRequested {
                speaker_id: id.clone(),
                step: *step,
                timestamp,
            },
            Ok(PairingProgress::Retry {
                step,
                attempts_left,
            }) => PairingEvent::PinRejected {
                speaker_id: id.clone(),
                step: *step,
                attempts_left: *attempts_left,
                timestamp,
            },
            Ok(PairingProgress::Completed(_)) => PairingEvent::Completed {
                speaker_id: id.clone(),
                timestamp,
            },
            Err(SpeakerError::PairingNotActive(_)) => return,
            Err(e) => PairingEvent::Failed {
                speaker_id: id.clone(),
                reason: e.to_string(),
                timestamp,
            },
        };
        self.ctx.emitter.emit_pairing(event);
    }
}

fn publish_auth(entry: &SessionEntry, machine: &PairingMachine) {
    let auth = machine.state();
    entry.update(|s| s.auth_state = auth);
}

async fn stop_entry(ctx: &SupervisorContext, entry: &SessionEntry, reason: StopReason) {
    {
        let mut current = entry.stop_reason.write();
        if current.is_none() {
            *current = Some(reason);
        }
    }
    entry.cancel.cancel();

    let mut rx = entry.subscribe();
    let wait = teardown_budget(&ctx.config);
    if tokio::time::timeout(
        wait,
        rx.wait_for(|s| s.phase == SessionPhase::Stopped),
    )
    .await
    .is_err()
    {
        log::warn!(
            "[Supervisor] Session {} did not stop within {:?}",
            entry.id(),
            wait
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor Task
// ─────────────────────────────────────────────────────────────────────────────

async fn supervise(ctx: Arc<SupervisorContext>, entry: Arc<SessionEntry>) {
    let id = entry.id().clone();
    let config = &ctx.config;
    let mut restarts: u32 = 0;

    let final_reason = loop {
        if entry.cancel.is_cancelled() {
            break (*entry.stop_reason.read()).unwrap_or(StopReason::Requested);
        }

        match run_session(&ctx, &entry, restarts).await {
            RunOutcome::Cancelled => {
                break (*entry.stop_reason.read()).unwrap_or(StopReason::Requested);
            }
            RunOutcome::Respawn => continue,
            RunOutcome::Fatal(reason) => {
                log::error!("[Supervisor] {} failed permanently: {}", id, reason);
                entry.update(|s| s.last_error = Some(reason));
                break StopReason::PermanentFailure;
            }
            RunOutcome::Crashed { stable } => {
                if stable {
                    restarts = 0;
                }
                restarts += 1;
                if restarts > config.max_consecutive_restarts {
                    log::error!(
                        "[Supervisor] {} exceeded {} consecutive restarts",
                        id,
                        config.max_consecutive_restarts
                    );
                    break StopReason::PermanentFailure;
                }

                let delay = backoff_delay(
                    config.restart_backoff_base(),
                    config.restart_backoff_max(),
                    restarts,
                );
                let backoff_until = millis_from_now(delay);
                entry.update(|s| {
                    s.restart_count = restarts;
                    s.backoff_until = Some(backoff_until);
                });
                set_phase(&ctx, &entry, SessionPhase::Restarting);
                ctx.emitter.emit_session(SessionEvent::RestartScheduled {
                    speaker_id: id.clone(),
                    attempt: restarts,
                    backoff_until,
                    timestamp: now_millis(),
                });
                log::info!(
                    "[Supervisor] Restarting {} in {:?} (attempt {}/{})",
                    id,
                    delay,
                    restarts,
                    config.max_consecutive_restarts
                );

                tokio::select! {
                    () = entry.cancel.cancelled() => {
                        break (*entry.stop_reason.read()).unwrap_or(StopReason::Requested);
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                entry.update(|s| s.backoff_until = None);
            }
        }
    };

    {
        let target = entry.target();
        let pairing_ctx = PairingContext {
            backend: ctx.backend.as_ref(),
            target: &target,
            call_timeout: config.command_timeout(),
            cancel: &entry.cancel,
        };
        let mut machine = entry.pairing.lock().await;
        machine.abandon(&pairing_ctx).await;
        publish_auth(&entry, &machine);
    }

    if final_reason == StopReason::PermanentFailure {
        ctx.coordinator.mark_unavailable(&id);
    }

    entry.update(|s| {
        s.stop_reason = Some(final_reason);
        s.backoff_until = None;
    });
    set_phase(&ctx, &entry, SessionPhase::Stopped);
    ctx.emitter.emit_session(SessionEvent::Stopped {
        speaker_id: id.clone(),
        reason: final_reason,
        timestamp: now_millis(),
    });
    log::info!("[Supervisor] Session {} stopped ({:?})", id, final_reason);
}

/// One spawn-to-exit run. Every path that acquired a handle releases it.
async fn run_session(ctx: &SupervisorContext, entry: &SessionEntry, restarts: u32) -> RunOutcome {
    let config = &ctx.config;
    let id = entry.id();
    let target = entry.target();
    let credential = entry.credential.read().clone();

    // Spawning
    set_phase(ctx, entry, SessionPhase::Spawning);
    let started = bounded(
        &entry.cancel,
        config.spawn_timeout(),
        ctx.backend.start(&target, credential.as_ref()),
    )
    .await;

    let handle = match started {
        Ok(handle) => Arc::new(handle),
        Err(SessionError::Cancelled) => return RunOutcome::Cancelled,
        Err(SessionError::CredentialRejected) => {
            credential_rejected(ctx, entry).await;
            return RunOutcome::Respawn;
        }
        Err(e) if !e.is_transient() => return RunOutcome::Fatal(e.to_string()),
        Err(e) => {
            log::warn!("[Supervisor] Spawn failed for {} ({}): {}", id, e.code(), e);
            entry.update(|s| s.last_error = Some(format!("spawn failed: {e}")));
            set_phase(ctx, entry, SessionPhase::Crashed);
            return RunOutcome::Crashed { stable: false };
        }
    };

    // HealthChecking
    set_phase(ctx, entry, SessionPhase::HealthChecking);
    if let Err(e) = check_health(ctx, entry, &handle).await {
        return crash_or_cancel(ctx, entry, &handle, e, false).await;
    }

    // Authentication
    set_phase(ctx, entry, SessionPhase::AwaitingAuth);
    match target.protocol {
        ProtocolVersion::AirPlay1 => {
            let auth = bounded(
                &entry.cancel,
                config.command_timeout(),
                ctx.backend.authenticate_legacy(&handle, credential.as_ref()),
            )
            .await;
            if let Err(e) = auth {
                log::warn!("[Supervisor] Legacy authentication failed for {}: {}", id, e);
                return crash_or_cancel(ctx, entry, &handle, e, false).await;
            }
            let mut machine = entry.pairing.lock().await;
            machine.mark_ready();
            publish_auth(entry, &machine);
        }
        ProtocolVersion::AirPlay2 if credential.is_some() => {
            let mut machine = entry.pairing.lock().await;
            machine.mark_ready();
            publish_auth(entry, &machine);
        }
        ProtocolVersion::AirPlay2 => {
            log::info!("[Supervisor] {} needs pairing before it can be used", id);
            return await_pairing(ctx, entry, &handle).await;
        }
    }

    // Running
    entry.begin_run();
    *entry.handle.write() = Some(handle.clone());
    entry.update(|s| {
        s.consecutive_health_failures = 0;
        s.last_error = None;
    });
    set_phase(ctx, entry, SessionPhase::Running);
    ctx.coordinator.request_refresh(id);

    let running_since = Instant::now();
    let mut failures: u32 = 0;
    let mut restarts_reset = restarts == 0;
    let mut ticker = health_ticker(config.health_check_interval());

    loop {
        tokio::select! {
            () = entry.cancel.cancelled() => {
                release(ctx, entry, &handle).await;
                return RunOutcome::Cancelled;
            }
            _ = ticker.tick() => {}
        }

        match check_health(ctx, entry, &handle).await {
            Ok(()) => {
                if failures > 0 {
                    log::info!("[Supervisor] {} recovered", id);
                    failures = 0;
                    entry.update(|s| s.consecutive_health_failures = 0);
                    set_phase(ctx, entry, SessionPhase::Running);
                }
                if !restarts_reset && running_since.elapsed() >= config.stability_threshold() {
                    restarts_reset = true;
                    entry.update(|s| s.restart_count = 0);
                    log::debug!("[Supervisor] {} is stable, restart counter reset", id);
                }
            }
            Err(SessionError::Cancelled) => {
                release(ctx, entry, &handle).await;
                return RunOutcome::Cancelled;
            }
            Err(e) => {
                failures += 1;
                entry.update(|s| {
                    s.consecutive_health_failures = failures;
                    s.last_error = Some(e.to_string());
                });
                log::warn!(
                    "[Supervisor] Health check {}/{} failed for {}: {}",
                    failures,
                    config.health_failure_threshold,
                    id,
                    e
                );
                if failures >= config.health_failure_threshold {
                    let stable = running_since.elapsed() >= config.stability_threshold();
                    return crash(ctx, entry, &handle, stable).await;
                }
                set_phase(ctx, entry, SessionPhase::Degraded);
            }
        }
    }
}

/// Keeps a fresh AirPlay 2 session alive until pairing yields a credential.
async fn await_pairing(
    ctx: &SupervisorContext,
    entry: &SessionEntry,
    handle: &Arc<SessionHandle>,
) -> RunOutcome {
    let config = &ctx.config;
    let target = entry.target();
    let mut failures: u32 = 0;
    let mut ticker = health_ticker(config.health_check_interval());

    loop {
        if entry.credential.read().is_some() {
            log::info!("[Supervisor] Credential available for {}, respawning", entry.id());
            release(ctx, entry, handle).await;
            return RunOutcome::Respawn;
        }

        tokio::select! {
            () = entry.cancel.cancelled() => {
                release(ctx, entry, handle).await;
                return RunOutcome::Cancelled;
            }
            () = entry.credential_ready.notified() => continue,
            _ = ticker.tick() => {}
        }

        // The PIN window may lapse without anyone submitting.
        if let Ok(mut machine) = entry.pairing.try_lock() {
            let pairing_ctx = PairingContext {
                backend: ctx.backend.as_ref(),
                target: &target,
                call_timeout: config.command_timeout(),
                cancel: &entry.cancel,
            };
            if machine.expire_if_due(&pairing_ctx).await {
                publish_auth(entry, &machine);
                ctx.emitter.emit_pairing(PairingEvent::Failed {
                    speaker_id: entry.id().clone(),
                    reason: "PIN entry timed out".to_string(),
                    timestamp: now_millis(),
                });
            }
        }

        match check_health(ctx, entry, handle).await {
            Ok(()) => failures = 0,
            Err(SessionError::Cancelled) => {
                release(ctx, entry, handle).await;
                return RunOutcome::Cancelled;
            }
            Err(e) => {
                failures += 1;
                log::warn!(
                    "[Supervisor] Health check failed for unpaired {}: {}",
                    entry.id(),
                    e
                );
                if failures >= config.health_failure_threshold {
                    return crash(ctx, entry, handle, false).await;
                }
            }
        }
    }
}

/// Drops a rejected credential and returns the identity to `Unauthenticated`.
async fn credential_rejected(ctx: &SupervisorContext, entry: &SessionEntry) {
    let id = entry.id();
    log::warn!("[Supervisor] {} rejected its stored credential; pairing required", id);
    *entry.credential.write() = None;
    if let Err(e) = ctx.credentials.remove(id) {
        log::warn!("[Supervisor] Failed to drop credential for {}: {}", id, e);
    }
    {
        let mut machine = entry.pairing.lock().await;
        machine.reset();
        publish_auth(entry, &machine);
    }
    ctx.emitter.emit_pairing(PairingEvent::Failed {
        speaker_id: id.clone(),
        reason: "device rejected the stored credential".to_string(),
        timestamp: now_millis(),
    });
}

async fn check_health(
    ctx: &SupervisorContext,
    entry: &SessionEntry,
    handle: &SessionHandle,
) -> Result<(), SessionError> {
    let result = bounded(
        &entry.cancel,
        ctx.config.health_check_timeout(),
        ctx.backend.health_check(handle),
    )
    .await;
    entry.update(|s| s.last_health_check_at = Some(now_millis()));
    result
}

async fn crash_or_cancel(
    ctx: &SupervisorContext,
    entry: &SessionEntry,
    handle: &Arc<SessionHandle>,
    err: SessionError,
    stable: bool,
) -> RunOutcome {
    if matches!(err, SessionError::Cancelled) {
        release(ctx, entry, handle).await;
        return RunOutcome::Cancelled;
    }
    entry.update(|s| s.last_error = Some(err.to_string()));
    crash(ctx, entry, handle, stable).await
}

async fn crash(
    ctx: &SupervisorContext,
    entry: &SessionEntry,
    handle: &Arc<SessionHandle>,
    stable: bool,
) -> RunOutcome {
    log::warn!("[Supervisor] Session {} crashed", entry.id());
    *entry.handle.write() = None;
    entry.end_run();
    set_phase(ctx, entry, SessionPhase::Crashed);
    ctx.coordinator.mark_unavailable(entry.id());
    release(ctx, entry, handle).await;
    RunOutcome::Crashed { stable }
}

/// Slack past the stop grace period for the forced kill and reap.
const KILL_HEADROOM: Duration = Duration::from_secs(2);

/// Longest a supervisor may take to reach `Stopped` once cancelled: releasing
/// the process, then aborting an unfinished pairing exchange.
fn teardown_budget(config: &Config) -> Duration {
    config.stop_timeout() + KILL_HEADROOM + config.command_timeout() + KILL_HEADROOM
}

/// Withdraws the handle from readers and terminates the process.
async fn release(ctx: &SupervisorContext, entry: &SessionEntry, handle: &SessionHandle) {
    *entry.handle.write() = None;
    entry.end_run();
    let grace = ctx.config.stop_timeout();
    let limit = grace + KILL_HEADROOM;
    match tokio::time::timeout(limit, ctx.backend.stop(handle, grace)).await {
        Ok(Ok(())) => log::debug!("[Supervisor] Released session for {}", entry.id()),
        Ok(Err(e)) => log::warn!("[Supervisor] Stop failed for {}: {}", entry.id(), e),
        Err(_) => log::warn!("[Supervisor] Stop timed out for {}", entry.id()),
    }
}

fn set_phase(ctx: &SupervisorContext, entry: &SessionEntry, phase: SessionPhase) {
    let mut changed = false;
    entry.update(|s| {
        if s.phase != phase {
            s.phase = phase;
            changed = true;
        }
    });
    if changed {
        log::debug!("[Supervisor] {} -> {:?}", entry.id(), phase);
        ctx.emitter.emit_session(SessionEvent::PhaseChanged {
            speaker_id: entry.id().clone(),
            phase,
            timestamp: now_millis(),
        });
    }
}

fn health_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::airplay::types::CapabilityFlags;
    use crate::credentials::MemoryCredentialStore;
    use crate::events::NoopEventEmitter;
    use crate::services::capability_bridge::CapabilityBridge;
    use crate::state::{Availability, SpeakerStateStore};
    use crate::test_fixtures::{sid, Call, FakeBackend, RecordingEventEmitter, GOOD_PIN};

    struct Harness {
        backend: Arc<FakeBackend>,
        credentials: Arc<MemoryCredentialStore>,
        store: Arc<SpeakerStateStore>,
        emitter: Arc<RecordingEventEmitter>,
        supervisor: SessionSupervisor,
    }

    fn harness(config: Config) -> Harness {
        let backend = FakeBackend::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        let table = Arc::new(SessionTable::new());
        let store = Arc::new(SpeakerStateStore::new());
        let emitter = Arc::new(RecordingEventEmitter::default());
        let bridge = Arc::new(CapabilityBridge::new(
            Arc::new(NoopEventEmitter),
            config.clone(),
        ));
        let coordinator = Arc::new(StateCoordinator::new(
            backend.clone(),
            table.clone(),
            store.clone(),
            bridge,
            emitter.clone(),
            config.clone(),
        ));
        let supervisor = SessionSupervisor::new(
            backend.clone(),
            credentials.clone(),
            coordinator,
            emitter.clone(),
            table,
            config,
            TokioSpawner::current(),
        );
        Harness {
            backend,
            credentials,
            store,
            emitter,
            supervisor,
        }
    }

    fn identity(raw: &str, protocol: ProtocolVersion) -> SpeakerIdentity {
        SpeakerIdentity {
            id: sid(raw),
            display_name: "Test".into(),
            model: None,
            protocol_version: protocol,
            capability_flags: CapabilityFlags::default(),
        }
    }

    fn route() -> SpeakerRoute {
        SpeakerRoute {
            address: "10.0.0.2".parse().unwrap(),
            port: 7000,
        }
    }

    async fn wait_for(
        supervisor: &SessionSupervisor,
        id: &SpeakerId,
        pred: impl FnMut(&SessionStatus) -> bool,
    ) -> SessionStatus {
        let mut rx = supervisor.subscribe(id).expect("session exists");
        let status = tokio::time::timeout(Duration::from_secs(900), rx.wait_for(pred))
            .await
            .expect("status reached in time")
            .expect("supervisor alive")
            .clone();
        status
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_speaker_runs_without_pairing() {
        let h = harness(Config::default());
        let id = sid("AA:BB");
        assert!(h
            .supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay1), route(), None));

        let status = wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::Running).await;
        assert_eq!(status.auth_state, AuthState::Ready);

        let log = h.backend.log();
        assert!(log.contains(&Call::AuthLegacy(id.clone())));
        assert!(!log.iter().any(|c| matches!(c, Call::RequestPin(..))));
        assert!(h.supervisor.table().get(&id).unwrap().ready_handle().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_is_idempotent() {
        let h = harness(Config::default());
        let id = sid("AA:BB");
        assert!(h
            .supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay1), route(), None));
        assert!(!h
            .supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay1), route(), None));

        wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::Running).await;
        assert!(!h
            .supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay1), route(), None));
        assert_eq!(h.backend.starts.load(Ordering::SeqCst), 1);
        assert_eq!(h.supervisor.table().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn route_change_does_not_restart_running_session() {
        let h = harness(Config::default());
        let id = sid("AA:BB");
        h.supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay1), route(), None);
        wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::Running).await;

        let moved = SpeakerRoute {
            address: "10.0.0.77".parse().unwrap(),
            port: 7000,
        };
        h.supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay1), moved, None);

        assert_eq!(h.supervisor.table().get(&id).unwrap().route(), moved);
        assert_eq!(h.backend.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn three_health_failures_crash_and_restart_within_backoff() {
        let h = harness(Config::default());
        let id = sid("AA:BB");
        h.supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay1), route(), None);
        wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::Running).await;
        h.store.publish(&id, h.backend.state.lock().clone());

        h.backend.unhealthy.store(true, Ordering::SeqCst);
        let degraded = wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::Degraded).await;
        assert_eq!(degraded.consecutive_health_failures, 1);

        let restarting =
            wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::Restarting).await;
        let crashed_at = Instant::now();
        assert_eq!(restarting.restart_count, 1);
        assert_eq!(restarting.consecutive_health_failures, 3);
        assert_eq!(
            h.store
                .get(&id, Duration::from_secs(60))
                .unwrap()
                .availability,
            Availability::Unavailable
        );
        assert!(h.supervisor.table().get(&id).unwrap().ready_handle().is_none());

        h.backend.unhealthy.store(false, Ordering::SeqCst);
        wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::Running).await;
        assert!(crashed_at.elapsed() <= Duration::from_secs(2) + Duration::from_millis(100));
        assert_eq!(h.backend.starts.load(Ordering::SeqCst), 2);
        assert_eq!(h.backend.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_restarts_stop_with_permanent_failure() {
        let config = Config {
            max_consecutive_restarts: 2,
            ..Config::default()
        };
        let h = harness(config);
        let id = sid("AA:BB");
        h.backend.start_fails.store(true, Ordering::SeqCst);
        h.supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay1), route(), None);

        let stopped = wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::Stopped).await;
        assert_eq!(stopped.stop_reason, Some(StopReason::PermanentFailure));
        assert_eq!(h.backend.starts.load(Ordering::SeqCst), 3);
        assert!(h.emitter.session.lock().iter().any(|e| matches!(
            e,
            SessionEvent::Stopped {
                reason: StopReason::PermanentFailure,
                ..
            }
        )));

        // Re-announcement replaces the failed supervisor.
        h.backend.start_fails.store(false, Ordering::SeqCst);
        assert!(h
            .supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay1), route(), None));
        wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::Running).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stable_run_resets_restart_counter() {
        let h = harness(Config::default());
        let id = sid("AA:BB");
        h.backend.failing_starts.store(1, Ordering::SeqCst);
        h.supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay1), route(), None);

        let running = wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::Running).await;
        assert_eq!(running.restart_count, 1);

        let reset = wait_for(&h.supervisor, &id, |s| s.restart_count == 0).await;
        assert_eq!(reset.phase, SessionPhase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_process_and_removes_entry() {
        let h = harness(Config::default());
        let id = sid("AA:BB");
        h.supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay1), route(), None);
        wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::Running).await;

        let mut rx = h.supervisor.subscribe(&id).unwrap();
        assert!(h.supervisor.stop(&id, StopReason::Requested).await);

        assert_eq!(h.backend.stops.load(Ordering::SeqCst), 1);
        assert_eq!(rx.borrow_and_update().phase, SessionPhase::Stopped);
        assert!(h.supervisor.table().get(&id).is_none());
        assert!(!h.supervisor.stop(&id, StopReason::Requested).await);
    }

    #[tokio::test(start_paused = true)]
    async fn unpaired_airplay2_waits_then_runs_with_new_credential() {
        let h = harness(Config::default());
        let id = sid("AA:BB");
        h.supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay2), route(), None);
        wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::AwaitingAuth).await;
        assert!(h.supervisor.table().get(&id).unwrap().ready_handle().is_none());

        h.supervisor.begin_pairing(&id).await.unwrap();
        h.supervisor.submit_pin(&id, GOOD_PIN).await.unwrap();
        let done = h.supervisor.submit_pin(&id, GOOD_PIN).await.unwrap();
        assert!(matches!(done, PairingProgress::Completed(_)));

        wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::Running).await;
        assert!(h.credentials.get(&id).is_some());
        let starts: Vec<_> = h
            .backend
            .log()
            .into_iter()
            .filter(|c| matches!(c, Call::Start(..)))
            .collect();
        assert_eq!(
            starts,
            vec![
                Call::Start(id.clone(), None),
                Call::Start(id.clone(), Some("paired-secret".into())),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credential_reenters_pairing() {
        let h = harness(Config::default());
        let id = sid("AA:BB");
        h.credentials
            .put(&id, PairingCredential::new("stale"))
            .unwrap();
        h.backend.reject_credential.store(true, Ordering::SeqCst);

        h.supervisor.ensure(
            identity("AA:BB", ProtocolVersion::AirPlay2),
            route(),
            h.credentials.get(&id),
        );
        let status =
            wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::AwaitingAuth).await;
        assert_eq!(status.auth_state, AuthState::Unauthenticated);
        assert_eq!(status.restart_count, 0);
        assert!(h.credentials.get(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_speakers_refuse_pin_pairing() {
        let h = harness(Config::default());
        let id = sid("AA:BB");
        h.supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay1), route(), None);
        assert!(matches!(
            h.supervisor.begin_pairing(&id).await,
            Err(SpeakerError::Unsupported(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_pairing_abandons_key_exchange() {
        let h = harness(Config::default());
        let id = sid("AA:BB");
        h.supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay2), route(), None);
        wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::AwaitingAuth).await;
        h.supervisor.begin_pairing(&id).await.unwrap();

        h.supervisor.stop(&id, StopReason::Requested).await;
        assert!(h.backend.log().contains(&Call::Abort(id.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_returns_after_teardown_even_when_abort_hangs() {
        let config = Config::default();
        let budget = teardown_budget(&config);
        let h = harness(config);
        let id = sid("AA:BB");
        h.supervisor
            .ensure(identity("AA:BB", ProtocolVersion::AirPlay2), route(), None);
        wait_for(&h.supervisor, &id, |s| s.phase == SessionPhase::AwaitingAuth).await;
        h.supervisor.begin_pairing(&id).await.unwrap();
        h.backend.abort_delay_ms.store(3_600_000, Ordering::SeqCst);

        let mut rx = h.supervisor.subscribe(&id).unwrap();
        let started = Instant::now();
        assert!(h.supervisor.stop(&id, StopReason::Requested).await);

        assert!(started.elapsed() < budget);
        assert_eq!(rx.borrow_and_update().phase, SessionPhase::Stopped);
        assert_eq!(h.backend.stops.load(Ordering::SeqCst), 1);
    }
}
