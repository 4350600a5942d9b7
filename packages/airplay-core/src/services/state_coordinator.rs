//! Speaker state polling.
//!
//! A single loop polls every ready session on a fixed interval and serves
//! on-demand refresh requests between ticks. The coordinator is the only
//! writer of [`SpeakerState`] snapshots. It never starts or restarts a
//! session: a failed poll only flips the snapshot to unavailable and leaves
//! recovery to the supervisor's health checks.

use std::sync::Arc;

use dashmap::DashSet;
use futures::future::join_all;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::airplay::traits::{SessionError, SpeakerBackend};
use crate::airplay::types::{NowPlaying, SpeakerId};
use crate::events::{EventEmitter, SpeakerEvent};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::services::capability_bridge::CapabilityBridge;
use crate::services::session_supervisor::{SessionEntry, SessionTable};
use crate::state::{Config, SpeakerState, SpeakerStateStore};
use crate::utils::{bounded, now_millis};

pub struct StateCoordinator {
    backend: Arc<dyn SpeakerBackend>,
    table: Arc<SessionTable>,
    store: Arc<SpeakerStateStore>,
    bridge: Arc<CapabilityBridge>,
    emitter: Arc<dyn EventEmitter>,
    config: Config,
    /// Ids with an outstanding refresh request. Repeated requests collapse.
    pending: DashSet<SpeakerId>,
    wake: Notify,
}

impl StateCoordinator {
    pub fn new(
        backend: Arc<dyn SpeakerBackend>,
        table: Arc<SessionTable>,
        store: Arc<SpeakerStateStore>,
        bridge: Arc<CapabilityBridge>,
        emitter: Arc<dyn EventEmitter>,
        config: Config,
    ) -> Self {
        Self {
            backend,
            table,
            store,
            bridge,
            emitter,
            config,
            pending: DashSet::new(),
            wake: Notify::new(),
        }
    }

    /// Asks for `id` to be polled now instead of at the next tick.
    ///
    /// Does not move the regular schedule.
    pub fn request_refresh(&self, id: &SpeakerId) {
        self.pending.insert(id.clone());
        self.wake.notify_one();
    }

    /// Marks the snapshot unavailable, keeping its last known values.
    pub fn mark_unavailable(&self, id: &SpeakerId) {
        if let Some(state) = self.store.mark_unavailable(id) {
            log::info!("[Coordinator] {} is now unavailable", id);
            self.emit_state(id, state);
        }
    }

    /// Current snapshot, demoted to unavailable when older than the staleness bound.
    pub fn snapshot(&self, id: &SpeakerId) -> Option<SpeakerState> {
        self.store.get(id, self.config.staleness_bound())
    }

    /// Drops everything known about `id`.
    pub fn forget(&self, id: &SpeakerId) {
        self.pending.remove(id);
        if self.store.remove(id) {
            log::debug!("[Coordinator] Forgot state for {}", id);
        }
    }

    /// Starts the polling loop.
    pub fn start(self: &Arc<Self>, spawner: &TokioSpawner, cancel: CancellationToken) {
        let this = Arc::clone(self);
        spawner.spawn("state_coordinator", async move { this.run(cancel).await });
    }

    async fn run(&self, cancel: CancellationToken) {
        let period = self.config.poll_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("[Coordinator] Polling every {:?}", period);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // A full round satisfies every outstanding request.
                    self.pending.clear();
                    self.poll_all().await;
                }
                () = self.wake.notified() => {
                    let ids = self.drain_pending();
                    self.poll_ids(&ids).await;
                }
            }
        }
        log::info!("[Coordinator] Stopped");
    }

    fn drain_pending(&self) -> Vec<SpeakerId> {
        let ids: Vec<SpeakerId> = self.pending.iter().map(|id| id.key().clone()).collect();
        for id in &ids {
            self.pending.remove(id);
        }
        ids
    }

    /// Polls every ready session in parallel.
    pub async fn poll_all(&self) {
        let entries = self.table.ready_entries();
        self.poll_entries(entries).await;
    }

    async fn poll_ids(&self, ids: &[SpeakerId]) {
        let entries = ids.iter().filter_map(|id| self.table.get(id)).collect();
        self.poll_entries(entries).await;
    }

    async fn poll_entries(&self, entries: Vec<Arc<SessionEntry>>) {
        if entries.is_empty() {
            return;
        }
        let members = self.bridge.group_members();
        let now_playing = if entries.iter().any(|e| members.contains(e.id())) {
            self.bridge.now_playing().await
        } else {
            None
        };

        join_all(entries.iter().map(|entry| {
            let overlay = now_playing
                .as_ref()
                .filter(|_| members.contains(entry.id()));
            self.poll_entry(entry, overlay)
        }))
        .await;
    }

    async fn poll_entry(&self, entry: &SessionEntry, overlay: Option<&NowPlaying>) {
        let id = entry.id();
        let Some(handle) = entry.ready_handle() else {
            return;
        };
        let run = entry.run_token();

        let result = bounded(
            &run,
            self.config.poll_timeout(),
            self.backend.get_state(&handle),
        )
        .await;

        match result {
            Ok(device) => {
                // The session may have crashed or respawned while the poll ran.
                if !entry.is_current(&handle) {
                    log::debug!(
                        "[Coordinator] Dropping poll result for {}: session went away",
                        id
                    );
                    return;
                }
                let previous = self.store.get(id, self.config.staleness_bound());
                let mut state = self.store.publish(id, device);
                if !entry.is_current(&handle) {
                    // Lost the race with a crash that already marked it unavailable.
                    self.mark_unavailable(id);
                    return;
                }
                if let Some(now_playing) = overlay {
                    if self.store.apply_now_playing(id, now_playing) {
                        state.playback = now_playing.playback;
                        state.title = now_playing.title.clone();
                        state.artist = now_playing.artist.clone();
                    }
                }
                if previous.map_or(true, |prev| !same_values(&prev, &state)) {
                    self.emit_state(id, state);
                }
            }
            Err(SessionError::Cancelled) => {}
            Err(e) => {
                log::warn!("[Coordinator] Poll failed for {}: {}", id, e);
                self.mark_unavailable(id);
            }
        }
    }

    fn emit_state(&self, id: &SpeakerId, state: SpeakerState) {
        self.emitter.emit_speaker(SpeakerEvent::StateChanged {
            speaker_id: id.clone(),
            state,
            timestamp: now_millis(),
        });
    }
}

fn same_values(a: &SpeakerState, b: &SpeakerState) -> bool {
    a.volume == b.volume
        && a.muted == b.muted
        && a.playback == b.playback
        && a.title == b.title
        && a.artist == b.artist
        && a.availability == b.availability
}
