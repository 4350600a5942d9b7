//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where the
//! backend, credential store, optional group leader, event bridge and the
//! speaker engine are instantiated and wired together.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::airplay::cli::{resolve_binary, CliAirplayBackend, CliAirplayConfig};
use crate::airplay::discovery::MdnsBrowser;
use crate::airplay::group_leader::{AtvRemoteConfig, AtvRemoteLeader};
use crate::airplay::traits::{GroupLeader, SpeakerBackend};
use crate::credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
use crate::error::{SpeakerError, SpeakerResult};
use crate::events::{BroadcastEventBridge, EventEmitter, LoggingEventEmitter};
use crate::protocol_constants::DISCOVERY_CHANNEL_CAPACITY;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::services::SpeakerService;
use crate::state::Config;

/// Adapter settings that sit outside the engine [`Config`].
#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    /// Protocol binary settings.
    pub backend: CliAirplayConfig,
    /// Group leader to bridge to, if any.
    pub group_leader: Option<AtvRemoteConfig>,
    /// Directory for pairing credentials. Credentials live in memory when unset.
    pub data_dir: Option<PathBuf>,
}

/// Container for all bootstrapped services.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// Engine facade used by the API layer.
    pub speaker_service: Arc<SpeakerService>,
    /// Event bridge feeding broadcast subscribers.
    pub event_bridge: Arc<BroadcastEventBridge>,
    /// Validated engine configuration.
    pub config: Config,
    /// Task spawner for background operations.
    pub spawner: TokioSpawner,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Starts discovery, polling and the bridge refresh loop.
    ///
    /// mDNS startup failures are logged; the engine still runs and can be
    /// driven through the API.
    pub fn start_background_tasks(&self) {
        let discovery = if self.config.discovery_mdns {
            self.start_mdns()
        } else {
            log::info!("[Bootstrap] mDNS discovery disabled");
            None
        };
        self.speaker_service.start(discovery);
    }

    fn start_mdns(&self) -> Option<mpsc::Receiver<crate::airplay::discovery::DiscoveryEvent>> {
        let browser = match MdnsBrowser::new() {
            Ok(browser) => browser,
            Err(e) => {
                log::error!("[Bootstrap] mDNS unavailable: {}", e);
                return None;
            }
        };

        let (tx, rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);
        let cancel = self.cancel_token.clone();
        self.spawner.spawn("mdns_browser", async move {
            if let Err(e) = browser.run(tx, cancel).await {
                log::error!("[Bootstrap] mDNS browser stopped: {}", e);
            }
        });
        Some(rx)
    }

    /// Initiates graceful shutdown of all services.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");

        // Signal cancellation to discovery, polling and bridge tasks
        self.cancel_token.cancel();

        // Stop every session, releasing its process
        self.speaker_service.shutdown().await;

        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Bootstraps the production stack: the `cliairplay` backend, an optional
/// `atvremote` group leader and a credential store in `data_dir`.
///
/// # Errors
///
/// Returns [`SpeakerError::Configuration`] when `config` is invalid or the
/// protocol binary cannot be found for this platform.
pub fn bootstrap_services(
    config: &Config,
    options: BootstrapOptions,
) -> SpeakerResult<BootstrappedServices> {
    let spawner = TokioSpawner::current();

    let binary = resolve_binary(&options.backend)
        .map_err(|e| SpeakerError::Configuration(e.to_string()))?;
    log::info!("[Bootstrap] Using protocol binary {}", binary.display());
    let backend = Arc::new(CliAirplayBackend::new(
        CliAirplayConfig {
            binary: Some(binary),
            ..options.backend
        },
        spawner.clone(),
    ));

    let credentials: Arc<dyn CredentialStore> = match options.data_dir {
        Some(dir) => {
            log::info!("[Bootstrap] Pairing credentials stored in {}", dir.display());
            Arc::new(FileCredentialStore::new(dir))
        }
        None => {
            log::info!("[Bootstrap] No data directory configured - credentials will not persist");
            Arc::new(MemoryCredentialStore::new())
        }
    };

    let leader = options.group_leader.map(|leader_config| {
        log::info!("[Bootstrap] Group leader configured: {}", leader_config.id);
        Arc::new(AtvRemoteLeader::new(leader_config)) as Arc<dyn GroupLeader>
    });

    bootstrap_services_with(config, backend, credentials, leader, spawner)
}

/// Bootstraps the engine around explicit adapters.
///
/// The wiring order is:
///
/// 1. Configuration validation
/// 2. Shared infrastructure (event bridge, cancellation token)
/// 3. Speaker engine (depends on backend, credentials, leader, event bridge)
pub fn bootstrap_services_with(
    config: &Config,
    backend: Arc<dyn SpeakerBackend>,
    credentials: Arc<dyn CredentialStore>,
    leader: Option<Arc<dyn GroupLeader>>,
    spawner: TokioSpawner,
) -> SpeakerResult<BootstrappedServices> {
    config.validate().map_err(SpeakerError::Configuration)?;

    let event_bridge = Arc::new(BroadcastEventBridge::new(config.event_channel_capacity));
    event_bridge.set_external_emitter(Arc::new(LoggingEventEmitter));

    let cancel_token = CancellationToken::new();

    let speaker_service = Arc::new(SpeakerService::new(
        backend,
        credentials,
        leader,
        Arc::clone(&event_bridge) as Arc<dyn EventEmitter>,
        config.clone(),
        spawner.clone(),
        cancel_token.child_token(),
    ));

    Ok(BootstrappedServices {
        speaker_service,
        event_bridge,
        config: config.clone(),
        spawner,
        cancel_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::airplay::types::ProtocolVersion;
    use crate::events::{BroadcastEvent, SpeakerEvent};
    use crate::services::SessionPhase;
    use crate::test_fixtures::{airplay_record, sid, FakeBackend};

    fn test_config() -> Config {
        Config {
            discovery_mdns: false,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = Config {
            poll_interval_secs: 0,
            ..test_config()
        };
        let result = bootstrap_services_with(
            &config,
            FakeBackend::new(),
            Arc::new(MemoryCredentialStore::new()),
            None,
            TokioSpawner::current(),
        );
        assert!(matches!(result, Err(SpeakerError::Configuration(_))));
    }

    #[tokio::test]
    async fn missing_binary_is_a_configuration_error() {
        let options = BootstrapOptions {
            backend: CliAirplayConfig {
                binary: Some(PathBuf::from("/nonexistent/cliairplay")),
                ..CliAirplayConfig::default()
            },
            ..BootstrapOptions::default()
        };
        let result = bootstrap_services(&test_config(), options);
        assert!(matches!(result, Err(SpeakerError::Configuration(_))));
    }

    #[tokio::test]
    async fn events_reach_broadcast_subscribers_and_shutdown_stops_sessions() {
        let backend = FakeBackend::new();
        let services = bootstrap_services_with(
            &test_config(),
            backend.clone(),
            Arc::new(MemoryCredentialStore::new()),
            None,
            TokioSpawner::current(),
        )
        .unwrap();
        let mut events = services.event_bridge.subscribe();
        services.start_background_tasks();

        services
            .speaker_service
            .handle_announcement(airplay_record(
                "AA:BB:CC:DD:EE:01",
                "Kitchen",
                ProtocolVersion::AirPlay1,
            ))
            .await;

        let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            first,
            BroadcastEvent::Speaker(SpeakerEvent::Discovered { .. })
        ));

        let mut status = services
            .speaker_service
            .supervisor()
            .subscribe(&sid("AA:BB:CC:DD:EE:01"))
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.phase == SessionPhase::Running),
        )
        .await
        .unwrap()
        .unwrap();

        services.shutdown().await;
        assert!(services.cancel_token.is_cancelled());
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }
}
