//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use airplay_core::{AtvRemoteConfig, CliAirplayConfig, SpeakerId};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Group leader (Apple TV) section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GroupLeaderConfig {
    /// Hardware id the leader announces over mDNS.
    pub id: String,
    /// Path to `atvremote`. Looked up on `PATH` when unset.
    #[serde(default)]
    pub atvremote: Option<PathBuf>,
    #[serde(default)]
    pub companion_credentials: Option<String>,
    #[serde(default)]
    pub airplay_credentials: Option<String>,
}

impl GroupLeaderConfig {
    fn to_core(&self, timeout: Duration) -> Result<AtvRemoteConfig> {
        let id = SpeakerId::parse(&self.id)
            .ok_or_else(|| anyhow!("invalid group leader id: {}", self.id))?;
        let mut config = AtvRemoteConfig::new(id);
        if let Some(path) = &self.atvremote {
            config.binary = path.clone();
        }
        config.companion_credentials = self.companion_credentials.clone();
        config.airplay_credentials = self.airplay_credentials.clone();
        config.timeout = timeout;
        Ok(config)
    }
}

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to.
    /// Override: `AIRPLAY_BIND_PORT`
    pub bind_port: u16,

    /// Explicit path to the `cliairplay` binary.
    /// Override: `AIRPLAY_BINARY`
    pub binary: Option<PathBuf>,

    /// Directory holding per-platform `cliairplay-<os>-<arch>` builds.
    pub bin_dir: PathBuf,

    /// Directory for persistent data (pairing credentials).
    /// Override: `AIRPLAY_DATA_DIR`
    pub data_dir: Option<PathBuf>,

    /// Interval in seconds between state polls.
    /// Override: `AIRPLAY_POLL_INTERVAL`
    pub poll_interval: u64,

    /// Interval in seconds between session health checks.
    /// Override: `AIRPLAY_HEALTH_CHECK_INTERVAL`
    pub health_check_interval: u64,

    /// Enable mDNS/Bonjour discovery.
    pub discovery_mdns: bool,

    /// Optional Apple TV acting as group leader.
    pub group_leader: Option<GroupLeaderConfig>,

    /// Engine settings not covered above; merged under the fields above.
    pub engine: airplay_core::Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let engine = airplay_core::Config::default();
        Self {
            bind_port: 49500,
            binary: None,
            bin_dir: PathBuf::from("bin"),
            data_dir: None,
            poll_interval: engine.poll_interval_secs,
            health_check_interval: engine.health_check_interval_secs,
            discovery_mdns: engine.discovery_mdns,
            group_leader: None,
            engine,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_yaml(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AIRPLAY_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        if let Ok(val) = std::env::var("AIRPLAY_POLL_INTERVAL") {
            if let Ok(interval) = val.parse() {
                self.poll_interval = interval;
            }
        }

        if let Ok(val) = std::env::var("AIRPLAY_HEALTH_CHECK_INTERVAL") {
            if let Ok(interval) = val.parse() {
                self.health_check_interval = interval;
            }
        }

        if let Ok(val) = std::env::var("AIRPLAY_LEADER_ID") {
            match self.group_leader.as_mut() {
                Some(leader) => leader.id = val,
                None => {
                    self.group_leader = Some(GroupLeaderConfig {
                        id: val,
                        atvremote: None,
                        companion_credentials: None,
                        airplay_credentials: None,
                    })
                }
            }
        }

        // Note: AIRPLAY_DATA_DIR and AIRPLAY_BINARY are handled by clap via #[arg(env = ...)] in main.rs
    }

    /// Converts to airplay-core's Config type.
    pub fn to_core_config(&self) -> airplay_core::Config {
        airplay_core::Config {
            poll_interval_secs: self.poll_interval,
            health_check_interval_secs: self.health_check_interval,
            discovery_mdns: self.discovery_mdns,
            ..self.engine.clone()
        }
    }

    /// Protocol binary settings for the backend.
    pub fn to_backend_config(&self) -> CliAirplayConfig {
        let core = self.to_core_config();
        CliAirplayConfig {
            binary: self.binary.clone(),
            bin_dir: self.bin_dir.clone(),
            command_timeout: core.command_timeout(),
            play_timeout: core.play_timeout(),
            ..CliAirplayConfig::default()
        }
    }

    /// Group leader settings, if a leader is configured.
    pub fn to_leader_config(&self) -> Result<Option<AtvRemoteConfig>> {
        let timeout = self.to_core_config().command_timeout();
        self.group_leader
            .as_ref()
            .map(|leader| leader.to_core(timeout))
            .transpose()
    }
}
