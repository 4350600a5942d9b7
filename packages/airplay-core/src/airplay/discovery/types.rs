//! Shared types for AirPlay announcement ingestion.
//!
//! Announcements arrive unordered and duplicated from two service types. This
//! module holds the raw record shape and the extraction rules that turn TXT
//! metadata into identity fields; deduplication lives in the identity registry.

use std::collections::HashMap;
use std::net::IpAddr;

use thiserror::Error;

use crate::airplay::types::{CapabilityFlags, SpeakerId};
use crate::protocol_constants::{AIRPLAY_SERVICE_TYPE, RAOP_SERVICE_TYPE};

/// Which service type produced an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// `_airplay._tcp`
    AirPlay,
    /// `_raop._tcp` (legacy audio)
    Raop,
}

impl ServiceKind {
    pub fn service_type(self) -> &'static str {
        match self {
            Self::AirPlay => AIRPLAY_SERVICE_TYPE,
            Self::Raop => RAOP_SERVICE_TYPE,
        }
    }

    /// Maps an mDNS service type (with or without trailing dot) to a kind.
    pub fn from_service_type(ty: &str) -> Option<Self> {
        let ty = ty.trim_end_matches('.');
        if ty == AIRPLAY_SERVICE_TYPE.trim_end_matches('.') {
            Some(Self::AirPlay)
        } else if ty == RAOP_SERVICE_TYPE.trim_end_matches('.') {
            Some(Self::Raop)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AirPlay => write!(f, "airplay"),
            Self::Raop => write!(f, "raop"),
        }
    }
}

/// One resolved service record.
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub kind: ServiceKind,
    /// Service instance name without the service type suffix.
    pub instance_name: String,
    /// First IPv4 address of the record, if any.
    pub address: Option<IpAddr>,
    pub port: u16,
    /// TXT key/value metadata (keys lower-cased).
    pub txt: HashMap<String, String>,
}

impl Announcement {
    fn txt(&self, key: &str) -> Option<&str> {
        self.txt
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Stable hardware identifier, if the record carries a usable one.
    ///
    /// AirPlay records use the `deviceid` TXT key; RAOP records prefix the
    /// instance name with the MAC address (`AABBCCDDEEFF@Kitchen`).
    pub fn hardware_id(&self) -> Option<SpeakerId> {
        match self.kind {
            ServiceKind::AirPlay => self.txt("deviceid").and_then(SpeakerId::parse),
            ServiceKind::Raop => self
                .instance_name
                .split_once('@')
                .and_then(|(mac, _)| SpeakerId::parse(mac)),
        }
    }

    /// Human-readable name.
    pub fn display_name(&self) -> String {
        match self.kind {
            ServiceKind::AirPlay => self.instance_name.clone(),
            ServiceKind::Raop => self
                .instance_name
                .split_once('@')
                .map(|(_, name)| name.to_string())
                .unwrap_or_else(|| self.instance_name.clone()),
        }
    }

    pub fn model(&self) -> Option<String> {
        let key = match self.kind {
            ServiceKind::AirPlay => "model",
            ServiceKind::Raop => "am",
        };
        self.txt(key).map(str::to_string)
    }

    /// Feature bitmask; missing or malformed values yield an empty set.
    pub fn capability_flags(&self) -> CapabilityFlags {
        let key = match self.kind {
            ServiceKind::AirPlay => "features",
            ServiceKind::Raop => "ft",
        };
        self.txt(key)
            .and_then(CapabilityFlags::parse)
            .unwrap_or_default()
    }
}

/// Events pushed from the discovery collaborator into the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Announced(Announcement),
    /// A service record was withdrawn.
    Lost {
        kind: ServiceKind,
        instance_name: String,
    },
}

/// Errors that can occur during discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// mDNS daemon error.
    #[error("mDNS daemon error: {0}")]
    MdnsDaemon(String),

    /// Browsing a service type failed.
    #[error("failed to browse {service_type}: {reason}")]
    Browse {
        service_type: &'static str,
        reason: String,
    },
}

/// Convenient Result alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
