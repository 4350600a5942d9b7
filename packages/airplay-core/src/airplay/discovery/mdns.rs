//! Continuous mDNS/Bonjour browsing for AirPlay speakers.
//!
//! Browses `_airplay._tcp.local.` and `_raop._tcp.local.` for the lifetime of
//! the process and forwards every resolved or withdrawn record into a channel.
//! The same physical speaker normally appears under both service types; the
//! identity registry collapses them.
//!
//! Addresses come from the resolved SRV/A answers, never from the host name.
//! Both browses are stopped when the cancellation token fires.

use std::collections::HashMap;
use std::net::IpAddr;

use mdns_sd::{ResolvedService, ScopedIp, ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{Announcement, DiscoveryError, DiscoveryEvent, DiscoveryResult, ServiceKind};
use crate::protocol_constants::{AIRPLAY_SERVICE_TYPE, DEFAULT_AIRPLAY_PORT, RAOP_SERVICE_TYPE};

/// Long-running browser feeding [`DiscoveryEvent`]s to the engine.
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
}

impl MdnsBrowser {
    /// Creates the browser and its mDNS daemon thread.
    pub fn new() -> DiscoveryResult<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::MdnsDaemon(e.to_string()))?;
        Ok(Self { daemon })
    }

    /// Browses both service types until `cancel` fires or the receiver drops.
    pub async fn run(
        self,
        events: mpsc::Sender<DiscoveryEvent>,
        cancel: CancellationToken,
    ) -> DiscoveryResult<()> {
        let airplay = self
            .daemon
            .browse(AIRPLAY_SERVICE_TYPE)
            .map_err(|e| browse_error(ServiceKind::AirPlay, e))?;
        let raop = self
            .daemon
            .browse(RAOP_SERVICE_TYPE)
            .map_err(|e| browse_error(ServiceKind::Raop, e))?;

        log::info!("[mDNS] Browsing for AirPlay and RAOP services");

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = airplay.recv_async() => event,
                event = raop.recv_async() => event,
            };

            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("[mDNS] Browse channel closed: {:?}", e);
                    break;
                }
            };

            if let Some(discovery_event) = translate(event) {
                if events.send(discovery_event).await.is_err() {
                    log::debug!("[mDNS] Event receiver dropped, stopping browse");
                    break;
                }
            }
        }

        for kind in [ServiceKind::AirPlay, ServiceKind::Raop] {
            if let Err(e) = self.daemon.stop_browse(kind.service_type()) {
                log::warn!("[mDNS] Failed to stop browse for {}: {:?}", kind, e);
            }
        }
        if let Err(e) = self.daemon.shutdown() {
            log::debug!("[mDNS] Daemon shutdown error: {:?}", e);
        }

        log::info!("[mDNS] Browsing stopped");
        Ok(())
    }

}

fn browse_error(kind: ServiceKind, err: mdns_sd::Error) -> DiscoveryError {
    DiscoveryError::Browse {
        service_type: kind.service_type(),
        reason: err.to_string(),
    }
}

/// Maps a daemon event onto the engine's event vocabulary.
fn translate(event: ServiceEvent) -> Option<DiscoveryEvent> {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            log::trace!("[mDNS] Service resolved: {:?}", info.fullname);
            parse_resolved(&info).map(DiscoveryEvent::Announced)
        }
        ServiceEvent::ServiceRemoved(ty, fullname) => {
            let kind = ServiceKind::from_service_type(&ty)?;
            log::debug!("[mDNS] Service removed: {}", fullname);
            Some(DiscoveryEvent::Lost {
                kind,
                instance_name: instance_name(&fullname, kind),
            })
        }
        _ => None,
    }
}

fn parse_resolved(info: &ResolvedService) -> Option<Announcement> {
    let kind = ServiceKind::from_service_type(&info.ty_domain)?;

    // HashSet iteration order is arbitrary; pick the lowest IPv4 so repeated
    // resolutions of the same record report the same address.
    let address = info
        .addresses
        .iter()
        .filter_map(|addr| match addr {
            ScopedIp::V4(v4) => Some(IpAddr::V4(*v4.addr())),
            _ => None,
        })
        .min();

    let txt: HashMap<String, String> = info
        .txt_properties
        .iter()
        .map(|prop| (prop.key().to_ascii_lowercase(), prop.val_str().to_string()))
        .collect();

    let port = if info.port > 0 {
        info.port
    } else {
        DEFAULT_AIRPLAY_PORT
    };

    Some(Announcement {
        kind,
        instance_name: instance_name(&info.fullname, kind),
        address,
        port,
        txt,
    })
}

/// Strips the service type suffix from a full service name.
///
/// `Kitchen._airplay._tcp.local.` becomes `Kitchen`.
fn instance_name(fullname: &str, kind: ServiceKind) -> String {
    let trimmed = fullname.trim_end_matches('.');
    let suffix = kind.service_type().trim_end_matches('.');
    trimmed
        .strip_suffix(suffix)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(trimmed)
        .to_string()
}
