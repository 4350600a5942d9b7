//! AirPlay speaker discovery via mDNS.

pub mod mdns;
pub mod types;

pub use mdns::MdnsBrowser;
pub use types::{Announcement, DiscoveryError, DiscoveryEvent, DiscoveryResult, ServiceKind};
