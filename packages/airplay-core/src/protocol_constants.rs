//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the AirPlay service announcements, the
//! external protocol binary's command-line contract, or the group-leader
//! remote tool. Changing them breaks interoperability.

// ─────────────────────────────────────────────────────────────────────────────
// Service Discovery
// ─────────────────────────────────────────────────────────────────────────────

/// AirPlay (2) mDNS service type (note: trailing dot is required by mdns-sd).
pub const AIRPLAY_SERVICE_TYPE: &str = "_airplay._tcp.local.";

/// Legacy RAOP mDNS service type.
pub const RAOP_SERVICE_TYPE: &str = "_raop._tcp.local.";

/// Default AirPlay control port when an announcement omits one.
pub const DEFAULT_AIRPLAY_PORT: u16 = 7000;

/// Feature bit: buffered audio (AirPlay 2 streaming).
pub const FEATURE_BUFFERED_AUDIO: u32 = 40;

/// Feature bit: HomeKit pairing and access control.
pub const FEATURE_HK_PAIRING: u32 = 46;

/// Feature bit: CoreUtils pairing and encryption (HAP).
pub const FEATURE_COREUTILS_PAIRING: u32 = 48;

// ─────────────────────────────────────────────────────────────────────────────
// External Protocol Binary (cliairplay)
// ─────────────────────────────────────────────────────────────────────────────

/// Base name of the external protocol binary.
pub const CLI_BINARY_NAME: &str = "cliairplay";

/// Exit code reported when the stored credential is rejected by the device.
pub const EXIT_CREDENTIAL_REJECTED: i32 = 3;

/// Exit code reported by `pair verify` when the PIN is wrong.
pub const EXIT_WRONG_PIN: i32 = 2;

/// How long a freshly spawned session process must survive before it is
/// considered started (milliseconds).
pub const STARTUP_GRACE_MS: u64 = 500;

/// Supported `(os, arch)` pairs and the binary suffix shipped for each.
pub const SUPPORTED_PLATFORMS: &[(&str, &str, &str)] = &[
    ("linux", "x86_64", "linux-x86_64"),
    ("linux", "aarch64", "linux-aarch64"),
    ("macos", "aarch64", "darwin-arm64"),
    ("macos", "x86_64", "darwin-x86_64"),
];

// ─────────────────────────────────────────────────────────────────────────────
// Group Leader Remote
// ─────────────────────────────────────────────────────────────────────────────

/// Default name of the group-leader remote tool.
pub const ATVREMOTE_BINARY_NAME: &str = "atvremote";

/// Base delay before the bridge retries enumeration after a failure (seconds).
pub const BRIDGE_RECONNECT_BACKOFF_BASE_SECS: u64 = 2;

/// Upper bound on the bridge reconnect delay (seconds).
pub const BRIDGE_RECONNECT_BACKOFF_MAX_SECS: u64 = 60;

/// Reconnect attempts before the bridge stays detached.
pub const BRIDGE_MAX_RECONNECT_ATTEMPTS: u32 = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Application
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier reported by the health endpoint.
pub const SERVICE_ID: &str = "airplay-speakers";

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Capacity of the discovery event channel between mDNS and the service.
pub const DISCOVERY_CHANNEL_CAPACITY: usize = 64;

/// File name used by the credential store inside the data directory.
pub const CREDENTIALS_FILE: &str = "pairing_credentials.json";
