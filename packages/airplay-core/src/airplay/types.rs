//! Core domain types shared by the engine and its adapters.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    FEATURE_BUFFERED_AUDIO, FEATURE_COREUTILS_PAIRING, FEATURE_HK_PAIRING,
};

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Stable speaker key derived from a hardware identifier.
///
/// Always stored in canonical form: upper-case hex byte pairs joined by `:`
/// (e.g. `AA:BB:CC:DD:EE:FF`). Never derived from a transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpeakerId(String);

impl SpeakerId {
    /// Parses a raw hardware identifier into canonical form.
    ///
    /// Accepts `:`/`-` separated or bare hex (`aabbcc`, `AA-BB-CC`, `aa:bb:cc`).
    /// Returns `None` for empty input, odd digit counts or non-hex characters.
    pub fn parse(raw: &str) -> Option<Self> {
        let digits: String = raw
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();

        if digits.is_empty()
            || digits.len() % 2 != 0
            || !digits.chars().all(|c| c.is_ascii_hexdigit())
        {
            return None;
        }

        let upper = digits.to_ascii_uppercase();
        let pairs: Vec<&str> = (0..upper.len())
            .step_by(2)
            .map(|i| &upper[i..i + 2])
            .collect();
        Some(Self(pairs.join(":")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SpeakerId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid speaker id: {value}"))
    }
}

impl From<SpeakerId> for String {
    fn from(id: SpeakerId) -> Self {
        id.0
    }
}

/// Protocol generation, selecting the authentication variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    AirPlay1,
    AirPlay2,
}

/// Feature bitmask advertised in an announcement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityFlags(pub u64);

impl CapabilityFlags {
    /// Parses the `features`/`ft` TXT value.
    ///
    /// Formats: `0x5A7FFFF7` (low 32 bits only) or `0x5A7FFFF7,0x1E` (low, high).
    /// Plain decimal is accepted for either half.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(',');
        let low = parse_u32(parts.next()?)?;
        let high = match parts.next() {
            Some(part) => parse_u32(part)?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self((u64::from(high) << 32) | u64::from(low)))
    }

    pub fn has(&self, bit: u32) -> bool {
        bit < 64 && self.0 & (1u64 << bit) != 0
    }

    /// Protocol generation implied by the advertised features.
    pub fn protocol_version(&self) -> ProtocolVersion {
        if self.has(FEATURE_BUFFERED_AUDIO)
            || self.has(FEATURE_HK_PAIRING)
            || self.has(FEATURE_COREUTILS_PAIRING)
        {
            ProtocolVersion::AirPlay2
        } else {
            ProtocolVersion::AirPlay1
        }
    }
}

fn parse_u32(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Immutable, canonicalized description of one physical speaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerIdentity {
    pub id: SpeakerId,
    pub display_name: String,
    pub model: Option<String>,
    pub protocol_version: ProtocolVersion,
    pub capability_flags: CapabilityFlags,
}

/// Mutable transport information for reaching an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerRoute {
    pub address: IpAddr,
    pub port: u16,
}

impl fmt::Display for SpeakerRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device State
// ─────────────────────────────────────────────────────────────────────────────

/// Playback state as reported by a session or the group leader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
    Stopped,
}

impl PlaybackState {
    /// Lenient parse of a state string from an external tool.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "playing" => Self::Playing,
            "paused" => Self::Paused,
            "stopped" => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Raw device state returned by a session's `get_state` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    /// Volume in `[0.0, 1.0]`.
    pub volume: f32,
    pub muted: bool,
    pub playback: PlaybackState,
    pub title: Option<String>,
    pub artist: Option<String>,
}

/// Media to play on a speaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub url: String,
    /// MIME type of the payload (e.g. `audio/mpeg`).
    pub content_type: String,
}

/// What the group leader is currently playing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NowPlaying {
    pub playback: PlaybackState,
    pub title: Option<String>,
    pub artist: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pairing
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque long-term credential produced by HAP pairing.
///
/// `Debug` output is redacted so credentials never reach the logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingCredential(String);

impl PairingCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PairingCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PairingCredential(<redacted>)")
    }
}

/// One of the two HAP pairing steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairingStep {
    One,
    Two,
}

impl PairingStep {
    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Group Leader Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Transport-level playback actions only a group leader can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportAction {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
}

impl TransportAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Next => "next",
            Self::Previous => "previous",
        }
    }
}

/// Playback command routed through a group leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackCommand {
    Transport(TransportAction),
    PlayMedia(MediaRef),
}

/// Grouping operation routed through a group leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOp {
    /// Add the target speaker to the leader's output group.
    Join,
    /// Remove the target speaker from the leader's output group.
    Leave,
    /// Replace the output group with the target plus `members`.
    Set(Vec<SpeakerId>),
}
