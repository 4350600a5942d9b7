//! Device-facing side of the engine.
//!
//! [`traits`] defines the seams the services depend on; [`cli`] and
//! [`group_leader`] are the production adapters behind them, and
//! [`discovery`] turns mDNS records into announcements.

pub mod cli;
pub mod discovery;
pub mod group_leader;
pub mod traits;
pub mod types;

pub use cli::{CliAirplayBackend, CliAirplayConfig};
pub use group_leader::{AtvRemoteConfig, AtvRemoteLeader};
pub use traits::{
    BridgeError, BridgeResult, GroupLeader, ManagedIdentities, PairingBackend, SessionBackend,
    SessionError, SessionHandle, SessionResult, SessionTarget, SpeakerBackend,
};
