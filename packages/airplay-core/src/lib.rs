//! AirPlay Core - speaker session and state coordination engine.
//!
//! This crate keeps a fleet of AirPlay 1/2 speakers controllable: it turns
//! mDNS announcements into stable identities, supervises one protocol
//! session per speaker, drives HAP pairing, serializes commands per speaker
//! and keeps a polled state snapshot for each of them. An optional group
//! leader (an Apple TV) takes over playback and grouping for the speakers
//! it manages.
//!
//! # Architecture
//!
//! - [`airplay`]: device adapters (mDNS discovery, protocol binary, group leader)
//! - [`services`]: the engine (registry, supervisor, dispatcher, coordinator, bridge)
//! - [`events`]: event system for the outward state surface
//! - [`state`]: configuration and state snapshots
//! - [`api`]: HTTP control surface
//! - [`bootstrap`]: composition root
//! - [`error`]: engine and adapter errors
//!
//! # Abstraction Traits
//!
//! - [`SessionBackend`](airplay::SessionBackend) / [`PairingBackend`](airplay::PairingBackend):
//!   per-speaker protocol sessions
//! - [`GroupLeader`](airplay::GroupLeader): the optional secondary controller
//! - [`CredentialStore`](credentials::CredentialStore): pairing credential persistence
//! - [`TaskSpawner`](runtime::TaskSpawner): spawning background tasks
//! - [`EventEmitter`](events::EventEmitter): emitting domain events

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod airplay;
pub mod api;
pub mod bootstrap;
pub mod credentials;
pub mod error;
pub mod events;
pub mod protocol_constants;
pub mod runtime;
pub mod services;
pub mod state;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use airplay::types::{
    CapabilityFlags, DeviceState, GroupOp, MediaRef, PairingCredential, PlaybackState,
    ProtocolVersion, SpeakerId, SpeakerIdentity, SpeakerRoute, TransportAction,
};
pub use airplay::{AtvRemoteConfig, CliAirplayConfig};
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::{ErrorCode, SpeakerError, SpeakerResult};
pub use events::{
    BridgeEvent, BroadcastEvent, BroadcastEventBridge, EventEmitter, LoggingEventEmitter,
    PairingEvent, SessionEvent, SpeakerEvent,
};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use services::{SpeakerCommand, SpeakerService, SpeakerView, VolumeStep};
pub use state::{Availability, Config, SpeakerState};
pub use utils::now_millis;

pub use bootstrap::{bootstrap_services, BootstrapOptions, BootstrappedServices};
pub use api::{start_server, AppState, ServerError};
