//! Application services layer.
//!
//! This module contains the engine services that sit between the API layer
//! and the device adapters in [`crate::airplay`].

pub mod capability_bridge;
pub mod command_dispatcher;
pub mod identity_registry;
pub mod pairing;
pub mod session_supervisor;
pub mod speaker_service;
pub mod state_coordinator;

pub use capability_bridge::{BridgeStatus, CapabilityBridge, CommandCategory};
pub use command_dispatcher::{CommandDispatcher, SpeakerCommand, VolumeStep};
pub use identity_registry::{IdentityRegistry, IgnoreReason, OwnershipChange, Resolution};
pub use pairing::{AuthState, PairingMachine, PairingProgress, PairingStatus};
pub use session_supervisor::{
    SessionPhase, SessionStatus, SessionSupervisor, SessionTable, StopReason,
};
pub use speaker_service::{SpeakerService, SpeakerView};
pub use state_coordinator::StateCoordinator;
