//! Sessions: one subprocess shared by any number of attached interfaces.
//!
//! This module provides:
//! - `SessionRegistry` - Creates, looks up, terminates and sweeps sessions
//! - `Session` - One live bridge with its prompt state and history
//! - Data model types shared with interface adapters

pub mod bridge;
pub mod registry;
pub mod types;

pub use bridge::Session;
pub use registry::{CreateSession, SessionRegistry};
pub use types::{
    BridgeEvent, CloseReason, HistoryEntry, InputOrigin, OutputChunk, PromptResolution,
    RegistryStats, SessionId, SessionInfo, SessionState, SubscriberId,
};
