//! Session data model: identifiers, lifecycle states, output chunks and the
//! events delivered to subscribers.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::prompt::PromptRequest;

/// Unambiguous characters for human-typable IDs (no 0/O, 1/I).
const ID_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of generated session IDs.
pub const SESSION_ID_LEN: usize = 8;

/// Longest caller-supplied session ID accepted.
const MAX_SESSION_ID_LEN: usize = 64;

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a random fixed-width ID from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..SESSION_ID_LEN)
            .map(|_| char::from(ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())]))
            .collect();
        Self(id)
    }

    /// Accept a caller-supplied ID. IDs are case-insensitive and stored upper-case.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let valid = !trimmed.is_empty()
            && trimmed.len() <= MAX_SESSION_ID_LEN
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(BridgeError::InvalidSessionId(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Identifies one attached interface instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Starting,
    Active,
    AwaitingPrompt,
    Terminating,
    Terminated,
}

impl SessionState {
    /// Whether the session still owns a running subprocess.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Active | Self::AwaitingPrompt)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::AwaitingPrompt => "awaiting-prompt",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Why a session ended. Sent exactly once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    ExplicitDisconnect,
    IdleTimeout,
    ProcessCrashed,
    ProcessExitedCleanly,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ExplicitDisconnect => "disconnected",
            Self::IdleTimeout => "idle timeout",
            Self::ProcessCrashed => "process crashed",
            Self::ProcessExitedCleanly => "process exited",
        };
        f.write_str(text)
    }
}

/// One formatted, size-bounded unit of output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Per-session, starts at 1, strictly increasing.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Who produced a line of input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputOrigin {
    /// An interface, optionally tied to an attached subscriber.
    Client {
        name: String,
        subscriber: Option<SubscriberId>,
    },
    /// The bridge itself, e.g. a timed-out prompt's default answer.
    System,
}

impl InputOrigin {
    pub fn client(name: impl Into<String>) -> Self {
        Self::Client {
            name: name.into(),
            subscriber: None,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

impl fmt::Display for InputOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client { name, .. } => f.write_str(name),
            Self::System => f.write_str("system"),
        }
    }
}

/// One entry of a session's command history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub origin: InputOrigin,
    /// Set when this input answered a prompt.
    pub prompt_id: Option<u64>,
}

/// Broadcast when a pending prompt is answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptResolution {
    pub prompt_id: u64,
    /// Text written to the subprocess.
    pub choice: String,
    pub answered_by: InputOrigin,
}

/// Everything a subscriber can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeEvent {
    /// Buffered chunks, sent first on attach and on resync.
    Replay { chunks: Vec<OutputChunk> },
    Output(OutputChunk),
    Prompt(PromptRequest),
    PromptResolved(PromptResolution),
    /// Terminal event; nothing follows it.
    SessionClosed { reason: CloseReason },
}

impl BridgeEvent {
    /// Output-carrying events, bounded by the subscriber's queue capacity.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Replay { .. } | Self::Output(_))
    }
}

/// Summary of a session for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub working_dir: PathBuf,
    pub pid: Option<u32>,
    pub command_count: usize,
    pub buffered_chunks: usize,
    pub subscriber_count: usize,
    pub pending_prompt: Option<u64>,
}

/// Counts across the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub awaiting_prompt: usize,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generated_ids_are_fixed_width_and_typable() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), SESSION_ID_LEN);
        assert!(id.as_str().bytes().all(|b| ID_ALPHABET.contains(&b)));
    }

    #[test]
    fn generated_ids_do_not_repeat() {
        let ids: HashSet<SessionId> = (0..1000).map(|_| SessionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn parse_normalizes_case_and_rejects_garbage() {
        assert_eq!(SessionId::parse(" ab12cd ").unwrap().as_str(), "AB12CD");
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("has space").is_err());
        assert!(SessionId::parse(&"x".repeat(65)).is_err());
    }

    #[test]
    fn only_output_events_are_droppable() {
        let chunk = OutputChunk {
            sequence: 1,
            timestamp: Utc::now(),
            text: "hi".into(),
        };
        assert!(BridgeEvent::Output(chunk).is_droppable());
        assert!(BridgeEvent::Replay { chunks: vec![] }.is_droppable());
        assert!(!BridgeEvent::SessionClosed {
            reason: CloseReason::IdleTimeout
        }
        .is_droppable());
    }

    #[test]
    fn events_serialize_for_the_wire() {
        let event = BridgeEvent::SessionClosed {
            reason: CloseReason::ProcessCrashed,
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: BridgeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
