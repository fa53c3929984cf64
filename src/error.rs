//! Error types for the bridge core.
//!
//! Every failure is scoped to at most one session; nothing here is fatal to
//! the bridge process as a whole.

use std::path::PathBuf;

/// Errors returned by the session registry, sessions and process controller.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The subprocess could not be launched. No session is created.
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// Input was sent to a subprocess that has already exited.
    #[error("process is not running")]
    ProcessNotRunning,

    /// The bounded input queue is saturated.
    #[error("input queue is full")]
    InputQueueFull,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session terminated: {0}")]
    SessionTerminated(String),

    #[error("subscriber not attached: {0}")]
    SubscriberNotFound(String),

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// A prompt response that does not name one of the prompt's choices.
    #[error("invalid choice {choice:?} for prompt {prompt_id}")]
    InvalidChoice { prompt_id: u64, choice: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub(crate) fn spawn(command: &str, reason: impl ToString) -> Self {
        Self::Spawn {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config read error: {0}")]
    Read(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),

    #[error("could not find config directory")]
    NoConfigDir,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_error_names_command() {
        let err = BridgeError::spawn("no-such-binary", "No such file or directory");
        assert_eq!(
            err.to_string(),
            "failed to spawn `no-such-binary`: No such file or directory"
        );
    }

    #[test]
    fn session_errors_display_id() {
        assert_eq!(
            BridgeError::SessionNotFound("AB12CD34".into()).to_string(),
            "session not found: AB12CD34"
        );
        assert_eq!(
            BridgeError::SessionTerminated("AB12CD34".into()).to_string(),
            "session terminated: AB12CD34"
        );
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::FileNotFound(PathBuf::from("/tmp/missing.toml"));
        assert_eq!(err.to_string(), "config file not found: /tmp/missing.toml");
    }
}
