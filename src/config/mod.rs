//! Configuration for claude-bridge.
//!
//! The bridge core only ever sees a constructed [`BridgeConfig`]; loading it
//! from disk and the environment happens here, at the edge.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Subprocess launch settings
    #[serde(default)]
    pub process: ProcessConfig,

    /// Session lifecycle and buffering
    #[serde(default)]
    pub session: SessionConfig,

    /// Log filter settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Load configuration from the default location, or return defaults if not found.
    ///
    /// Environment overrides are applied on top of whatever was loaded.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit TOML file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let contents = fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;

        Ok(config_dir.join("claude-bridge").join("config.toml"))
    }

    /// Apply `CLAUDE_BRIDGE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(command) = lookup("CLAUDE_BRIDGE_COMMAND") {
            self.process.command = command;
        }
        if let Some(dir) = lookup("CLAUDE_BRIDGE_WORKDIR") {
            self.process.working_directory = Some(PathBuf::from(dir));
        }
        if let Some(secs) = lookup("CLAUDE_BRIDGE_SESSION_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.session.timeout = Duration::from_secs(secs);
        }
        if let Some(level) = lookup("CLAUDE_BRIDGE_LOG") {
            self.logging.level = level;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.process.command.trim().is_empty() {
            errors.push("process.command is required");
        }
        if self.process.timeout.is_zero() {
            errors.push("process.timeout must be positive");
        }
        if self.session.timeout.is_zero() {
            errors.push("session.timeout must be positive");
        }
        if self.session.cleanup_interval.is_zero() {
            errors.push("session.cleanup_interval must be positive");
        }
        if self.session.max_output_length == 0 {
            errors.push("session.max_output_length must be positive");
        }
        if self.session.output_buffer_chunks == 0 {
            errors.push("session.output_buffer_chunks must be positive");
        }
        if self.session.input_queue_capacity == 0 {
            errors.push("session.input_queue_capacity must be positive");
        }
        if self.session.subscriber_queue_capacity == 0 {
            errors.push("session.subscriber_queue_capacity must be positive");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }
}

/// How the bridged subprocess is launched and stopped
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Executable to run in each session
    pub command: String,

    /// Extra arguments passed to the executable
    pub args: Vec<String>,

    /// Working directory; the bridge's own cwd when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,

    /// How long a detected prompt may wait for an answer before the safe
    /// default is sent
    #[serde(with = "duration_secs", rename = "timeout_secs")]
    pub timeout: Duration,

    /// Time between the polite stop signal and the forced kill
    #[serde(with = "duration_secs", rename = "stop_grace_secs")]
    pub stop_grace: Duration,

    /// Extra environment variables for the subprocess
    pub env: Vec<(String, String)>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            working_directory: None,
            timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(5),
            env: Vec::new(),
        }
    }
}

/// Session lifecycle and buffer limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which the sweeper terminates a session
    #[serde(with = "duration_secs", rename = "timeout_secs")]
    pub timeout: Duration,

    /// Maximum characters in one output chunk (transport message size)
    pub max_output_length: usize,

    /// Number of past input commands retained per session
    pub max_history: usize,

    /// Interval between idle sweeps
    #[serde(with = "duration_secs", rename = "cleanup_interval_secs")]
    pub cleanup_interval: Duration,

    /// Number of recent chunks kept for replay on attach
    pub output_buffer_chunks: usize,

    /// Lines that may wait for the subprocess's input stream
    pub input_queue_capacity: usize,

    /// Default outbound queue capacity for a new subscriber
    pub subscriber_queue_capacity: usize,

    /// How long a silent subprocess stays `Starting` before it counts as ready
    #[serde(with = "duration_millis", rename = "ready_grace_ms")]
    pub ready_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            max_output_length: 1900,
            max_history: 100,
            cleanup_interval: Duration::from_secs(300),
            output_buffer_chunks: 50,
            input_queue_capacity: 64,
            subscriber_queue_capacity: 256,
            ready_grace: Duration::from_millis(1500),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `claude_bridge=debug`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.process.command, "claude");
        assert_eq!(config.process.timeout, Duration::from_secs(120));
        assert_eq!(config.session.timeout, Duration::from_secs(3600));
        assert_eq!(config.session.max_output_length, 1900);
        assert_eq!(config.session.max_history, 100);
        assert_eq!(config.session.cleanup_interval, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[process]\ncommand = \"bash\"\ntimeout_secs = 30\n\n[session]\nmax_history = 5\nready_grace_ms = 250\n"
        )
        .unwrap();

        let config = BridgeConfig::load_from(file.path()).unwrap();
        assert_eq!(config.process.command, "bash");
        assert_eq!(config.process.timeout, Duration::from_secs(30));
        assert_eq!(config.process.stop_grace, Duration::from_secs(5));
        assert_eq!(config.session.max_history, 5);
        assert_eq!(config.session.ready_grace, Duration::from_millis(250));
        assert_eq!(config.session.max_output_length, 1900);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = BridgeConfig::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]\nmax_history = \"lots\"").unwrap();
        let err = BridgeConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CLAUDE_BRIDGE_COMMAND", "/usr/bin/env"),
            ("CLAUDE_BRIDGE_WORKDIR", "/tmp"),
            ("CLAUDE_BRIDGE_SESSION_TIMEOUT", "60"),
            ("CLAUDE_BRIDGE_LOG", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = BridgeConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.process.command, "/usr/bin/env");
        assert_eq!(config.process.working_directory, Some(PathBuf::from("/tmp")));
        assert_eq!(config.session.timeout, Duration::from_secs(60));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BridgeConfig::default();
        config.process.command = "  ".to_string();
        config.session.max_output_length = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("process.command"));
        assert!(err.contains("max_output_length"));
    }

    #[test]
    fn test_config_serialization() {
        let config = BridgeConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: BridgeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.session.timeout, config.session.timeout);
        assert_eq!(parsed.process.command, config.process.command);
    }
}
