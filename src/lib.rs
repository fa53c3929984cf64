//! claude-bridge library crate.
//!
//! This library provides the core of the bridge, including:
//! - PTY process supervision
//! - Output formatting and fan-out to subscribers
//! - Interactive prompt detection and resolution
//! - The session registry and its idle sweeper
//! - The daemon that serves the registry over a Unix socket

pub mod config;
pub mod daemon;
pub mod daemon_client;
pub mod error;
pub mod logging;
pub mod output;
pub mod prompt;
pub mod pty;
pub mod session;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::BridgeConfig;
pub use error::{BridgeError, ConfigError, Result};
pub use session::{Session, SessionRegistry};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
