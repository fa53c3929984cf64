//! Daemon module for claude-bridge.
//!
//! The daemon owns the session registry so that any number of adapters (a
//! local terminal, chat bots) can attach to the same sessions, and sessions
//! outlive the adapters that created them.

pub mod protocol;
pub mod server;

use std::path::PathBuf;

pub use protocol::{Request, Response};
pub use server::DaemonServer;

/// Get the socket path for the daemon.
pub fn socket_path() -> PathBuf {
    let uid = nix::unistd::getuid();
    PathBuf::from(format!("/tmp/claude-bridge-daemon-{}.sock", uid))
}
