//! Output path from subprocess to interfaces.
//!
//! - `formatter` - Escape stripping, chunking and summarization
//! - `relay` - Replay ring and per-subscriber fan-out

pub mod formatter;
pub mod relay;

pub use relay::{OutputRelay, Subscriber};
