//! Subprocess supervision over a pseudo-terminal.

pub mod controller;

pub use controller::{ProcessController, ProcessExit, ProcessSink, ProcessSpec};
