//! Supervision of one subprocess running on a pseudo-terminal.
//!
//! The controller spawns the child, owns the only reader of its output and
//! the only writer of its input, and reports output and exit to a
//! [`ProcessSink`]. Input is queued and written by a dedicated thread so a
//! subprocess that stops reading never blocks the caller.

use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;
use crate::error::{BridgeError, Result};
use crate::lock;

/// Bytes requested per read from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How long to wait for the child to be reaped after a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Line terminator for submitted input; the tty turns it into a newline.
const LINE_TERMINATOR: &[u8] = b"\r";

/// Default terminal size. Wide enough that tools rarely wrap.
const PTY_ROWS: u16 = 50;
const PTY_COLS: u16 = 200;

/// Receives everything the subprocess produces.
///
/// Called from the controller's reader thread; implementations must not block
/// for long.
pub trait ProcessSink: Send + Sync {
    /// Raw bytes read from the terminal.
    fn on_output(&self, data: &[u8]);

    /// The subprocess exited and all of its output has been delivered.
    fn on_exit(&self, exit: ProcessExit);
}

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Build a spec from configuration, with an optional directory override.
    pub fn from_config(config: &ProcessConfig, working_dir: Option<PathBuf>) -> Result<Self> {
        let working_dir = match working_dir.or_else(|| config.working_directory.clone()) {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        Ok(Self {
            command: config.command.clone(),
            args: config.args.clone(),
            working_dir,
            env: config.env.clone(),
        })
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Exit status as recorded by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub success: bool,
    pub code: Option<u32>,
    pub description: String,
    /// True when the exit followed [`ProcessController::stop`].
    pub requested: bool,
}

#[derive(Default)]
struct ControlState {
    input_tx: Option<SyncSender<Vec<u8>>>,
    stop_requested: bool,
    exit: Option<ProcessExit>,
}

struct Shared {
    state: Mutex<ControlState>,
    exited: Condvar,
}

/// Owner of one running subprocess.
pub struct ProcessController {
    command: String,
    pid: Option<u32>,
    shared: Arc<Shared>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    _master: Box<dyn MasterPty + Send>,
}

impl ProcessController {
    /// Spawn `spec` on a new PTY and start pumping its I/O.
    ///
    /// `input_capacity` bounds the lines waiting to be written. The sink is
    /// held weakly; once it is gone the reader stops delivering.
    pub fn start(
        spec: &ProcessSpec,
        input_capacity: usize,
        sink: Weak<dyn ProcessSink>,
    ) -> Result<Self> {
        let command = spec.display();

        if !spec.working_dir.is_dir() {
            return Err(BridgeError::spawn(
                &command,
                format!("working directory {} does not exist", spec.working_dir.display()),
            ));
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BridgeError::spawn(&command, format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        cmd.cwd(&spec.working_dir);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BridgeError::spawn(&command, e.to_string()))?;
        // Only the child may hold the slave side, or EOF is never seen.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BridgeError::spawn(&command, format!("failed to open PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BridgeError::spawn(&command, format!("failed to open PTY writer: {e}")))?;

        let (input_tx, input_rx) = mpsc::sync_channel(input_capacity.max(1));
        let shared = Arc::new(Shared {
            state: Mutex::new(ControlState {
                input_tx: Some(input_tx),
                ..ControlState::default()
            }),
            exited: Condvar::new(),
        });

        thread::Builder::new()
            .name("pty-writer".into())
            .spawn(move || write_loop(writer, input_rx))?;

        let reader_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || read_loop(reader, child, reader_shared, sink))?;

        info!(command = %command, pid = ?pid, cwd = %spec.working_dir.display(), "subprocess started");

        Ok(Self {
            command,
            pid,
            shared,
            killer: Mutex::new(killer),
            _master: pair.master,
        })
    }

    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    /// Queue `line` followed by the line terminator.
    pub fn send_line(&self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + LINE_TERMINATOR.len());
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(LINE_TERMINATOR);
        self.send_raw(data)
    }

    /// Queue bytes exactly as given.
    pub fn send_raw(&self, data: Vec<u8>) -> Result<()> {
        let state = lock(&self.shared.state);
        let Some(tx) = state.input_tx.as_ref() else {
            return Err(BridgeError::ProcessNotRunning);
        };
        match tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BridgeError::InputQueueFull),
            Err(TrySendError::Disconnected(_)) => Err(BridgeError::ProcessNotRunning),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.state).exit.is_none()
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        lock(&self.shared.state).exit.clone()
    }

    /// Ask the subprocess to exit, killing it if it is still running after
    /// `grace`. Safe to call repeatedly and after the process has exited.
    pub fn stop(&self, grace: Duration) -> Option<ProcessExit> {
        {
            let mut state = lock(&self.shared.state);
            if let Some(exit) = &state.exit {
                return Some(exit.clone());
            }
            state.stop_requested = true;
            // Closing the queue ends the writer thread.
            state.input_tx = None;
        }

        self.terminate_politely();
        if let Some(exit) = self.wait_for_exit(grace) {
            return Some(exit);
        }

        warn!(command = %self.command, pid = ?self.pid, "subprocess ignored stop request, killing");
        if let Err(e) = lock(&self.killer).kill() {
            debug!(error = %e, "kill failed");
        }
        self.wait_for_exit(KILL_WAIT)
    }

    /// Block until the subprocess has exited, or `timeout` passes.
    pub fn wait_for_exit(&self, timeout: Duration) -> Option<ProcessExit> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        loop {
            if let Some(exit) = &state.exit {
                return Some(exit.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .shared
                .exited
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }

    #[cfg(unix)]
    fn terminate_politely(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn terminate_politely(&self) {
        if let Err(e) = lock(&self.killer).kill() {
            debug!(error = %e, "kill failed");
        }
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        if self.is_running() {
            lock(&self.shared.state).input_tx = None;
            let _ = lock(&self.killer).kill();
        }
    }
}

fn write_loop(mut writer: Box<dyn Write + Send>, input_rx: Receiver<Vec<u8>>) {
    for data in input_rx {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            debug!(error = %e, "PTY write failed, dropping further input");
            break;
        }
    }
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    shared: Arc<Shared>,
    sink: Weak<dyn ProcessSink>,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => match sink.upgrade() {
                Some(sink) => sink.on_output(&buf[..n]),
                None => break,
            },
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // EIO once the child side closes
            Err(e) => {
                debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }

    let status = child.wait();
    let exit = {
        let mut state = lock(&shared.state);
        state.input_tx = None;
        let exit = match status {
            Ok(status) => ProcessExit {
                success: status.success(),
                code: Some(status.exit_code()),
                description: format!("exit code {}", status.exit_code()),
                requested: state.stop_requested,
            },
            Err(e) => ProcessExit {
                success: false,
                code: None,
                description: format!("wait failed: {e}"),
                requested: state.stop_requested,
            },
        };
        state.exit = Some(exit.clone());
        exit
    };
    shared.exited.notify_all();

    debug!(description = %exit.description, requested = exit.requested, "subprocess exited");
    if let Some(sink) = sink.upgrade() {
        sink.on_exit(exit);
    }
}
