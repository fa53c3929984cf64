//! Unix-socket server exposing a [`SessionRegistry`] to interface adapters.

use std::fs;
use std::io::{BufReader, BufWriter, ErrorKind};
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use super::protocol::{framing, Request, Response};
use crate::session::types::{BridgeEvent, InputOrigin, SessionId, SubscriberId};
use crate::session::{CreateSession, SessionRegistry};

/// Sleep between polls of the non-blocking listener.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Idle time on an attached stream before a keepalive frame is sent.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// The daemon: accepts connections until asked to shut down.
pub struct DaemonServer {
    registry: Arc<SessionRegistry>,
    sock_path: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl DaemonServer {
    pub fn new(registry: Arc<SessionRegistry>, sock_path: PathBuf) -> Self {
        Self {
            registry,
            sock_path,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Serve until a `Shutdown` request arrives, then terminate all sessions
    /// and remove the socket.
    pub fn run(&self) -> Result<()> {
        let listener = bind(&self.sock_path)?;
        listener
            .set_nonblocking(true)
            .context("Failed to set non-blocking")?;

        self.registry.start_sweeper();
        info!(socket = %self.sock_path.display(), "claude-bridge-daemon started");

        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let registry = Arc::clone(&self.registry);
                    let shutdown = Arc::clone(&self.shutdown);
                    let spawned = thread::Builder::new()
                        .name("daemon-client".into())
                        .spawn(move || {
                            if let Err(e) = handle_client(&registry, stream, &shutdown) {
                                debug!(error = %e, "client error");
                            }
                        });
                    if let Err(e) = spawned {
                        error!(error = %e, "failed to spawn client thread");
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    warn!(error = %e, "accept error");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }

        self.registry.shutdown();
        fs::remove_file(&self.sock_path).ok();
        info!("claude-bridge-daemon stopped");
        Ok(())
    }
}

/// Bind the socket, replacing a stale one but refusing to displace a live
/// daemon.
fn bind(sock_path: &Path) -> Result<UnixListener> {
    if sock_path.exists() {
        if UnixStream::connect(sock_path).is_ok() {
            anyhow::bail!("Daemon already running on {}", sock_path.display());
        }
        fs::remove_file(sock_path)
            .with_context(|| format!("Failed to remove stale socket {}", sock_path.display()))?;
    }
    UnixListener::bind(sock_path).context("Failed to bind socket")
}

fn handle_client(
    registry: &Arc<SessionRegistry>,
    stream: UnixStream,
    shutdown: &AtomicBool,
) -> Result<()> {
    // Accepted connections inherit non-blocking mode from the listener.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let mut reader = BufReader::new(&stream);
    let request: Request = framing::read_message(&mut reader)?;

    if let Request::Attach {
        session_id,
        client,
        queue_capacity,
    } = request
    {
        return stream_events(registry, &stream, &session_id, &client, queue_capacity, shutdown);
    }

    let response = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        process_request(registry, request, shutdown)
    }))
    .unwrap_or_else(|e| {
        let msg = if let Some(s) = e.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = e.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        error!(panic = %msg, "request handler panicked");
        Response::Error {
            message: format!("Internal error: {}", msg),
        }
    });

    let mut writer = BufWriter::new(&stream);
    framing::write_message(&mut writer, &response)?;
    Ok(())
}

fn error_response(e: impl ToString) -> Response {
    Response::Error {
        message: e.to_string(),
    }
}

fn origin(client: String, subscriber: Option<SubscriberId>) -> InputOrigin {
    InputOrigin::Client {
        name: client,
        subscriber,
    }
}

fn process_request(registry: &SessionRegistry, request: Request, shutdown: &AtomicBool) -> Response {
    match request {
        Request::Ping => Response::Pong,

        Request::Shutdown => {
            info!("shutdown requested");
            shutdown.store(true, Ordering::SeqCst);
            Response::ShuttingDown
        }

        Request::CreateSession {
            session_id,
            working_dir,
        } => {
            let request = CreateSession {
                session_id,
                working_dir: working_dir.map(PathBuf::from),
            };
            match registry.create_session(request) {
                Ok(session) => Response::SessionCreated {
                    session_id: session.id().clone(),
                },
                Err(e) => error_response(e),
            }
        }

        Request::CloseSession { session_id } => with_session(&session_id, |id| {
            registry.terminate(&id)?;
            Ok(Response::SessionClosed { session_id: id })
        }),

        Request::ListSessions => Response::SessionList {
            sessions: registry.list_sessions(),
            stats: registry.stats(),
        },

        Request::SubmitInput {
            session_id,
            client,
            subscriber_id,
            text,
        } => with_session(&session_id, |id| {
            registry
                .submit_input(&id, &text, origin(client, subscriber_id))
                .map(|()| Response::InputAccepted)
        }),

        Request::RespondToPrompt {
            session_id,
            client,
            subscriber_id,
            prompt_id,
            choice,
        } => with_session(&session_id, |id| {
            registry
                .respond_to_prompt(&id, prompt_id, &choice, origin(client, subscriber_id))
                .map(|outcome| Response::PromptAnswered { prompt_id, outcome })
        }),

        Request::Resync {
            session_id,
            subscriber_id,
            after,
        } => with_session(&session_id, |id| {
            registry
                .resync(&id, subscriber_id, after)
                .map(|replayed| Response::Resynced { replayed })
        }),

        Request::GetHistory { session_id } => with_session(&session_id, |id| {
            registry.get_session(&id).map(|session| Response::History {
                entries: session.history(),
            })
        }),

        Request::GetOutput { session_id, count } => with_session(&session_id, |id| {
            registry.get_session(&id).map(|session| Response::Output {
                text: session.recent_output_text(count),
            })
        }),

        // Handled before dispatch; a second attach on one connection is not supported.
        Request::Attach { .. } => error_response("attach must be the first request"),
    }
}

/// Parse the wire ID and run `f`, mapping any error to `Response::Error`.
fn with_session(
    raw_id: &str,
    f: impl FnOnce(SessionId) -> crate::Result<Response>,
) -> Response {
    match SessionId::parse(raw_id).and_then(f) {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

/// Serve an attached subscriber until the session closes or the client goes
/// away.
fn stream_events(
    registry: &SessionRegistry,
    stream: &UnixStream,
    raw_id: &str,
    client: &str,
    queue_capacity: Option<usize>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut writer = BufWriter::new(stream);

    let attached = SessionId::parse(raw_id)
        .and_then(|id| registry.attach_client(&id, client, queue_capacity).map(|s| (id, s)));
    let (id, subscriber) = match attached {
        Ok(pair) => pair,
        Err(e) => {
            framing::write_message(&mut writer, &error_response(e))?;
            return Ok(());
        }
    };

    framing::write_message(
        &mut writer,
        &Response::Attached {
            session_id: id.clone(),
            subscriber_id: subscriber.id(),
        },
    )?;

    loop {
        let frame = match subscriber.recv_timeout(KEEPALIVE_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if framing::write_message(&mut writer, &Response::Keepalive).is_err() {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let closing = matches!(frame, BridgeEvent::SessionClosed { .. });
        if let Err(e) = framing::write_message(&mut writer, &Response::Event(frame)) {
            debug!(session_id = %id, client, error = %e, "attached client went away");
            break;
        }
        if closing {
            return Ok(());
        }
    }

    if subscriber.dropped() > 0 {
        debug!(session_id = %id, client, dropped = subscriber.dropped(), "subscriber fell behind");
    }
    let _ = registry.detach(&id, subscriber.id());
    Ok(())
}
