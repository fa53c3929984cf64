//! Client for communicating with the claude-bridge daemon.
//!
//! The daemon uses a connection-per-request model: each request creates a new
//! Unix socket connection, sends the request, receives the response, then closes.
//! Attaching is the exception; it keeps its connection open as an
//! [`EventStream`].

use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::daemon::protocol::{framing, Request, Response};
use crate::daemon::socket_path;
use crate::prompt::PromptOutcome;
use crate::session::types::{
    BridgeEvent, HistoryEntry, RegistryStats, SessionId, SessionInfo, SubscriberId,
};

/// Longest silence tolerated on an attached stream; the daemon sends
/// keepalives well within it.
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for communicating with the daemon.
///
/// This client creates a new connection for each request, matching the daemon's
/// connection-per-request model. The struct mainly exists to provide a clean API
/// and manage daemon lifecycle (starting it if needed).
pub struct DaemonClient {
    /// Cached socket path for efficiency
    sock_path: PathBuf,
}

impl DaemonClient {
    /// Connect to the daemon, starting it if necessary.
    ///
    /// This verifies the daemon is reachable but doesn't maintain a persistent connection.
    pub fn connect() -> Result<Self> {
        let sock_path = socket_path();

        if Self::try_ping(&sock_path).is_ok() {
            return Ok(Self { sock_path });
        }

        Self::spawn_daemon()?;

        // Wait for daemon to start
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(100));
            if Self::try_ping(&sock_path).is_ok() {
                return Ok(Self { sock_path });
            }
        }

        anyhow::bail!("Daemon failed to start after 5 seconds");
    }

    /// Use a daemon already listening on `sock_path`, without spawning one.
    pub fn at(sock_path: impl Into<PathBuf>) -> Result<Self> {
        let sock_path = sock_path.into();
        Self::try_ping(&sock_path).context("Daemon not running")?;
        Ok(Self { sock_path })
    }

    /// Try to ping the daemon at the given socket path.
    fn try_ping(sock_path: &Path) -> Result<()> {
        match Self::request_at(sock_path, &Request::Ping)? {
            Response::Pong => Ok(()),
            Response::Error { message } => anyhow::bail!("Ping failed: {}", message),
            _ => anyhow::bail!("Unexpected response to ping"),
        }
    }

    /// Spawn the daemon process.
    fn spawn_daemon() -> Result<()> {
        let daemon_path = std::env::current_exe()?
            .parent()
            .context("No parent directory for executable")?
            .join("claude-bridge-daemon");

        Command::new(&daemon_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn daemon: {:?}", daemon_path))?;

        Ok(())
    }

    fn open(sock_path: &Path, req: &Request, read_timeout: Duration) -> Result<UnixStream> {
        let stream = UnixStream::connect(sock_path)
            .context("Failed to connect to daemon - it may have stopped")?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;

        let mut writer = BufWriter::new(&stream);
        framing::write_message(&mut writer, req)?;
        writer.flush()?;
        drop(writer);
        Ok(stream)
    }

    fn request_at(sock_path: &Path, req: &Request) -> Result<Response> {
        let stream = Self::open(sock_path, req, Duration::from_secs(30))?;
        let mut reader = BufReader::new(&stream);
        let response: Response = framing::read_message(&mut reader)?;
        Ok(response)
    }

    /// Send a request and receive a response (creates a new connection).
    fn request(&self, req: Request) -> Result<Response> {
        Self::request_at(&self.sock_path, &req)
    }

    /// Ping the daemon.
    pub fn ping(&self) -> Result<()> {
        Self::try_ping(&self.sock_path)
    }

    /// Create a new session, optionally with a chosen ID and directory.
    pub fn create_session(
        &self,
        session_id: Option<&str>,
        working_dir: Option<&str>,
    ) -> Result<SessionId> {
        let req = Request::CreateSession {
            session_id: session_id.map(str::to_string),
            working_dir: working_dir.map(str::to_string),
        };

        match self.request(req)? {
            Response::SessionCreated { session_id } => Ok(session_id),
            Response::Error { message } => anyhow::bail!("Create session failed: {}", message),
            _ => anyhow::bail!("Unexpected response to create session"),
        }
    }

    /// Terminate a session.
    pub fn close_session(&self, session_id: &str) -> Result<()> {
        let req = Request::CloseSession {
            session_id: session_id.to_string(),
        };

        match self.request(req)? {
            Response::SessionClosed { .. } => Ok(()),
            Response::Error { message } => anyhow::bail!("Close session failed: {}", message),
            _ => anyhow::bail!("Unexpected response to close session"),
        }
    }

    /// List all sessions.
    pub fn list_sessions(&self) -> Result<(Vec<SessionInfo>, RegistryStats)> {
        match self.request(Request::ListSessions)? {
            Response::SessionList { sessions, stats } => Ok((sessions, stats)),
            Response::Error { message } => anyhow::bail!("List sessions failed: {}", message),
            _ => anyhow::bail!("Unexpected response to list sessions"),
        }
    }

    /// Send a line of input as `client`.
    pub fn submit_input(
        &self,
        session_id: &str,
        client: &str,
        subscriber_id: Option<SubscriberId>,
        text: &str,
    ) -> Result<()> {
        let req = Request::SubmitInput {
            session_id: session_id.to_string(),
            client: client.to_string(),
            subscriber_id,
            text: text.to_string(),
        };

        match self.request(req)? {
            Response::InputAccepted => Ok(()),
            Response::Error { message } => anyhow::bail!("Send failed: {}", message),
            _ => anyhow::bail!("Unexpected response to input"),
        }
    }

    /// Answer a pending prompt as `client`.
    pub fn respond_to_prompt(
        &self,
        session_id: &str,
        client: &str,
        subscriber_id: Option<SubscriberId>,
        prompt_id: u64,
        choice: &str,
    ) -> Result<PromptOutcome> {
        let req = Request::RespondToPrompt {
            session_id: session_id.to_string(),
            client: client.to_string(),
            subscriber_id,
            prompt_id,
            choice: choice.to_string(),
        };

        match self.request(req)? {
            Response::PromptAnswered { outcome, .. } => Ok(outcome),
            Response::Error { message } => anyhow::bail!("Answer failed: {}", message),
            _ => anyhow::bail!("Unexpected response to answer"),
        }
    }

    /// Ask for buffered chunks after `after` to be replayed on an attached stream.
    pub fn resync(
        &self,
        session_id: &str,
        subscriber_id: SubscriberId,
        after: Option<u64>,
    ) -> Result<usize> {
        let req = Request::Resync {
            session_id: session_id.to_string(),
            subscriber_id,
            after,
        };

        match self.request(req)? {
            Response::Resynced { replayed } => Ok(replayed),
            Response::Error { message } => anyhow::bail!("Resync failed: {}", message),
            _ => anyhow::bail!("Unexpected response to resync"),
        }
    }

    /// Input history of a session.
    pub fn history(&self, session_id: &str) -> Result<Vec<HistoryEntry>> {
        let req = Request::GetHistory {
            session_id: session_id.to_string(),
        };

        match self.request(req)? {
            Response::History { entries } => Ok(entries),
            Response::Error { message } => anyhow::bail!("History failed: {}", message),
            _ => anyhow::bail!("Unexpected response to history"),
        }
    }

    /// The last `count` output chunks as text.
    pub fn recent_output(&self, session_id: &str, count: usize) -> Result<String> {
        let req = Request::GetOutput {
            session_id: session_id.to_string(),
            count,
        };

        match self.request(req)? {
            Response::Output { text } => Ok(text),
            Response::Error { message } => anyhow::bail!("Output failed: {}", message),
            _ => anyhow::bail!("Unexpected response to output"),
        }
    }

    /// Attach to a session and keep the connection open for its events.
    pub fn attach(&self, session_id: &str, client: &str) -> Result<EventStream> {
        let req = Request::Attach {
            session_id: session_id.to_string(),
            client: client.to_string(),
            queue_capacity: None,
        };
        let stream = Self::open(&self.sock_path, &req, STREAM_READ_TIMEOUT)?;
        let mut reader = BufReader::new(stream);

        match framing::read_message(&mut reader)? {
            Response::Attached {
                session_id,
                subscriber_id,
            } => Ok(EventStream {
                session_id,
                subscriber_id,
                reader,
            }),
            Response::Error { message } => anyhow::bail!("Attach failed: {}", message),
            _ => anyhow::bail!("Unexpected response to attach"),
        }
    }

    /// Shutdown the daemon.
    pub fn shutdown(&self) -> Result<()> {
        match self.request(Request::Shutdown)? {
            Response::ShuttingDown => Ok(()),
            Response::Error { message } => anyhow::bail!("Shutdown failed: {}", message),
            _ => anyhow::bail!("Unexpected response to shutdown"),
        }
    }
}

/// Events of one attached session, read from the daemon.
pub struct EventStream {
    session_id: SessionId,
    subscriber_id: SubscriberId,
    reader: BufReader<UnixStream>,
}

impl EventStream {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// Next event, skipping keepalives. `None` once the daemon hangs up.
    pub fn next_event(&mut self) -> Result<Option<BridgeEvent>> {
        loop {
            let response = match framing::read_message::<_, Response>(&mut self.reader) {
                Ok(response) => response,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e).context("Lost connection to daemon"),
            };
            match response {
                Response::Event(event) => return Ok(Some(event)),
                Response::Keepalive => continue,
                Response::Error { message } => anyhow::bail!("Stream error: {}", message),
                other => anyhow::bail!("Unexpected frame on event stream: {:?}", other),
            }
        }
    }
}

/// Check if the daemon is running.
pub fn is_daemon_running() -> bool {
    DaemonClient::try_ping(&socket_path()).is_ok()
}

/// Stop the daemon if running.
pub fn stop_daemon() -> Result<()> {
    if is_daemon_running() {
        let client = DaemonClient::at(socket_path())?;
        client.shutdown()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::config::BridgeConfig;
    use crate::daemon::DaemonServer;
    use crate::session::types::CloseReason;
    use crate::session::SessionRegistry;

    fn start_daemon(dir: &Path) -> (PathBuf, thread::JoinHandle<()>) {
        let mut config = BridgeConfig::default();
        config.process.command = "cat".to_string();
        config.process.working_directory = Some(dir.to_path_buf());
        config.process.stop_grace = Duration::from_secs(1);

        let sock_path = dir.join("bridge.sock");
        let server = DaemonServer::new(Arc::new(SessionRegistry::new(config)), sock_path.clone());
        let handle = thread::spawn(move || server.run().unwrap());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !sock_path.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        (sock_path, handle)
    }

    fn next_output(stream: &mut EventStream, needle: &str) {
        while let Some(event) = stream.next_event().unwrap() {
            match event {
                BridgeEvent::Output(chunk) if chunk.text.contains(needle) => return,
                BridgeEvent::SessionClosed { .. } => panic!("closed before {needle:?}"),
                _ => {}
            }
        }
        panic!("stream ended before {needle:?}");
    }

    #[test]
    fn session_round_trip_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (sock_path, handle) = start_daemon(dir.path());
        let client = DaemonClient::at(&sock_path).unwrap();

        let id = client.create_session(Some("roundtrip"), None).unwrap();
        assert_eq!(id.as_str(), "ROUNDTRIP");

        let mut stream = client.attach("roundtrip", "test").unwrap();
        assert!(matches!(
            stream.next_event().unwrap(),
            Some(BridgeEvent::Replay { .. })
        ));

        client
            .submit_input(id.as_str(), "test", Some(stream.subscriber_id()), "hello daemon")
            .unwrap();
        next_output(&mut stream, "hello daemon");

        let history = client.history(id.as_str()).unwrap();
        assert_eq!(history[0].text, "hello daemon");
        assert!(client.recent_output(id.as_str(), 10).unwrap().contains("hello daemon"));

        let (sessions, stats) = client.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(stats.total, 1);
        assert_eq!(sessions[0].subscriber_count, 1);

        client.close_session(id.as_str()).unwrap();
        let mut closed = None;
        while let Some(event) = stream.next_event().unwrap() {
            if let BridgeEvent::SessionClosed { reason } = event {
                closed = Some(reason);
            }
        }
        assert_eq!(closed, Some(CloseReason::ExplicitDisconnect));

        client.shutdown().unwrap();
        handle.join().unwrap();
        assert!(!sock_path.exists());
    }

    #[test]
    fn errors_come_back_as_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (sock_path, handle) = start_daemon(dir.path());
        let client = DaemonClient::at(&sock_path).unwrap();

        let err = client.submit_input("missing", "test", None, "x").unwrap_err();
        assert!(err.to_string().contains("session not found"));
        assert!(client.attach("missing", "test").is_err());
        assert!(client.create_session(Some("bad id!"), None).is_err());

        client.shutdown().unwrap();
        handle.join().unwrap();
    }
}
