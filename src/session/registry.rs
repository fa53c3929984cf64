//! The session registry: creation, lookup, teardown and idle sweeping.
//!
//! The table lock is held only for lookups and insert/remove. Everything that
//! can block (spawning, stopping a subprocess) happens outside it, and each
//! session serializes its own operations.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::lock;
use crate::output::Subscriber;
use crate::prompt::PromptOutcome;

use super::bridge::Session;
use super::types::{
    CloseReason, InputOrigin, RegistryStats, SessionId, SessionInfo, SessionState, SubscriberId,
};

/// Parameters for a new session.
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    /// Caller-chosen ID; generated when `None`.
    pub session_id: Option<String>,
    /// Overrides the configured working directory.
    pub working_dir: Option<PathBuf>,
}

struct Sweeper {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns every session of one bridge.
pub struct SessionRegistry {
    config: BridgeConfig,
    sessions: Mutex<HashMap<SessionId, Session>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SessionRegistry {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Start a subprocess and register it under a new or requested ID.
    pub fn create_session(&self, request: CreateSession) -> Result<Session> {
        let id = match request.session_id.as_deref() {
            Some(raw) => {
                let id = SessionId::parse(raw)?;
                self.ensure_free(&id)?;
                id
            }
            None => self.generate_id(),
        };

        let session = Session::start(id.clone(), &self.config, request.working_dir)?;

        let mut sessions = lock(&self.sessions);
        match sessions.entry(id.clone()) {
            Entry::Occupied(entry) if entry.get().state().is_live() => {
                drop(sessions);
                session.terminate(CloseReason::ExplicitDisconnect);
                return Err(BridgeError::SessionExists(id.to_string()));
            }
            Entry::Occupied(mut entry) => {
                entry.insert(session.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
            }
        }
        drop(sessions);

        info!(session_id = %id, "session created");
        Ok(session)
    }

    /// A requested ID may reuse a dead session's slot, never a live one.
    fn ensure_free(&self, id: &SessionId) -> Result<()> {
        match lock(&self.sessions).get(id) {
            Some(existing) if existing.state().is_live() => {
                Err(BridgeError::SessionExists(id.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn generate_id(&self) -> SessionId {
        let sessions = lock(&self.sessions);
        loop {
            let id = SessionId::generate();
            if !sessions.contains_key(&id) {
                return id;
            }
            debug!(session_id = %id, "generated id collided, retrying");
        }
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Session> {
        lock(&self.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::SessionNotFound(id.to_string()))
    }

    /// Attach an existing subscriber; it receives the replay buffer first.
    pub fn attach(&self, id: &SessionId, subscriber: &Subscriber) -> Result<()> {
        self.get_session(id)?.attach(subscriber)
    }

    /// Create a subscriber named `name` and attach it. `capacity` defaults to
    /// the configured subscriber queue capacity.
    pub fn attach_client(
        &self,
        id: &SessionId,
        name: &str,
        capacity: Option<usize>,
    ) -> Result<Subscriber> {
        let capacity = capacity.unwrap_or(self.config.session.subscriber_queue_capacity);
        let subscriber = Subscriber::new(name, capacity);
        self.attach(id, &subscriber)?;
        Ok(subscriber)
    }

    /// Returns whether the subscriber was attached. The session keeps running.
    pub fn detach(&self, id: &SessionId, subscriber: SubscriberId) -> Result<bool> {
        Ok(self.get_session(id)?.detach(subscriber))
    }

    pub fn submit_input(&self, id: &SessionId, text: &str, origin: InputOrigin) -> Result<()> {
        self.get_session(id)?.submit_input(text, origin)
    }

    pub fn respond_to_prompt(
        &self,
        id: &SessionId,
        prompt_id: u64,
        choice: &str,
        origin: InputOrigin,
    ) -> Result<PromptOutcome> {
        self.get_session(id)?
            .respond_to_prompt(prompt_id, choice, origin)
    }

    pub fn resync(
        &self,
        id: &SessionId,
        subscriber: SubscriberId,
        after: Option<u64>,
    ) -> Result<usize> {
        self.get_session(id)?.resync(subscriber, after)
    }

    /// Explicit teardown. The session is removed from the table.
    pub fn terminate(&self, id: &SessionId) -> Result<()> {
        let session = lock(&self.sessions)
            .remove(id)
            .ok_or_else(|| BridgeError::SessionNotFound(id.to_string()))?;
        session.terminate(CloseReason::ExplicitDisconnect);
        Ok(())
    }

    /// Terminate idle sessions and drop ones that have already ended.
    ///
    /// Returns the IDs removed from the table.
    pub fn sweep(&self) -> Vec<SessionId> {
        let timeout = self.config.session.timeout;
        let candidates: Vec<(SessionId, Session)> = lock(&self.sessions)
            .iter()
            .map(|(id, session)| (id.clone(), session.clone()))
            .collect();

        let mut removed = Vec::new();
        for (id, session) in candidates {
            match session.state() {
                SessionState::Terminated => {
                    debug!(session_id = %id, "reaping ended session");
                }
                state if state.is_live() && session.idle_for() > timeout => {
                    info!(session_id = %id, idle_secs = session.idle_for().as_secs(), "session idle, terminating");
                    session.terminate(CloseReason::IdleTimeout);
                }
                _ => continue,
            }
            self.remove_if_same(&id, &session);
            removed.push(id);
        }
        removed
    }

    /// Remove `id` unless its slot was reused for a newer session meanwhile.
    fn remove_if_same(&self, id: &SessionId, session: &Session) {
        let mut sessions = lock(&self.sessions);
        if sessions
            .get(id)
            .is_some_and(|current| current.same_session(session))
        {
            sessions.remove(id);
        }
    }

    /// Run [`sweep`](Self::sweep) every `cleanup_interval` on a background
    /// thread until [`shutdown`](Self::shutdown) or the registry is dropped.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = lock(&self.sweeper);
        if slot.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let registry = Arc::downgrade(self);
        let interval = self.config.session.cleanup_interval;

        let spawned = thread::Builder::new()
            .name("session-sweeper".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.sweep();
                if !removed.is_empty() {
                    info!(count = removed.len(), "sweep removed sessions");
                }
            });

        match spawned {
            Ok(handle) => {
                info!(interval_secs = interval.as_secs(), "session sweeper started");
                *slot = Some(Sweeper { stop_tx, handle });
            }
            Err(e) => warn!(error = %e, "failed to start session sweeper"),
        }
    }

    /// Stop the sweeper and terminate every session.
    pub fn shutdown(&self) {
        let sweeper = lock(&self.sweeper).take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.stop_tx.send(());
            if sweeper.handle.join().is_err() {
                warn!("session sweeper panicked");
            }
        }

        let sessions: Vec<Session> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        info!(count = sessions.len(), "shutting down sessions");
        for session in sessions {
            session.terminate(CloseReason::ExplicitDisconnect);
        }
    }

    /// All sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Session> = lock(&self.sessions).values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(Session::info).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions: Vec<Session> = lock(&self.sessions).values().cloned().collect();
        let mut stats = RegistryStats {
            total: sessions.len(),
            ..RegistryStats::default()
        };
        for session in &sessions {
            match session.state() {
                SessionState::Starting | SessionState::Active => stats.active += 1,
                SessionState::AwaitingPrompt => {
                    stats.active += 1;
                    stats.awaiting_prompt += 1;
                }
                SessionState::Terminating | SessionState::Terminated => {}
            }
        }
        stats
    }
}
