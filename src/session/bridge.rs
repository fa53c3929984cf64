//! One live session: a subprocess, its output pipeline and its prompt state.
//!
//! Output read by the process controller flows through
//! `decode -> strip -> chunk -> relay` and, in parallel, into the prompt
//! detector. Lock order is `status -> controller -> relay`, and `status`
//! before `pipeline`; nothing acquires them in the other direction.
//!
//! At most one prompt is pending. A prompt detected while another is pending
//! is dropped rather than queued, and answering a prompt discards whatever
//! the detector had buffered, so detection restarts from the output that
//! follows the answer.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::lock;
use crate::output::formatter;
use crate::output::{OutputRelay, Subscriber};
use crate::prompt::{DetectedPrompt, PromptDetector, PromptOutcome, PromptRequest, DISMISS_SEQUENCE};
use crate::pty::{ProcessController, ProcessExit, ProcessSink, ProcessSpec};

use super::types::{
    BridgeEvent, CloseReason, HistoryEntry, InputOrigin, OutputChunk, PromptResolution, SessionId,
    SessionInfo, SessionState, SubscriberId,
};

/// History text recorded when a menu is dismissed rather than answered.
const DISMISS_LABEL: &str = "<escape>";

#[derive(Debug, Clone)]
struct Limits {
    max_output_length: usize,
    max_history: usize,
    prompt_timeout: Duration,
    stop_grace: Duration,
    ready_grace: Duration,
}

impl Limits {
    fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_output_length: config.session.max_output_length,
            max_history: config.session.max_history,
            prompt_timeout: config.process.timeout,
            stop_grace: config.process.stop_grace,
            ready_grace: config.session.ready_grace,
        }
    }
}

struct SessionStatus {
    state: SessionState,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    pending_prompt: Option<PromptRequest>,
    next_prompt_id: u64,
    history: VecDeque<HistoryEntry>,
    close_reason: Option<CloseReason>,
}

impl SessionStatus {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }
}

/// Decoder state carried between reads.
#[derive(Default)]
struct Pipeline {
    utf8_carry: Vec<u8>,
    escape_carry: String,
    detector: PromptDetector,
}

impl Pipeline {
    /// Turn raw terminal bytes into clean text, holding back a trailing
    /// partial UTF-8 character or escape sequence for the next read.
    fn decode(&mut self, data: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.utf8_carry);
        bytes.extend_from_slice(data);

        let complete = match std::str::from_utf8(&bytes) {
            Ok(_) => bytes.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => bytes.len(),
        };
        self.utf8_carry = bytes.split_off(complete);

        let mut text = std::mem::take(&mut self.escape_carry);
        text.push_str(&String::from_utf8_lossy(&bytes));

        let (done, pending) = formatter::split_trailing_escape(&text);
        let stripped = formatter::strip_control_sequences(done);
        self.escape_carry = pending.to_string();
        stripped
    }
}

struct SessionShared {
    id: SessionId,
    created_at: DateTime<Utc>,
    working_dir: PathBuf,
    limits: Limits,
    me: Weak<SessionShared>,
    status: Mutex<SessionStatus>,
    controller: Mutex<Option<ProcessController>>,
    pipeline: Mutex<Pipeline>,
    relay: OutputRelay,
}

/// Handle to a session. Cloning shares the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Spawn the configured command and return the session in `Starting`.
    pub fn start(id: SessionId, config: &BridgeConfig, working_dir: Option<PathBuf>) -> Result<Self> {
        let spec = ProcessSpec::from_config(&config.process, working_dir)?;
        let now = Utc::now();

        let shared = Arc::new_cyclic(|me| SessionShared {
            id,
            created_at: now,
            working_dir: spec.working_dir.clone(),
            limits: Limits::from_config(config),
            me: me.clone(),
            status: Mutex::new(SessionStatus {
                state: SessionState::Starting,
                last_activity: Instant::now(),
                last_activity_at: now,
                pending_prompt: None,
                next_prompt_id: 0,
                history: VecDeque::new(),
                close_reason: None,
            }),
            controller: Mutex::new(None),
            pipeline: Mutex::new(Pipeline::default()),
            relay: OutputRelay::new(config.session.output_buffer_chunks),
        });

        let sink = Arc::downgrade(&shared) as Weak<dyn ProcessSink>;
        let controller =
            ProcessController::start(&spec, config.session.input_queue_capacity, sink)?;

        {
            // The child may already have exited and closed the session.
            let status = lock(&shared.status);
            if status.state.is_live() {
                *lock(&shared.controller) = Some(controller);
            }
        }

        shared.spawn_ready_timer();
        info!(session_id = %shared.id, cwd = %shared.working_dir.display(), "session started");
        Ok(Self { shared })
    }

    /// True when both handles refer to the same running session.
    pub fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn id(&self) -> &SessionId {
        &self.shared.id
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared.status).state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        lock(&self.shared.status).last_activity_at
    }

    /// Time since the last input or output.
    pub fn idle_for(&self) -> Duration {
        lock(&self.shared.status).last_activity.elapsed()
    }

    pub fn working_dir(&self) -> &Path {
        &self.shared.working_dir
    }

    pub fn process_id(&self) -> Option<u32> {
        lock(&self.shared.controller)
            .as_ref()
            .and_then(ProcessController::process_id)
    }

    pub fn pending_prompt(&self) -> Option<PromptRequest> {
        lock(&self.shared.status).pending_prompt.clone()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.shared.status).close_reason
    }

    /// Past input, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        lock(&self.shared.status).history.iter().cloned().collect()
    }

    /// The last `count` buffered output chunks.
    pub fn recent_output(&self, count: usize) -> Vec<OutputChunk> {
        self.shared.relay.recent(count)
    }

    /// The last `count` chunks joined into tidy text.
    pub fn recent_output_text(&self, count: usize) -> String {
        let text: String = self
            .recent_output(count)
            .into_iter()
            .map(|chunk| chunk.text)
            .collect();
        formatter::clean_whitespace(&text)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.relay.subscriber_count()
    }

    pub fn info(&self) -> SessionInfo {
        let (state, last_activity_at, command_count, pending_prompt) = {
            let status = lock(&self.shared.status);
            (
                status.state,
                status.last_activity_at,
                status.history.len(),
                status.pending_prompt.as_ref().map(|p| p.prompt_id),
            )
        };
        SessionInfo {
            session_id: self.shared.id.clone(),
            state,
            created_at: self.shared.created_at,
            last_activity_at,
            working_dir: self.shared.working_dir.clone(),
            pid: self.process_id(),
            command_count,
            buffered_chunks: self.shared.relay.buffered(),
            subscriber_count: self.shared.relay.subscriber_count(),
            pending_prompt,
        }
    }

    /// Add a subscriber: it first receives the replay buffer, then the
    /// pending prompt if any, then live events.
    pub fn attach(&self, subscriber: &Subscriber) -> Result<()> {
        let status = lock(&self.shared.status);
        if !status.state.is_live() {
            return Err(BridgeError::SessionTerminated(self.shared.id.to_string()));
        }
        self.shared
            .relay
            .subscribe(subscriber)
            .map_err(|_| BridgeError::SessionTerminated(self.shared.id.to_string()))?;
        if let Some(prompt) = &status.pending_prompt {
            subscriber.push(BridgeEvent::Prompt(prompt.clone()));
        }
        info!(session_id = %self.shared.id, subscriber = %subscriber.id(), name = subscriber.name(), "attached");
        Ok(())
    }

    /// Remove a subscriber. The subprocess keeps running.
    pub fn detach(&self, subscriber: SubscriberId) -> bool {
        let removed = self.shared.relay.unsubscribe(subscriber);
        if removed {
            info!(session_id = %self.shared.id, subscriber = %subscriber, "detached");
        }
        removed
    }

    /// Replay buffered chunks after `after` to a subscriber that saw a gap.
    pub fn resync(&self, subscriber: SubscriberId, after: Option<u64>) -> Result<usize> {
        self.shared
            .relay
            .resync(subscriber, after)
            .ok_or_else(|| BridgeError::SubscriberNotFound(subscriber.to_string()))
    }

    /// Write a line of input to the subprocess.
    ///
    /// If a prompt is pending, this input answers it in place of a
    /// structured response.
    pub fn submit_input(&self, text: &str, origin: InputOrigin) -> Result<()> {
        let shared = &self.shared;
        let mut status = lock(&shared.status);
        shared.ensure_live(&status)?;

        let pending = status.pending_prompt.as_ref().map(|p| p.prompt_id);
        if pending.is_some() {
            shared.clear_detector();
        }
        shared.send_line(text)?;

        match pending {
            Some(prompt_id) => {
                debug!(session_id = %shared.id, prompt_id, "input supersedes pending prompt");
                shared.resolve_locked(&mut status, prompt_id, text.to_string(), origin);
            }
            None => {
                shared.record_input(&mut status, text.to_string(), origin, None);
            }
        }
        Ok(())
    }

    /// Answer the pending prompt. The first valid answer for a prompt id
    /// wins; anything later is [`PromptOutcome::Stale`] and writes nothing.
    pub fn respond_to_prompt(
        &self,
        prompt_id: u64,
        choice: &str,
        origin: InputOrigin,
    ) -> Result<PromptOutcome> {
        let shared = &self.shared;
        let mut status = lock(&shared.status);
        shared.ensure_live(&status)?;

        let key = match status.pending_prompt.as_ref() {
            Some(pending) if pending.prompt_id == prompt_id => pending
                .resolve_choice(choice)
                .ok_or_else(|| BridgeError::InvalidChoice {
                    prompt_id,
                    choice: choice.to_string(),
                })?,
            _ => {
                debug!(session_id = %shared.id, prompt_id, answered_by = %origin, "stale prompt response ignored");
                return Ok(PromptOutcome::Stale);
            }
        };

        shared.clear_detector();
        shared.send_line(&key)?;
        shared.resolve_locked(&mut status, prompt_id, key, origin);
        Ok(PromptOutcome::Accepted)
    }

    /// Stop the subprocess and close the session with `reason`.
    ///
    /// Returns false if the session was already terminating or terminated.
    pub fn terminate(&self, reason: CloseReason) -> bool {
        let shared = &self.shared;
        let controller = {
            let mut status = lock(&shared.status);
            if !status.state.is_live() {
                return false;
            }
            status.state = SessionState::Terminating;
            status.pending_prompt = None;
            lock(&shared.controller).take()
        };

        info!(session_id = %shared.id, %reason, "terminating session");
        if let Some(controller) = &controller {
            if controller.stop(shared.limits.stop_grace).is_none() {
                warn!(session_id = %shared.id, "subprocess did not exit after kill");
            }
        }
        shared.close(reason);
        true
    }
}

impl SessionShared {
    fn ensure_live(&self, status: &SessionStatus) -> Result<()> {
        if status.state.is_live() {
            Ok(())
        } else {
            Err(BridgeError::SessionTerminated(self.id.to_string()))
        }
    }

    fn clear_detector(&self) {
        lock(&self.pipeline).detector.reset();
    }

    fn send_line(&self, line: &str) -> Result<()> {
        lock(&self.controller)
            .as_ref()
            .ok_or(BridgeError::ProcessNotRunning)?
            .send_line(line)
    }

    fn send_raw(&self, data: &[u8]) -> Result<()> {
        lock(&self.controller)
            .as_ref()
            .ok_or(BridgeError::ProcessNotRunning)?
            .send_raw(data.to_vec())
    }

    fn record_input(
        &self,
        status: &mut SessionStatus,
        text: String,
        origin: InputOrigin,
        prompt_id: Option<u64>,
    ) {
        status.touch();
        if self.limits.max_history == 0 {
            return;
        }
        while status.history.len() >= self.limits.max_history {
            status.history.pop_front();
        }
        status.history.push_back(HistoryEntry {
            timestamp: Utc::now(),
            text,
            origin,
            prompt_id,
        });
    }

    /// Clear the pending prompt and tell everyone who answered it.
    fn resolve_locked(
        &self,
        status: &mut SessionStatus,
        prompt_id: u64,
        choice: String,
        origin: InputOrigin,
    ) {
        status.pending_prompt = None;
        if status.state == SessionState::AwaitingPrompt {
            status.state = SessionState::Active;
        }
        self.record_input(status, choice.clone(), origin.clone(), Some(prompt_id));

        info!(session_id = %self.id, prompt_id, choice = %choice, answered_by = %origin, "prompt resolved");
        self.relay
            .broadcast(BridgeEvent::PromptResolved(PromptResolution {
                prompt_id,
                choice,
                answered_by: origin,
            }));
    }

    fn raise_prompt(&self, detected: DetectedPrompt) {
        let request = {
            let mut status = lock(&self.status);
            if !status.state.is_live() {
                return;
            }
            if let Some(pending) = &status.pending_prompt {
                debug!(session_id = %self.id, pending = pending.prompt_id, "prompt already pending, suppressed");
                return;
            }
            status.next_prompt_id += 1;
            let request = PromptRequest::from_detection(status.next_prompt_id, detected);
            status.pending_prompt = Some(request.clone());
            status.state = SessionState::AwaitingPrompt;
            self.relay.broadcast(BridgeEvent::Prompt(request.clone()));
            request
        };

        info!(
            session_id = %self.id,
            prompt_id = request.prompt_id,
            kind = ?request.kind,
            message = %request.message,
            "prompt raised"
        );
        self.spawn_prompt_timer(request.prompt_id);
    }

    /// Answer `prompt_id` with its safe default if it is still pending.
    fn expire_prompt(&self, prompt_id: u64) {
        let mut status = lock(&self.status);
        let Some(pending) = status
            .pending_prompt
            .as_ref()
            .filter(|p| p.prompt_id == prompt_id)
        else {
            return;
        };

        self.clear_detector();
        let (sent, choice) = match pending.default_choice() {
            Some(key) => (self.send_line(&key), key),
            None => (self.send_raw(DISMISS_SEQUENCE), DISMISS_LABEL.to_string()),
        };
        if let Err(e) = sent {
            warn!(session_id = %self.id, prompt_id, error = %e, "could not send default answer");
        }

        warn!(session_id = %self.id, prompt_id, choice = %choice, "prompt timed out, sent default");
        self.resolve_locked(&mut status, prompt_id, choice, InputOrigin::System);
    }

    fn spawn_prompt_timer(&self, prompt_id: u64) {
        let me = self.me.clone();
        let timeout = self.limits.prompt_timeout;
        let spawned = thread::Builder::new()
            .name("prompt-timeout".into())
            .spawn(move || {
                thread::sleep(timeout);
                if let Some(session) = me.upgrade() {
                    session.expire_prompt(prompt_id);
                }
            });
        if let Err(e) = spawned {
            warn!(session_id = %self.id, error = %e, "failed to start prompt timer");
        }
    }

    fn spawn_ready_timer(&self) {
        let me = self.me.clone();
        let grace = self.limits.ready_grace;
        let spawned = thread::Builder::new()
            .name("session-ready".into())
            .spawn(move || {
                thread::sleep(grace);
                if let Some(session) = me.upgrade() {
                    session.mark_ready();
                }
            });
        if let Err(e) = spawned {
            warn!(session_id = %self.id, error = %e, "failed to start ready timer");
        }
    }

    fn mark_ready(&self) {
        let mut status = lock(&self.status);
        if status.state == SessionState::Starting {
            status.state = SessionState::Active;
            debug!(session_id = %self.id, "session ready");
        }
    }

    /// Final transition. Only the first call has any effect.
    fn close(&self, reason: CloseReason) -> bool {
        let controller = {
            let mut status = lock(&self.status);
            if status.state == SessionState::Terminated {
                return false;
            }
            status.state = SessionState::Terminated;
            status.pending_prompt = None;
            status.close_reason = Some(reason);
            lock(&self.controller).take()
        };

        self.relay.close(reason);
        drop(controller);
        info!(session_id = %self.id, %reason, "session closed");
        true
    }
}

impl ProcessSink for SessionShared {
    fn on_output(&self, data: &[u8]) {
        let text = lock(&self.pipeline).decode(data);

        {
            let mut status = lock(&self.status);
            status.touch();
            if status.state == SessionState::Starting {
                status.state = SessionState::Active;
            }
        }

        if text.is_empty() {
            return;
        }
        for segment in formatter::chunk(&text, self.limits.max_output_length) {
            self.relay.publish(segment);
        }

        let detected = lock(&self.pipeline).detector.feed(&text);
        if let Some(detected) = detected {
            self.raise_prompt(detected);
        }
    }

    fn on_exit(&self, exit: ProcessExit) {
        if exit.requested {
            return;
        }

        let reason = if exit.success {
            info!(session_id = %self.id, status = %exit.description, "subprocess exited");
            CloseReason::ProcessExitedCleanly
        } else {
            warn!(session_id = %self.id, status = %exit.description, "subprocess crashed");
            CloseReason::ProcessCrashed
        };
        self.relay
            .publish(format!("[process exited: {}]", exit.description));
        self.close(reason);
    }
}
