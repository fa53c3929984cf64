//! claude-bridge: terminal adapter for bridge sessions.
//!
//! Talks to `claude-bridge-daemon` (starting it when needed) and lets a local
//! terminal create, drive, and watch the same sessions remote clients use.

use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::Result;
use clap::{Parser, Subcommand};

use claude_bridge::daemon_client::{DaemonClient, EventStream};
use claude_bridge::logging;
use claude_bridge::prompt::{PromptOutcome, PromptRequest};
use claude_bridge::session::types::{BridgeEvent, OutputChunk, SessionId, SubscriberId};

#[derive(Debug, Parser)]
#[command(name = "claude-bridge", version, about = "Share an interactive session between interfaces")]
struct Cli {
    /// Name this terminal uses in session history
    #[arg(long, global = true, default_value = "terminal")]
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a new session
    New {
        /// Session ID to use instead of a generated one
        #[arg(long)]
        id: Option<String>,
        /// Working directory for the subprocess
        #[arg(long)]
        dir: Option<String>,
        /// Attach to the session once it is created
        #[arg(long)]
        attach: bool,
    },
    /// List sessions
    List,
    /// Stream a session's output and type into it
    Attach { session_id: String },
    /// Send one line of input
    Send { session_id: String, text: String },
    /// Answer a pending prompt
    Answer {
        session_id: String,
        prompt_id: u64,
        choice: String,
    },
    /// Show the input history of a session
    History { session_id: String },
    /// Print the most recent output of a session
    Tail {
        session_id: String,
        /// Number of chunks
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
    /// Terminate a session
    Kill { session_id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init("warn");

    let client = DaemonClient::connect()?;

    match cli.command {
        Commands::New { id, dir, attach } => {
            let session_id = client.create_session(id.as_deref(), dir.as_deref())?;
            println!("{}", session_id);
            if attach {
                run_attached(client, session_id.as_str(), &cli.name)?;
            }
        }
        Commands::List => {
            let (sessions, stats) = client.list_sessions()?;
            if sessions.is_empty() {
                println!("No sessions");
            }
            for session in &sessions {
                let prompt = session
                    .pending_prompt
                    .map(|id| format!(" prompt #{}", id))
                    .unwrap_or_default();
                println!(
                    "{:<10} {:<16} {:>4} cmds {:>3} attached  {}{}",
                    session.session_id,
                    session.state.to_string(),
                    session.command_count,
                    session.subscriber_count,
                    session.working_dir.display(),
                    prompt,
                );
            }
            println!(
                "{} total, {} active, {} awaiting a prompt",
                stats.total, stats.active, stats.awaiting_prompt
            );
        }
        Commands::Attach { session_id } => run_attached(client, &session_id, &cli.name)?,
        Commands::Send { session_id, text } => {
            client.submit_input(&session_id, &cli.name, None, &text)?;
        }
        Commands::Answer {
            session_id,
            prompt_id,
            choice,
        } => match client.respond_to_prompt(&session_id, &cli.name, None, prompt_id, &choice)? {
            PromptOutcome::Accepted => println!("Answered prompt #{}", prompt_id),
            PromptOutcome::Stale => println!("Prompt #{} was already resolved", prompt_id),
        },
        Commands::History { session_id } => {
            for entry in client.history(&session_id)? {
                let prompt = entry
                    .prompt_id
                    .map(|id| format!(" (prompt #{})", id))
                    .unwrap_or_default();
                println!(
                    "{} [{}]{} {}",
                    entry.timestamp.format("%H:%M:%S"),
                    entry.origin,
                    prompt,
                    entry.text
                );
            }
        }
        Commands::Tail { session_id, count } => {
            println!("{}", client.recent_output(&session_id, count)?);
        }
        Commands::Kill { session_id } => {
            client.close_session(&session_id)?;
            println!("Session {} terminated", session_id.to_uppercase());
        }
    }

    Ok(())
}

/// Prompt currently shown to this terminal, shared with the stdin thread.
type PendingPrompt = Arc<Mutex<Option<PromptRequest>>>;

fn run_attached(client: DaemonClient, session_id: &str, name: &str) -> Result<()> {
    let mut events = client.attach(session_id, name)?;
    let session_id = events.session_id().clone();
    let subscriber_id = events.subscriber_id();
    eprintln!(
        "Attached to {} as {}. Lines are sent as input; prefix with ! to bypass a prompt.",
        session_id, name
    );

    let pending: PendingPrompt = Arc::new(Mutex::new(None));
    let client = Arc::new(client);
    spawn_input_thread(
        Arc::clone(&client),
        session_id.clone(),
        subscriber_id,
        name.to_string(),
        Arc::clone(&pending),
    );

    stream_output(&client, &mut events, &session_id, &pending)
}

fn stream_output(
    client: &DaemonClient,
    events: &mut EventStream,
    session_id: &SessionId,
    pending: &PendingPrompt,
) -> Result<()> {
    let mut view = OutputView::new(io::stdout());

    while let Some(event) = events.next_event()? {
        match event {
            BridgeEvent::Replay { chunks } => view.replay(&chunks)?,
            BridgeEvent::Output(chunk) => {
                if view.output(chunk)? {
                    client.resync(session_id.as_str(), events.subscriber_id(), view.last_sequence())?;
                }
            }
            BridgeEvent::Prompt(prompt) => {
                eprintln!();
                eprintln!("[prompt #{}] {}", prompt.prompt_id, prompt.message);
                for option in &prompt.options {
                    eprintln!("  {}) {}", option.key, option.label);
                }
                eprintln!("Type an option to answer.");
                set_pending(pending, Some(prompt));
            }
            BridgeEvent::PromptResolved(resolution) => {
                eprintln!(
                    "[prompt #{} answered by {}: {}]",
                    resolution.prompt_id, resolution.answered_by, resolution.choice
                );
                set_pending(pending, None);
            }
            BridgeEvent::SessionClosed { reason } => {
                view.flush_held()?;
                eprintln!("Session {} closed: {}", session_id, reason);
                return Ok(());
            }
        }
    }

    eprintln!("Daemon closed the connection");
    Ok(())
}

/// Chunks held while waiting for a replay before giving up on it.
const MAX_HELD_CHUNKS: usize = 256;

/// Prints chunks in sequence order, asking for a replay when some were dropped.
struct OutputView<W> {
    out: W,
    last_sequence: u64,
    /// Chunks that arrived after a gap, printed once the replay fills it.
    held: Option<Vec<OutputChunk>>,
}

impl<W: Write> OutputView<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            last_sequence: 0,
            held: None,
        }
    }

    fn last_sequence(&self) -> Option<u64> {
        (self.last_sequence > 0).then_some(self.last_sequence)
    }

    /// Returns true when a gap was found and a replay should be requested.
    fn output(&mut self, chunk: OutputChunk) -> Result<bool> {
        if let Some(held) = &mut self.held {
            held.push(chunk);
            if held.len() >= MAX_HELD_CHUNKS {
                self.flush_held()?;
            }
            return Ok(false);
        }
        if self.last_sequence > 0 && chunk.sequence > self.last_sequence + 1 {
            self.held = Some(vec![chunk]);
            return Ok(true);
        }
        self.print(&chunk)?;
        Ok(false)
    }

    fn replay(&mut self, chunks: &[OutputChunk]) -> Result<()> {
        for chunk in chunks {
            self.print(chunk)?;
        }
        self.flush_held()
    }

    fn flush_held(&mut self) -> Result<()> {
        for chunk in self.held.take().unwrap_or_default() {
            self.print(&chunk)?;
        }
        Ok(())
    }

    fn print(&mut self, chunk: &OutputChunk) -> Result<()> {
        // A replay may repeat chunks that already arrived.
        if chunk.sequence <= self.last_sequence {
            return Ok(());
        }
        self.last_sequence = chunk.sequence;
        writeln!(self.out, "{}", chunk.text)?;
        self.out.flush()?;
        Ok(())
    }
}

fn set_pending(pending: &PendingPrompt, prompt: Option<PromptRequest>) {
    *pending.lock().unwrap_or_else(PoisonError::into_inner) = prompt;
}

fn spawn_input_thread(
    client: Arc<DaemonClient>,
    session_id: SessionId,
    subscriber_id: SubscriberId,
    name: String,
    pending: PendingPrompt,
) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if let Err(e) = handle_line(&client, &session_id, subscriber_id, &name, &pending, &line)
            {
                eprintln!("Error: {:#}", e);
            }
        }
    });
}

fn handle_line(
    client: &DaemonClient,
    session_id: &SessionId,
    subscriber_id: SubscriberId,
    name: &str,
    pending: &PendingPrompt,
    line: &str,
) -> Result<()> {
    let prompt_id = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|prompt| prompt.prompt_id);

    match (prompt_id, line.strip_prefix('!')) {
        (Some(prompt_id), None) => {
            let outcome = client.respond_to_prompt(
                session_id.as_str(),
                name,
                Some(subscriber_id),
                prompt_id,
                line,
            )?;
            if outcome == PromptOutcome::Stale {
                eprintln!("Prompt #{} was already resolved", prompt_id);
            }
            Ok(())
        }
        (_, Some(text)) => client.submit_input(session_id.as_str(), name, Some(subscriber_id), text),
        (None, None) => client.submit_input(session_id.as_str(), name, Some(subscriber_id), line),
    }
}
