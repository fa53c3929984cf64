//! IPC protocol between interface adapters and the bridge daemon.
//!
//! Every connection sends one [`Request`] and reads one [`Response`], except
//! [`Request::Attach`], which turns the connection into a stream of
//! [`Response::Event`] frames until the session closes or the client hangs up.

use serde::{Deserialize, Serialize};

use crate::prompt::PromptOutcome;
use crate::session::types::{
    BridgeEvent, HistoryEntry, RegistryStats, SessionId, SessionInfo, SubscriberId,
};

/// Request messages sent from adapters to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Ping to check daemon is alive.
    Ping,

    /// Terminate all sessions and exit.
    Shutdown,

    /// Start a new session.
    CreateSession {
        /// Requested ID; generated when absent.
        session_id: Option<String>,
        /// Working directory override.
        working_dir: Option<String>,
    },

    /// Terminate a session.
    CloseSession { session_id: String },

    /// List all sessions.
    ListSessions,

    /// Write a line of input as `client`.
    SubmitInput {
        session_id: String,
        client: String,
        subscriber_id: Option<SubscriberId>,
        text: String,
    },

    /// Answer a pending prompt as `client`.
    RespondToPrompt {
        session_id: String,
        client: String,
        subscriber_id: Option<SubscriberId>,
        prompt_id: u64,
        choice: String,
    },

    /// Subscribe to a session's events. The connection stays open.
    Attach {
        session_id: String,
        client: String,
        /// Outbound queue capacity; the daemon default when absent.
        queue_capacity: Option<usize>,
    },

    /// Replay buffered chunks after `after` to an attached subscriber.
    Resync {
        session_id: String,
        subscriber_id: SubscriberId,
        after: Option<u64>,
    },

    /// Past input of a session.
    GetHistory { session_id: String },

    /// The last `count` output chunks as plain text.
    GetOutput { session_id: String, count: usize },
}

/// Response messages sent from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Ping response.
    Pong,

    /// Shutdown acknowledged.
    ShuttingDown,

    /// Session created successfully.
    SessionCreated { session_id: SessionId },

    /// Session terminated.
    SessionClosed { session_id: SessionId },

    /// All sessions with registry counters.
    SessionList {
        sessions: Vec<SessionInfo>,
        stats: RegistryStats,
    },

    /// Input queued for the subprocess.
    InputAccepted,

    /// Outcome of a prompt response.
    PromptAnswered {
        prompt_id: u64,
        outcome: PromptOutcome,
    },

    /// First frame of an attached stream.
    Attached {
        session_id: SessionId,
        subscriber_id: SubscriberId,
    },

    /// One event on an attached stream.
    Event(BridgeEvent),

    /// Sent on an idle attached stream so dead clients are noticed.
    Keepalive,

    /// Replay queued on the attached stream.
    Resynced { replayed: usize },

    History { entries: Vec<HistoryEntry> },

    Output { text: String },

    /// Error occurred.
    Error { message: String },
}

/// Length-prefixed message framing for the IPC protocol.
pub mod framing {
    use std::io::{Read, Write};

    use super::*;

    /// Largest frame accepted from a peer.
    pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

    /// Write a message with length prefix.
    pub fn write_message<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> std::io::Result<()> {
        let data = serde_json::to_vec(msg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let len = u32::try_from(data.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "message too large")
        })?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&data)?;
        writer.flush()?;
        Ok(())
    }

    /// Read a length-prefixed message.
    pub fn read_message<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> std::io::Result<T> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_FRAME_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Message too large: {} bytes", len),
            ));
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::framing::{read_message, write_message, MAX_FRAME_BYTES};
    use super::*;

    #[test]
    fn frames_carry_requests_back_to_back() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Request::Ping).unwrap();
        write_message(
            &mut buf,
            &Request::SubmitInput {
                session_id: "ABCD2345".into(),
                client: "terminal".into(),
                subscriber_id: None,
                text: "ls -la".into(),
            },
        )
        .unwrap();

        let mut cursor = Cursor::new(buf);
        assert!(matches!(read_message(&mut cursor).unwrap(), Request::Ping));
        match read_message(&mut cursor).unwrap() {
            Request::SubmitInput { text, .. } => assert_eq!(text, "ls -la"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = ((MAX_FRAME_BYTES + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let err = read_message::<_, Request>(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Response::Pong).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(read_message::<_, Response>(&mut Cursor::new(buf)).is_err());
    }
}
