//! Client-server message types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::*;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Initial connection handshake
    Connect {
        client_id: Uuid,
        protocol_version: u32,
    },

    /// Request a fresh terminal-list snapshot
    ListTerminals,

    /// Spawn a new terminal
    Spawn { options: SpawnOptions },

    /// Send input bytes to a terminal
    Input { terminal_id: Uuid, data: Vec<u8> },

    /// Request a resize; the server debounces and applies the latest
    RequestResize {
        terminal_id: Uuid,
        cols: u16,
        rows: u16,
        source: ResizeSource,
    },

    /// Start receiving a terminal's output. This is the only path by which
    /// a connection is added to a terminal's ownership set.
    RequestOwnership { terminal_id: Uuid },

    /// Stop receiving a terminal's output
    ReleaseOwnership { terminal_id: Uuid },

    /// Re-establish ownership of previously owned terminals after a
    /// reconnect. Ids that no longer exist are silently skipped.
    Reconnect { known_ids: Vec<Uuid> },

    /// Disconnect the local bridge; the multiplexer session keeps running
    Detach { terminal_id: Uuid },

    /// Destroy a terminal and its multiplexer session. Idempotent.
    Kill { terminal_id: Uuid },

    /// Fetch recent scrollback on demand
    CapturePane { terminal_id: Uuid, lines: u32 },

    /// Ping for keepalive
    Ping,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Connection accepted
    Connected {
        server_version: String,
        protocol_version: u32,
    },

    /// Read-only snapshot of all registered terminals. Receiving this
    /// never implies ownership of anything listed.
    TerminalList { terminals: Vec<TerminalInfo> },

    /// Terminal spawned (response to Spawn)
    TerminalCreated { terminal: TerminalInfo },

    /// The requesting connection now owns this terminal's output stream
    OwnershipGranted { terminal: TerminalInfo },

    /// The requesting connection no longer owns this terminal
    OwnershipReleased { terminal_id: Uuid },

    /// Output bytes; sent only to the terminal's current owners
    Output { terminal_id: Uuid, data: Vec<u8> },

    /// Bridge disconnected; session still running
    TerminalDetached { terminal_id: Uuid },

    /// Terminal destroyed, or its process exited
    TerminalClosed {
        terminal_id: Uuid,
        exit_code: Option<i32>,
    },

    /// Scrollback content (response to CapturePane, and sent once after
    /// an ownership grant so the client can paint history)
    CaptureResult { terminal_id: Uuid, data: Vec<u8> },

    /// Error response
    Error { code: ErrorCode, message: String },

    /// Pong response to ping
    Pong,
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    TerminalNotFound,
    InvalidWorkingDirectory,
    SpawnFailed,
    InvalidOperation,
    ProtocolMismatch,
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_equality() {
        let id = Uuid::new_v4();
        let a = ServerMessage::Output {
            terminal_id: id,
            data: b"hi".to_vec(),
        };
        let b = ServerMessage::Output {
            terminal_id: id,
            data: b"hi".to_vec(),
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_error_code_roundtrip() {
        let msg = ServerMessage::Error {
            code: ErrorCode::TerminalNotFound,
            message: "no such terminal".into(),
        };
        let bytes = bincode::serialize(&msg).unwrap();
        let back: ServerMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(msg, back);
    }
}
