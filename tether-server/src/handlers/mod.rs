//! Message handlers for client requests
//!
//! Routes incoming `ClientMessage`s to the broker operations and shapes
//! the `ServerMessage` replies.

mod connection;
mod input;
mod terminal;

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use tether_protocol::{ClientMessage, ErrorCode, ServerMessage};
use tether_utils::TetherError;

use crate::backend::{ProcessBackend, TerminalExitNotification};
use crate::config::AppConfig;
use crate::resize::ResizeCoordinator;
use crate::router::{ConnectionId, OwnershipRouter};
use crate::terminal::TerminalRegistry;

/// Context for message handlers
///
/// Provides access to all broker state needed to handle client requests.
pub struct HandlerContext {
    /// Authoritative terminal directory
    pub registry: Arc<RwLock<TerminalRegistry>>,
    /// Process backend (PTY bridges and multiplexer commands)
    pub backend: Arc<ProcessBackend>,
    /// Connection/ownership router
    pub router: Arc<OwnershipRouter>,
    /// Resize coordinator
    pub resize: Arc<ResizeCoordinator>,
    /// Application configuration
    pub config: Arc<AppConfig>,
    /// The connection making this request
    pub connection_id: ConnectionId,
    /// Exit-notification channel handed to spawned pumps
    pub exit_tx: mpsc::Sender<TerminalExitNotification>,
}

/// Result of handling a message
pub enum HandlerResult {
    /// Single response to send back to the client
    Response(ServerMessage),
    /// Response followed by additional messages to the same client
    /// (e.g. an ownership grant followed by initial scrollback)
    ResponseWithFollowUp {
        response: ServerMessage,
        follow_up: Vec<ServerMessage>,
    },
    /// No response needed (fire-and-forget messages like Input)
    NoResponse,
}

impl HandlerContext {
    /// Route a client message to the appropriate handler
    pub async fn route_message(&self, msg: ClientMessage) -> HandlerResult {
        match msg {
            // Connection handlers
            ClientMessage::Connect {
                client_id,
                protocol_version,
            } => self.handle_connect(client_id, protocol_version),

            ClientMessage::Ping => self.handle_ping(),

            ClientMessage::ListTerminals => self.handle_list_terminals().await,

            ClientMessage::RequestOwnership { terminal_id } => {
                self.handle_request_ownership(terminal_id).await
            }

            ClientMessage::ReleaseOwnership { terminal_id } => {
                self.handle_release_ownership(terminal_id)
            }

            ClientMessage::Reconnect { known_ids } => self.handle_reconnect(known_ids).await,

            // Terminal lifecycle handlers
            ClientMessage::Spawn { options } => self.handle_spawn(options).await,

            ClientMessage::Detach { terminal_id } => self.handle_detach(terminal_id).await,

            ClientMessage::Kill { terminal_id } => self.handle_kill(terminal_id).await,

            ClientMessage::CapturePane { terminal_id, lines } => {
                self.handle_capture(terminal_id, lines).await
            }

            // Input handlers
            ClientMessage::Input { terminal_id, data } => {
                self.handle_input(terminal_id, data).await
            }

            ClientMessage::RequestResize {
                terminal_id,
                cols,
                rows,
                source,
            } => self.handle_request_resize(terminal_id, cols, rows, source).await,
        }
    }

    /// Create an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> HandlerResult {
        HandlerResult::Response(ServerMessage::Error {
            code,
            message: message.into(),
        })
    }

    /// Map a broker error onto a wire error
    pub fn error_from(err: &TetherError) -> HandlerResult {
        let code = match err {
            TetherError::TerminalNotFound(_) => ErrorCode::TerminalNotFound,
            TetherError::Validation(_) => ErrorCode::InvalidOperation,
            TetherError::ProcessSpawn(_) => ErrorCode::SpawnFailed,
            _ => ErrorCode::InternalError,
        };
        Self::error(code, err.to_string())
    }
}
