//! Connection-related message handlers
//!
//! Handles: Connect, Ping, ListTerminals, RequestOwnership,
//! ReleaseOwnership, Reconnect

use tracing::{debug, info};
use uuid::Uuid;

use tether_protocol::{ErrorCode, ServerMessage, TerminalState, PROTOCOL_VERSION};

use crate::backend::{BridgeSpec, OutputSinks};

use super::{HandlerContext, HandlerResult};

impl HandlerContext {
    /// Handle Connect message - validate protocol version
    pub fn handle_connect(&self, client_uuid: Uuid, protocol_version: u32) -> HandlerResult {
        info!(
            "Client {} (UUID: {}) connecting with protocol version {}",
            self.connection_id, client_uuid, protocol_version
        );

        if protocol_version != PROTOCOL_VERSION {
            return HandlerContext::error(
                ErrorCode::ProtocolMismatch,
                format!(
                    "Protocol version mismatch: client={}, server={}",
                    protocol_version, PROTOCOL_VERSION
                ),
            );
        }

        HandlerResult::Response(ServerMessage::Connected {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
        })
    }

    /// Handle Ping message - simple heartbeat response
    pub fn handle_ping(&self) -> HandlerResult {
        debug!("Received Ping from {}, sending Pong", self.connection_id);
        HandlerResult::Response(ServerMessage::Pong)
    }

    /// Handle ListTerminals - read-only snapshot, no subscription implied
    pub async fn handle_list_terminals(&self) -> HandlerResult {
        let terminals = self.registry.read().await.list();
        HandlerResult::Response(ServerMessage::TerminalList { terminals })
    }

    /// Handle RequestOwnership - the only path by which this connection
    /// starts receiving the terminal's output
    ///
    /// A detached multiplexed terminal gets its bridge re-bound first, so
    /// a recovered terminal resumes streaming through the same grant.
    pub async fn handle_request_ownership(&self, terminal_id: Uuid) -> HandlerResult {
        let reattach = {
            let registry = self.registry.read().await;
            let Some(terminal) = registry.get(terminal_id) else {
                return HandlerContext::error(
                    ErrorCode::TerminalNotFound,
                    format!("no terminal {}", terminal_id),
                );
            };

            if terminal.state() == TerminalState::Killed {
                return HandlerContext::error(
                    ErrorCode::InvalidOperation,
                    format!("terminal {} is killed", terminal_id),
                );
            }

            let needs_bridge = terminal.is_multiplexed()
                && terminal.state() == TerminalState::Detached
                && !self.backend.is_attached(terminal_id);

            needs_bridge.then(|| {
                (
                    BridgeSpec {
                        terminal_id,
                        mux_session: terminal.mux_session().map(String::from),
                        shell: self.config.terminal.shell(),
                        command: None,
                        cwd: terminal.cwd().clone(),
                        cols: self.config.terminal.default_cols,
                        rows: self.config.terminal.default_rows,
                    },
                    terminal.activity_handle(),
                )
            })
        };

        if let Some((spec, activity)) = reattach {
            let (cols, rows) = (spec.cols, spec.rows);
            let sinks = OutputSinks {
                router: self.router.clone(),
                resize: self.resize.clone(),
                exit_tx: self.exit_tx.clone(),
                activity,
            };

            if let Err(e) = self.backend.spawn(spec, sinks).await {
                return HandlerContext::error(
                    ErrorCode::SpawnFailed,
                    format!("reattach failed: {}", e),
                );
            }

            self.resize.note_dimensions(terminal_id, cols, rows);

            let mut registry = self.registry.write().await;
            if let Some(terminal) = registry.get_mut(terminal_id) {
                let _ = terminal.transition(TerminalState::Attached);
            }

            info!("Reattached detached terminal {}", terminal_id);
        }

        if !self.router.grant(self.connection_id, terminal_id) {
            return HandlerContext::error(ErrorCode::InternalError, "connection gone");
        }

        let Some(terminal) = self
            .registry
            .read()
            .await
            .get(terminal_id)
            .map(|t| t.to_info())
        else {
            return HandlerContext::error(
                ErrorCode::TerminalNotFound,
                format!("terminal {} vanished", terminal_id),
            );
        };

        // Initial scrollback so the panel can paint history before live
        // output resumes. Best effort; a fresh terminal has none.
        let mut follow_up = Vec::new();
        match self
            .backend
            .capture(
                terminal_id,
                terminal.mux_session.as_deref(),
                self.config.terminal.capture_lines,
            )
            .await
        {
            Ok(data) if !data.is_empty() => {
                follow_up.push(ServerMessage::CaptureResult { terminal_id, data })
            }
            Ok(_) => {}
            Err(e) => debug!("Initial capture for {} unavailable: {}", terminal_id, e),
        }

        HandlerResult::ResponseWithFollowUp {
            response: ServerMessage::OwnershipGranted { terminal },
            follow_up,
        }
    }

    /// Handle ReleaseOwnership
    pub fn handle_release_ownership(&self, terminal_id: Uuid) -> HandlerResult {
        self.router.release(self.connection_id, terminal_id);
        HandlerResult::Response(ServerMessage::OwnershipReleased { terminal_id })
    }

    /// Handle Reconnect - re-grant each id the client previously owned.
    ///
    /// The backend never re-grants on its own; the client names the
    /// terminals it is actually rendering, ids that no longer exist are
    /// skipped, and the surviving terminals get a staggered group redraw
    /// so their screens repaint consistently.
    pub async fn handle_reconnect(&self, known_ids: Vec<Uuid>) -> HandlerResult {
        let mut follow_up = Vec::new();
        let mut granted = Vec::new();

        for terminal_id in known_ids {
            match self.handle_request_ownership(terminal_id).await {
                HandlerResult::Response(msg @ ServerMessage::OwnershipGranted { .. }) => {
                    granted.push(terminal_id);
                    follow_up.push(msg);
                }
                HandlerResult::ResponseWithFollowUp {
                    response,
                    follow_up: mut extra,
                } => {
                    if matches!(response, ServerMessage::OwnershipGranted { .. }) {
                        granted.push(terminal_id);
                        follow_up.push(response);
                        follow_up.append(&mut extra);
                    }
                }
                // Unknown or killed ids are dropped without failing the
                // whole reconnect
                _ => debug!("Reconnect skipped terminal {}", terminal_id),
            }
        }

        if !granted.is_empty() {
            self.resize.redraw_group(granted);
        }

        let terminals = self.registry.read().await.list();
        HandlerResult::ResponseWithFollowUp {
            response: ServerMessage::TerminalList { terminals },
            follow_up,
        }
    }
}
