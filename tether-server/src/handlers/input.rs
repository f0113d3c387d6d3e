//! Input and resize handlers
//!
//! Handles: Input, RequestResize

use tracing::debug;
use uuid::Uuid;

use tether_protocol::{ErrorCode, ResizeSource};

use super::{HandlerContext, HandlerResult};

impl HandlerContext {
    /// Handle Input - forward bytes to the terminal's PTY
    ///
    /// Input is never gated by the resize coordinator; keystrokes flow
    /// even while a redraw perturbation is in progress.
    pub async fn handle_input(&self, terminal_id: Uuid, data: Vec<u8>) -> HandlerResult {
        {
            let registry = self.registry.read().await;
            match registry.get(terminal_id) {
                Some(terminal) => terminal.touch(),
                None => {
                    return HandlerContext::error(
                        ErrorCode::TerminalNotFound,
                        format!("no terminal {}", terminal_id),
                    )
                }
            }
        }

        match self.backend.write(terminal_id, &data) {
            Ok(()) => HandlerResult::NoResponse,
            Err(e) => {
                debug!("Input to {} rejected: {}", terminal_id, e);
                HandlerContext::error_from(&e)
            }
        }
    }

    /// Handle RequestResize - hand the geometry to the coordinator.
    ///
    /// Fire-and-forget: the request is debounced and applied later;
    /// failures past this point are display-quality concerns, logged by
    /// the coordinator rather than surfaced.
    pub async fn handle_request_resize(
        &self,
        terminal_id: Uuid,
        cols: u16,
        rows: u16,
        source: ResizeSource,
    ) -> HandlerResult {
        if cols == 0 || rows == 0 {
            return HandlerContext::error(
                ErrorCode::InvalidOperation,
                "terminal geometry must be non-zero",
            );
        }

        if self.registry.read().await.get(terminal_id).is_none() {
            return HandlerContext::error(
                ErrorCode::TerminalNotFound,
                format!("no terminal {}", terminal_id),
            );
        }

        self.resize.request_resize(terminal_id, cols, rows, source);
        HandlerResult::NoResponse
    }
}
