//! Terminal lifecycle handlers
//!
//! Handles: Spawn, Detach, Kill, CapturePane

use tracing::{info, warn};
use uuid::Uuid;

use tether_protocol::{
    BackingMode, ErrorCode, ServerMessage, SpawnOptions, TerminalState,
};
use tether_utils::TetherError;

use crate::backend::{BridgeSpec, OutputSinks};

use super::{HandlerContext, HandlerResult};

impl HandlerContext {
    /// Handle Spawn - register, bind the bridge, grant ownership
    ///
    /// When the multiplexer is unavailable (or the caller asks) the
    /// terminal falls back to a raw bridge with no durability. A failed
    /// spawn leaves no terminal entity behind.
    pub async fn handle_spawn(&self, options: SpawnOptions) -> HandlerResult {
        let backing = if options.raw || !self.backend.mux().available().await {
            BackingMode::Raw
        } else {
            BackingMode::Multiplexed
        };

        let cols = if options.cols == 0 {
            self.config.terminal.default_cols
        } else {
            options.cols
        };
        let rows = if options.rows == 0 {
            self.config.terminal.default_rows
        } else {
            options.rows
        };

        let (terminal_id, spec, activity) = {
            let mut registry = self.registry.write().await;
            let terminal =
                match registry.register(&options, backing, self.backend.mux().prefix()) {
                    Ok(terminal) => terminal,
                    Err(TetherError::Validation(msg)) => {
                        return HandlerContext::error(ErrorCode::InvalidWorkingDirectory, msg)
                    }
                    Err(e) => return HandlerContext::error_from(&e),
                };

            let spec = BridgeSpec {
                terminal_id: terminal.id(),
                mux_session: terminal.mux_session().map(String::from),
                shell: self.config.terminal.shell(),
                command: options.command.clone(),
                cwd: terminal.cwd().clone(),
                cols,
                rows,
            };

            (terminal.id(), spec, terminal.activity_handle())
        };

        let sinks = OutputSinks {
            router: self.router.clone(),
            resize: self.resize.clone(),
            exit_tx: self.exit_tx.clone(),
            activity,
        };

        if let Err(e) = self.backend.spawn(spec, sinks).await {
            // No terminal entity survives a failed spawn
            self.registry.write().await.close(terminal_id);
            warn!("Spawn of {} failed: {}", terminal_id, e);
            return HandlerContext::error(ErrorCode::SpawnFailed, e.to_string());
        }

        self.resize.note_dimensions(terminal_id, cols, rows);

        let terminal = {
            let mut registry = self.registry.write().await;
            let Some(terminal) = registry.get_mut(terminal_id) else {
                return HandlerContext::error(ErrorCode::InternalError, "terminal vanished");
            };
            if let Err(e) = terminal.transition(TerminalState::Attached) {
                warn!("{}", e);
            }
            terminal.to_info()
        };

        if options.take_ownership {
            self.router.grant(self.connection_id, terminal_id);
        }

        info!(
            "Spawned terminal {} ({}, {:?})",
            terminal_id, terminal.name, backing
        );
        HandlerResult::Response(ServerMessage::TerminalCreated { terminal })
    }

    /// Handle Detach - drop the local bridge, keep the session running
    pub async fn handle_detach(&self, terminal_id: Uuid) -> HandlerResult {
        {
            let registry = self.registry.read().await;
            let Some(terminal) = registry.get(terminal_id) else {
                return HandlerContext::error(
                    ErrorCode::TerminalNotFound,
                    format!("no terminal {}", terminal_id),
                );
            };

            if !terminal.is_multiplexed() {
                return HandlerContext::error(
                    ErrorCode::InvalidOperation,
                    "raw terminals have no durable session to detach from",
                );
            }

            if terminal.state() != TerminalState::Attached {
                // Already detached; nothing to tear down
                return HandlerResult::Response(ServerMessage::TerminalDetached { terminal_id });
            }
        }

        // No bridge means nothing to resize; drop pending timers first
        self.resize.cancel(terminal_id);
        self.backend.detach(terminal_id);

        {
            let mut registry = self.registry.write().await;
            if let Some(terminal) = registry.get_mut(terminal_id) {
                let _ = terminal.transition(TerminalState::Detached);
            }
        }

        self.router.notify_owners(
            terminal_id,
            Some(self.connection_id),
            ServerMessage::TerminalDetached { terminal_id },
        );

        info!("Detached terminal {}", terminal_id);
        HandlerResult::Response(ServerMessage::TerminalDetached { terminal_id })
    }

    /// Handle Kill - destroy the terminal and its session. Idempotent:
    /// killing an unknown id succeeds with no side effects.
    pub async fn handle_kill(&self, terminal_id: Uuid) -> HandlerResult {
        let mux_session = {
            let registry = self.registry.read().await;
            match registry.get(terminal_id) {
                Some(terminal) => terminal.mux_session().map(String::from),
                None => {
                    return HandlerResult::Response(ServerMessage::TerminalClosed {
                        terminal_id,
                        exit_code: None,
                    })
                }
            }
        };

        // Cancel timers before teardown so no timer fires against a freed
        // terminal
        self.resize.cancel(terminal_id);

        if let Err(e) = self.backend.kill(terminal_id, mux_session.as_deref()).await {
            warn!("Kill of {} left multiplexer state behind: {}", terminal_id, e);
        }

        {
            let mut registry = self.registry.write().await;
            if let Some(terminal) = registry.get_mut(terminal_id) {
                let _ = terminal.transition(TerminalState::Killed);
            }
            registry.close(terminal_id);
        }

        self.router.notify_owners(
            terminal_id,
            Some(self.connection_id),
            ServerMessage::TerminalClosed {
                terminal_id,
                exit_code: None,
            },
        );
        self.router.remove_terminal(terminal_id);

        info!("Killed terminal {}", terminal_id);
        HandlerResult::Response(ServerMessage::TerminalClosed {
            terminal_id,
            exit_code: None,
        })
    }

    /// Handle CapturePane - recent scrollback on demand
    pub async fn handle_capture(&self, terminal_id: Uuid, lines: u32) -> HandlerResult {
        let mux_session = {
            let registry = self.registry.read().await;
            match registry.get(terminal_id) {
                Some(terminal) => terminal.mux_session().map(String::from),
                None => {
                    return HandlerContext::error(
                        ErrorCode::TerminalNotFound,
                        format!("no terminal {}", terminal_id),
                    )
                }
            }
        };

        let lines = if lines == 0 {
            self.config.terminal.capture_lines
        } else {
            lines
        };

        match self
            .backend
            .capture(terminal_id, mux_session.as_deref(), lines)
            .await
        {
            Ok(data) => HandlerResult::Response(ServerMessage::CaptureResult { terminal_id, data }),
            Err(e) => HandlerContext::error_from(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{create_test_context, create_test_context_with_mux};
    use super::*;
    use crate::backend::MuxClient;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    fn raw_shell_options(command: &str) -> SpawnOptions {
        let mut options = SpawnOptions::shell(80, 24);
        options.cwd = Some("/tmp".into());
        options.command = Some(command.into());
        options
    }

    async fn spawn(rig: &super::super::test_support::TestCtx, command: &str) -> Uuid {
        match rig.ctx.handle_spawn(raw_shell_options(command)).await {
            HandlerResult::Response(ServerMessage::TerminalCreated { terminal }) => terminal.id,
            _ => panic!("Expected TerminalCreated"),
        }
    }

    #[tokio::test]
    async fn test_spawn_grants_ownership_to_spawner() {
        let rig = create_test_context();
        let id = spawn(&rig, "sleep 30").await;

        assert!(rig.ctx.router.owns(rig.ctx.connection_id, id));
        assert_eq!(
            rig.ctx.registry.read().await.get(id).unwrap().state(),
            TerminalState::Attached
        );

        rig.ctx.handle_kill(id).await;
    }

    #[tokio::test]
    async fn test_spawn_falls_back_to_raw_without_mux() {
        let rig = create_test_context();
        let id = spawn(&rig, "sleep 30").await;

        let registry = rig.ctx.registry.read().await;
        let terminal = registry.get(id).unwrap();
        assert_eq!(terminal.backing(), BackingMode::Raw);
        assert!(terminal.mux_session().is_none());
        drop(registry);

        rig.ctx.handle_kill(id).await;
    }

    #[tokio::test]
    async fn test_spawn_bad_cwd_creates_nothing() {
        let rig = create_test_context();
        let mut options = raw_shell_options("true");
        options.cwd = Some("/definitely/not/a/real/path".into());

        let result = rig.ctx.handle_spawn(options).await;
        match result {
            HandlerResult::Response(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::InvalidWorkingDirectory);
            }
            _ => panic!("Expected InvalidWorkingDirectory error"),
        }

        assert_eq!(rig.ctx.registry.read().await.count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_removes_entity() {
        let rig = create_test_context();

        // Force a spawn failure through an unrunnable shell override
        let mut config = (*rig.ctx.config).clone();
        config.terminal.default_shell = Some("/definitely/not/a/shell".into());
        let ctx = HandlerContext {
            config: Arc::new(config),
            registry: rig.ctx.registry.clone(),
            backend: rig.ctx.backend.clone(),
            router: rig.ctx.router.clone(),
            resize: rig.ctx.resize.clone(),
            connection_id: rig.ctx.connection_id,
            exit_tx: rig.ctx.exit_tx.clone(),
        };

        let mut options = raw_shell_options("true");
        options.command = None;

        let result = ctx.handle_spawn(options).await;
        match result {
            HandlerResult::Response(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::SpawnFailed);
            }
            _ => panic!("Expected SpawnFailed error"),
        }

        // No terminal entity survives a failed spawn
        assert_eq!(ctx.registry.read().await.count(), 0);
    }

    #[tokio::test]
    async fn test_pump_reports_self_exit() {
        let mut rig = create_test_context();
        let id = spawn(&rig, "true").await;

        let exit = timeout(Duration::from_secs(5), rig.exit_rx.recv())
            .await
            .expect("no exit notification")
            .unwrap();
        assert_eq!(exit.terminal_id, id);

        rig.ctx.handle_kill(id).await;
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let rig = create_test_context();
        let id = spawn(&rig, "sleep 30").await;

        let first = rig.ctx.handle_kill(id).await;
        assert!(matches!(
            first,
            HandlerResult::Response(ServerMessage::TerminalClosed { .. })
        ));
        assert_eq!(rig.ctx.registry.read().await.count(), 0);
        assert!(!rig.ctx.backend.is_attached(id));

        // Second kill: same success, no duplicate teardown
        let second = rig.ctx.handle_kill(id).await;
        assert!(matches!(
            second,
            HandlerResult::Response(ServerMessage::TerminalClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_kill_unknown_id_succeeds() {
        let rig = create_test_context();
        let result = rig.ctx.handle_kill(Uuid::new_v4()).await;
        assert!(matches!(
            result,
            HandlerResult::Response(ServerMessage::TerminalClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_detach_raw_rejected() {
        let rig = create_test_context();
        let id = spawn(&rig, "sleep 30").await;

        let result = rig.ctx.handle_detach(id).await;
        match result {
            HandlerResult::Response(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::InvalidOperation);
            }
            _ => panic!("Expected InvalidOperation error"),
        }

        rig.ctx.handle_kill(id).await;
    }

    #[tokio::test]
    async fn test_capture_unknown_terminal() {
        let rig = create_test_context();
        let result = rig.ctx.handle_capture(Uuid::new_v4(), 100).await;
        match result {
            HandlerResult::Response(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::TerminalNotFound);
            }
            _ => panic!("Expected TerminalNotFound error"),
        }
    }

    #[tokio::test]
    async fn test_capture_raw_returns_recent_output() {
        let mut rig = create_test_context();
        let id = spawn(&rig, "echo capture-marker; sleep 5").await;

        // Wait for the pump to deliver the output to the owner
        let saw = timeout(Duration::from_secs(5), async {
            loop {
                match rig.rx.recv().await {
                    Some(ServerMessage::Output { data, .. })
                        if String::from_utf8_lossy(&data).contains("capture-marker") =>
                    {
                        break
                    }
                    Some(_) => {}
                    None => panic!("channel closed"),
                }
            }
        })
        .await;
        assert!(saw.is_ok());

        let result = rig.ctx.handle_capture(id, 100).await;
        match result {
            HandlerResult::Response(ServerMessage::CaptureResult { data, .. }) => {
                assert!(String::from_utf8_lossy(&data).contains("capture-marker"));
            }
            _ => panic!("Expected CaptureResult"),
        }

        rig.ctx.handle_kill(id).await;
    }

    /// Full broker round trip against a real multiplexer. Skipped when
    /// tmux is not installed.
    #[tokio::test]
    async fn test_multiplexed_lifecycle_with_real_tmux() {
        let rig = create_test_context_with_mux(MuxClient::new("tmux", "tether-test-"));
        if !rig.ctx.backend.mux().available().await {
            eprintln!("tmux not installed; skipping");
            return;
        }

        let mut rig = rig;
        let mut options = SpawnOptions::shell(80, 24);
        options.name = Some("build".into());
        options.cwd = Some("/tmp".into());

        let id = match rig.ctx.handle_spawn(options).await {
            HandlerResult::Response(ServerMessage::TerminalCreated { terminal }) => {
                assert_eq!(terminal.backing, BackingMode::Multiplexed);
                assert!(terminal
                    .mux_session
                    .as_deref()
                    .unwrap()
                    .starts_with("tether-test-"));
                terminal.id
            }
            _ => panic!("Expected TerminalCreated"),
        };

        // Write a command and watch its output come back through the router
        rig.ctx
            .handle_input(id, b"echo hi-from-tmux\n".to_vec())
            .await;

        let saw = timeout(Duration::from_secs(10), async {
            loop {
                match rig.rx.recv().await {
                    Some(ServerMessage::Output { data, .. })
                        if String::from_utf8_lossy(&data).contains("hi-from-tmux") =>
                    {
                        break
                    }
                    Some(_) => {}
                    None => panic!("channel closed"),
                }
            }
        })
        .await;
        assert!(saw.is_ok(), "never saw shell output via tmux bridge");

        // Detach: bridge gone, session still alive
        rig.ctx.handle_detach(id).await;
        assert!(!rig.ctx.backend.is_attached(id));
        let session = rig
            .ctx
            .registry
            .read()
            .await
            .get(id)
            .unwrap()
            .mux_session()
            .unwrap()
            .to_string();
        assert!(rig.ctx.backend.mux().has_session(&session).await);

        // Reattach through an ownership request and keep working
        match rig.ctx.handle_request_ownership(id).await {
            HandlerResult::ResponseWithFollowUp { response, .. } => match response {
                ServerMessage::OwnershipGranted { terminal } => {
                    assert_eq!(terminal.state, TerminalState::Attached)
                }
                other => panic!("Expected OwnershipGranted, got {:?}", other),
            },
            _ => panic!("Expected ResponseWithFollowUp"),
        }

        // Kill destroys the session for good
        rig.ctx.handle_kill(id).await;
        assert!(!rig.ctx.backend.mux().has_session(&session).await);
    }
}
