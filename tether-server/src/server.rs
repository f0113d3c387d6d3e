//! Unix-socket server
//!
//! Owns the accept loop, the per-connection framed IO tasks, and the
//! exit-supervision loop that reacts to bridge processes dying on their
//! own.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Duration;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use tether_protocol::{ServerCodec, ServerMessage};
use tether_utils::Result;

use crate::backend::{MuxClient, ProcessBackend, TerminalExitNotification};
use crate::config::AppConfig;
use crate::handlers::{HandlerContext, HandlerResult};
use crate::recovery::{self, RecoveryReport};
use crate::resize::{ResizeBackend, ResizeCoordinator, ResizeTuning};
use crate::router::OwnershipRouter;
use crate::terminal::TerminalRegistry;

/// Per-connection outbound queue depth
const CONNECTION_QUEUE: usize = 256;

/// Broker state container
pub struct TetherServer {
    registry: Arc<RwLock<TerminalRegistry>>,
    backend: Arc<ProcessBackend>,
    router: Arc<OwnershipRouter>,
    resize: Arc<ResizeCoordinator>,
    config: Arc<AppConfig>,
    exit_tx: mpsc::Sender<TerminalExitNotification>,
}

impl TetherServer {
    /// Build the broker from configuration. The returned receiver feeds
    /// `start_exit_loop`.
    pub fn new(config: AppConfig) -> (Arc<Self>, mpsc::Receiver<TerminalExitNotification>) {
        let config = Arc::new(config);
        let mux = MuxClient::new(&config.mux.bin, &config.mux.session_prefix);
        let backend = Arc::new(ProcessBackend::new(
            mux,
            config.terminal.raw_scrollback_bytes,
        ));
        let resize = Arc::new(ResizeCoordinator::new(
            Arc::clone(&backend) as Arc<dyn ResizeBackend>,
            ResizeTuning::from_config(&config.resize),
        ));
        let (exit_tx, exit_rx) = mpsc::channel(64);

        let server = Arc::new(Self {
            registry: Arc::new(RwLock::new(TerminalRegistry::new())),
            backend,
            router: Arc::new(OwnershipRouter::new()),
            resize,
            config,
            exit_tx,
        });

        (server, exit_rx)
    }

    /// Rebuild the registry from multiplexer inventory. Must complete (or
    /// time out) before the socket is bound, so clients never observe a
    /// partial terminal list.
    pub async fn reconcile(&self) -> RecoveryReport {
        recovery::reconcile(
            self.backend.mux(),
            &self.registry,
            Duration::from_millis(self.config.mux.recovery_timeout_ms),
        )
        .await
    }

    /// Spawn the exit-supervision loop
    pub fn start_exit_loop(self: Arc<Self>, mut exit_rx: mpsc::Receiver<TerminalExitNotification>) {
        tokio::spawn(async move {
            while let Some(exit) = exit_rx.recv().await {
                self.handle_terminal_exit(exit).await;
            }
        });
    }

    /// Accept connections forever
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream).await;
                    });
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                }
            }
        }
    }

    /// Tear down every bridge but leave multiplexer sessions running;
    /// they are what the next broker instance recovers from.
    pub fn shutdown(&self) {
        self.resize.shutdown();
        self.backend.shutdown();
        info!("Bridges detached; multiplexer sessions left running");
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let framed = Framed::new(stream, ServerCodec::new());
        let (mut sink, mut stream) = framed.split();

        let (tx, mut rx) = mpsc::channel(CONNECTION_QUEUE);
        let connection_id = self.router.register_connection(tx);
        info!("{} connected", connection_id);

        // On-open snapshot: read-only, confers no ownership of anything
        let snapshot = ServerMessage::TerminalList {
            terminals: self.registry.read().await.list(),
        };
        self.router.try_send(connection_id, snapshot);

        // Writer task drains the connection's queue into the socket
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let ctx = HandlerContext {
            registry: Arc::clone(&self.registry),
            backend: Arc::clone(&self.backend),
            router: Arc::clone(&self.router),
            resize: Arc::clone(&self.resize),
            config: Arc::clone(&self.config),
            connection_id,
            exit_tx: self.exit_tx.clone(),
        };

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(msg) => match ctx.route_message(msg).await {
                    HandlerResult::Response(response) => {
                        self.router.send(connection_id, response).await;
                    }
                    HandlerResult::ResponseWithFollowUp {
                        response,
                        follow_up,
                    } => {
                        self.router.send(connection_id, response).await;
                        for msg in follow_up {
                            self.router.send(connection_id, msg).await;
                        }
                    }
                    HandlerResult::NoResponse => {}
                },
                Err(e) => {
                    warn!("Decode error from {}: {}", connection_id, e);
                    break;
                }
            }
        }

        self.router.unregister_connection(connection_id);
        writer.abort();
        debug!("{} disconnected", connection_id);
    }

    /// React to a bridge that exited on its own (not via detach/kill).
    ///
    /// For a multiplexed terminal a dead bridge is ambiguous: the session
    /// may still be alive (client ended externally) or the shell inside it
    /// may have exited. The multiplexer disambiguates.
    async fn handle_terminal_exit(&self, exit: TerminalExitNotification) {
        let terminal_id = exit.terminal_id;
        self.backend.cleanup(terminal_id);

        let mux_session = {
            let registry = self.registry.read().await;
            match registry.get(terminal_id) {
                Some(terminal) => terminal.mux_session().map(String::from),
                // Already closed through the kill path
                None => return,
            }
        };

        let session_alive = match &mux_session {
            Some(session) => self.backend.mux().has_session(session).await,
            None => false,
        };

        if session_alive {
            {
                let mut registry = self.registry.write().await;
                if let Some(terminal) = registry.get_mut(terminal_id) {
                    let _ = terminal.transition(tether_protocol::TerminalState::Detached);
                }
            }
            self.router.notify_owners(
                terminal_id,
                None,
                ServerMessage::TerminalDetached { terminal_id },
            );
            info!("Bridge for {} ended; session still running", terminal_id);
        } else {
            self.resize.cancel(terminal_id);
            {
                let mut registry = self.registry.write().await;
                if let Some(terminal) = registry.get_mut(terminal_id) {
                    let _ = terminal.transition(tether_protocol::TerminalState::Killed);
                }
                registry.close(terminal_id);
            }
            self.router.notify_owners(
                terminal_id,
                None,
                ServerMessage::TerminalClosed {
                    terminal_id,
                    exit_code: exit.exit_code,
                },
            );
            self.router.remove_terminal(terminal_id);
            info!(
                "Terminal {} closed (exit code {:?})",
                terminal_id, exit.exit_code
            );
        }
    }
}
