//! Process backend
//!
//! Binds each terminal to a real process. Multiplexed terminals get a
//! bridge PTY running `tmux new-session -A` against the session named
//! after the terminal id. `-A` attaches when the session already exists,
//! which is the resume-after-restart path. Raw terminals run the shell
//! directly on the PTY and die with the broker.
//!
//! Each spawned bridge gets one output pump task: the per-terminal reader
//! that feeds the ownership router, the resize coordinator's quiet-period
//! tracking, and the exit-notification channel.

mod mux;
mod pty;
mod scrollback;

pub use mux::MuxClient;
pub use pty::PtyHandle;
pub use scrollback::ScrollbackRing;

use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use portable_pty::CommandBuilder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use tether_utils::{unix_timestamp, Result, TetherError};

use crate::resize::{ResizeBackend, ResizeCoordinator};
use crate::router::OwnershipRouter;

/// Read buffer size for PTY reads
const READ_BUFFER_SIZE: usize = 4096;

/// What to run and where, for one terminal's bridge
#[derive(Debug, Clone)]
pub struct BridgeSpec {
    pub terminal_id: Uuid,
    /// Multiplexer session to attach-or-create; `None` means a raw bridge
    pub mux_session: Option<String>,
    /// Shell for raw bridges and `-c` command wrapping
    pub shell: String,
    /// Command to run instead of an interactive shell
    pub command: Option<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Sent when a bridge process exits on its own (not through detach/kill)
#[derive(Debug, Clone)]
pub struct TerminalExitNotification {
    pub terminal_id: Uuid,
    pub exit_code: Option<i32>,
}

/// Destinations the output pump feeds
pub struct OutputSinks {
    pub router: Arc<OwnershipRouter>,
    pub resize: Arc<ResizeCoordinator>,
    pub exit_tx: mpsc::Sender<TerminalExitNotification>,
    /// Registry's last-activity slot for this terminal
    pub activity: Arc<AtomicU64>,
}

/// Handle for a running output pump
struct PumpHandle {
    cancel: CancellationToken,
    #[allow(dead_code)]
    join: JoinHandle<()>,
}

/// Spawns and supervises terminal bridges
pub struct ProcessBackend {
    mux: MuxClient,
    ptys: DashMap<Uuid, PtyHandle>,
    pumps: DashMap<Uuid, PumpHandle>,
    /// In-memory scrollback, raw terminals only
    rings: DashMap<Uuid, Arc<Mutex<ScrollbackRing>>>,
    raw_scrollback_cap: usize,
}

impl ProcessBackend {
    pub fn new(mux: MuxClient, raw_scrollback_cap: usize) -> Self {
        Self {
            mux,
            ptys: DashMap::new(),
            pumps: DashMap::new(),
            rings: DashMap::new(),
            raw_scrollback_cap,
        }
    }

    pub fn mux(&self) -> &MuxClient {
        &self.mux
    }

    /// Whether a local bridge is currently connected for this terminal
    pub fn is_attached(&self, terminal_id: Uuid) -> bool {
        self.ptys.contains_key(&terminal_id)
    }

    /// Bind a bridge PTY for the terminal and start its output pump.
    /// Idempotent: an already-attached terminal is left alone.
    ///
    /// The PTY open and process fork run on the blocking pool so a slow
    /// spawn cannot stall unrelated terminals.
    pub async fn spawn(&self, spec: BridgeSpec, sinks: OutputSinks) -> Result<()> {
        let terminal_id = spec.terminal_id;
        if self.ptys.contains_key(&terminal_id) {
            return Ok(());
        }

        let cmd = self.build_command(&spec);
        let (cols, rows) = (spec.cols, spec.rows);

        let handle = tokio::task::spawn_blocking(move || PtyHandle::spawn(cmd, cols, rows))
            .await
            .map_err(|e| TetherError::internal(format!("spawn task failed: {}", e)))??;

        self.ptys.insert(terminal_id, handle.clone());

        let ring = if spec.mux_session.is_none() {
            let ring = Arc::new(Mutex::new(ScrollbackRing::new(self.raw_scrollback_cap)));
            self.rings.insert(terminal_id, Arc::clone(&ring));
            Some(ring)
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let join = spawn_pump(terminal_id, handle, ring, sinks, cancel.clone());
        self.pumps.insert(terminal_id, PumpHandle { cancel, join });

        debug!(
            "Spawned bridge for {} ({})",
            terminal_id,
            spec.mux_session.as_deref().unwrap_or("raw")
        );
        Ok(())
    }

    /// Forward input bytes to the terminal's PTY
    pub fn write(&self, terminal_id: Uuid, data: &[u8]) -> Result<()> {
        match self.ptys.get(&terminal_id) {
            Some(handle) => handle.write_all(data),
            None => Err(TetherError::validation(format!(
                "terminal {} has no attached bridge",
                terminal_id
            ))),
        }
    }

    /// Change PTY dimensions. Necessary but not sufficient for a fully
    /// consistent repaint; see the resize coordinator.
    pub fn resize(&self, terminal_id: Uuid, cols: u16, rows: u16) -> Result<()> {
        match self.ptys.get(&terminal_id) {
            Some(handle) => handle.resize(cols, rows),
            None => Err(TetherError::validation(format!(
                "terminal {} has no attached bridge",
                terminal_id
            ))),
        }
    }

    /// Disconnect the local bridge. For multiplexed terminals the session
    /// (and the shell inside it) keeps running. Returns whether a bridge
    /// existed.
    pub fn detach(&self, terminal_id: Uuid) -> bool {
        // Cancel the pump first so the read loop ends without emitting an
        // exit notification for an intentional teardown.
        if let Some((_, pump)) = self.pumps.remove(&terminal_id) {
            pump.cancel.cancel();
        }

        match self.ptys.remove(&terminal_id) {
            Some((_, handle)) => {
                if let Err(e) = handle.kill() {
                    debug!("Bridge for {} already gone: {}", terminal_id, e);
                }
                true
            }
            None => false,
        }
    }

    /// Detach, then destroy the multiplexer session permanently.
    /// Idempotent: killing an unknown or already-killed terminal succeeds.
    pub async fn kill(&self, terminal_id: Uuid, mux_session: Option<&str>) -> Result<()> {
        self.detach(terminal_id);
        self.rings.remove(&terminal_id);

        if let Some(session) = mux_session {
            self.mux.kill_session(session).await?;
        }
        Ok(())
    }

    /// Fetch recent scrollback: from the multiplexer for multiplexed
    /// terminals, from the in-memory ring for raw ones
    pub async fn capture(
        &self,
        terminal_id: Uuid,
        mux_session: Option<&str>,
        lines: u32,
    ) -> Result<Vec<u8>> {
        match mux_session {
            Some(session) => self.mux.capture_pane(session, lines).await,
            None => match self.rings.get(&terminal_id) {
                Some(ring) => Ok(ring.lock().contents()),
                None => Err(TetherError::validation(format!(
                    "no scrollback available for terminal {}",
                    terminal_id
                ))),
            },
        }
    }

    /// Drop bookkeeping for a terminal whose bridge already exited
    pub fn cleanup(&self, terminal_id: Uuid) {
        if let Some((_, pump)) = self.pumps.remove(&terminal_id) {
            pump.cancel.cancel();
        }
        self.ptys.remove(&terminal_id);
        self.rings.remove(&terminal_id);
    }

    /// Tear down every bridge. Multiplexer sessions are left running;
    /// they are the durability substrate a restarted broker recovers from.
    pub fn shutdown(&self) {
        let ids: Vec<Uuid> = self.ptys.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.detach(id);
        }
        self.rings.clear();
    }

    fn build_command(&self, spec: &BridgeSpec) -> CommandBuilder {
        let mut cmd = match &spec.mux_session {
            Some(session) => {
                let mut cmd = CommandBuilder::new(self.mux.bin());
                cmd.args(["new-session", "-A", "-s", session.as_str()]);
                cmd.arg("-x");
                cmd.arg(spec.cols.to_string());
                cmd.arg("-y");
                cmd.arg(spec.rows.to_string());
                cmd.arg("-c");
                cmd.arg(&spec.cwd);
                if let Some(command) = &spec.command {
                    cmd.arg(command);
                }
                cmd
            }
            None => match &spec.command {
                Some(command) => {
                    let mut cmd = CommandBuilder::new(&spec.shell);
                    cmd.args(["-c", command.as_str()]);
                    cmd
                }
                None => CommandBuilder::new(&spec.shell),
            },
        };

        cmd.cwd(&spec.cwd);
        cmd.env("TERM", "xterm-256color");
        cmd
    }
}

impl ResizeBackend for ProcessBackend {
    fn apply_resize(&self, terminal_id: Uuid, cols: u16, rows: u16) -> Result<()> {
        self.resize(terminal_id, cols, rows)
    }
}

impl std::fmt::Debug for ProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBackend")
            .field("attached", &self.ptys.len())
            .finish()
    }
}

/// One reader task per terminal. Reads happen on the blocking pool; the
/// chunk path is non-blocking so a slow client can never back-pressure
/// the PTY.
fn spawn_pump(
    terminal_id: Uuid,
    handle: PtyHandle,
    ring: Option<Arc<Mutex<ScrollbackRing>>>,
    sinks: OutputSinks,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reader = handle.clone_reader();

        loop {
            let rd = Arc::clone(&reader);
            let read = tokio::task::spawn_blocking(move || {
                let mut buf = [0u8; READ_BUFFER_SIZE];
                let n = rd.lock().read(&mut buf)?;
                std::io::Result::Ok(buf[..n].to_vec())
            });

            let chunk = match read.await {
                Ok(Ok(chunk)) => chunk,
                // Read errors at teardown are expected; either way the
                // bridge is done.
                Ok(Err(e)) => {
                    if !cancel.is_cancelled() {
                        debug!("Read from {} ended: {}", terminal_id, e);
                    }
                    Vec::new()
                }
                Err(e) => {
                    warn!("Reader task for {} panicked: {}", terminal_id, e);
                    Vec::new()
                }
            };

            if cancel.is_cancelled() {
                // Intentional detach/kill: the server already knows
                return;
            }

            if chunk.is_empty() {
                break; // EOF: bridge process exited
            }

            if sinks.resize.on_output(terminal_id) {
                // Inside a perturbation window: guaranteed-redundant
                // repaint bytes, dropped outright
                continue;
            }

            sinks.activity.store(unix_timestamp(), Ordering::Relaxed);
            if let Some(ring) = &ring {
                ring.lock().push(&chunk);
            }
            sinks.router.route_output(terminal_id, chunk);
        }

        // Give the child a moment to become reapable before reporting
        let mut exit_code = None;
        for _ in 0..10 {
            match handle.try_wait() {
                Ok(Some(code)) => {
                    exit_code = Some(code);
                    break;
                }
                Ok(None) => sleep(Duration::from_millis(20)).await,
                Err(_) => break,
            }
        }

        let _ = sinks
            .exit_tx
            .send(TerminalExitNotification {
                terminal_id,
                exit_code,
            })
            .await;
    })
}
