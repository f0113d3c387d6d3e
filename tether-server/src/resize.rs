//! Resize coordination
//!
//! Debounces resize requests per terminal (latest wins) and coordinates
//! forced full-screen repaints. A bare dimension change does not reliably
//! re-wrap content already rendered by the multiplexer, so a repaint is
//! forced by a two-step perturbation: shrink the PTY by one column, then
//! restore it.
//!
//! The perturbation is dangerous around live output, so it is guarded:
//! rate-limited per terminal, deferred while the terminal is actively
//! producing output, abandoned outright after a bounded number of
//! deferrals, and any output produced during the perturbation window is
//! discarded rather than buffered; it is redundant repaint data, and
//! replaying it duplicates lines on screen. Input is never gated here;
//! keystrokes flow to the PTY even mid-perturbation.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_protocol::ResizeSource;
use tether_utils::Result;

use crate::config::ResizeConfig;

/// Delay between the shrink and restore steps of a perturbation
const PERTURB_SETTLE: Duration = Duration::from_millis(60);

/// Discard window kept open after the restore step, for repaint bytes
/// still in flight
const DISCARD_TAIL: Duration = Duration::from_millis(120);

/// The seam the coordinator applies dimension changes through.
/// The process backend implements this; tests substitute a recorder.
pub trait ResizeBackend: Send + Sync {
    fn apply_resize(&self, terminal_id: Uuid, cols: u16, rows: u16) -> Result<()>;
}

/// Timing parameters, decoupled from the config schema for tests
#[derive(Debug, Clone)]
pub struct ResizeTuning {
    pub debounce: Duration,
    pub redraw_min_interval: Duration,
    pub quiet_period: Duration,
    pub max_defer_attempts: u32,
    pub stagger_max: Duration,
}

impl ResizeTuning {
    pub fn from_config(config: &ResizeConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.debounce_ms),
            redraw_min_interval: Duration::from_millis(config.redraw_min_interval_ms),
            quiet_period: Duration::from_millis(config.quiet_period_ms),
            max_defer_attempts: config.max_defer_attempts,
            stagger_max: Duration::from_millis(config.stagger_max_ms),
        }
    }
}

impl Default for ResizeTuning {
    fn default() -> Self {
        Self::from_config(&ResizeConfig::default())
    }
}

/// Where a terminal sits in the resize lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizePhase {
    /// Nothing scheduled
    Idle,
    /// A debounce timer or deferred redraw is outstanding
    Pending,
    /// Inside the post-perturbation rate-limit window
    Cooling,
}

/// Per-terminal coordination state. One instance per id; every field is
/// mutated under the per-id mutex, which is the serialization unit.
#[derive(Debug, Default)]
struct TermState {
    pending: Option<(u16, u16)>,
    applied: Option<(u16, u16)>,
    debounce_timer: Option<CancellationToken>,
    redraw_task: Option<CancellationToken>,
    last_output: Option<Instant>,
    last_redraw: Option<Instant>,
    discard_until: Option<Instant>,
}

impl TermState {
    fn phase(&self, min_interval: Duration) -> ResizePhase {
        if self.debounce_timer.is_some() || self.redraw_task.is_some() {
            return ResizePhase::Pending;
        }
        match self.last_redraw {
            Some(t) if t.elapsed() < min_interval => ResizePhase::Cooling,
            _ => ResizePhase::Idle,
        }
    }
}

/// Debounces resizes and schedules guarded repaints
///
/// Thin handle over shared inner state so timer tasks can outlive the
/// caller's borrow.
pub struct ResizeCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn ResizeBackend>,
    tuning: ResizeTuning,
    states: DashMap<Uuid, Arc<Mutex<TermState>>>,
}

impl ResizeCoordinator {
    pub fn new(backend: Arc<dyn ResizeBackend>, tuning: ResizeTuning) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                tuning,
                states: DashMap::new(),
            }),
        }
    }

    /// Record the dimensions a terminal was spawned (or resized) at.
    /// A redraw needs a known geometry to perturb around.
    pub fn note_dimensions(&self, terminal_id: Uuid, cols: u16, rows: u16) {
        self.inner.state(terminal_id).lock().applied = Some((cols, rows));
    }

    /// Current phase, for observability and tests
    pub fn phase(&self, terminal_id: Uuid) -> ResizePhase {
        match self.inner.states.get(&terminal_id) {
            Some(state) => state.lock().phase(self.inner.tuning.redraw_min_interval),
            None => ResizePhase::Idle,
        }
    }

    /// Request a dimension change. Requests inside the debounce window
    /// collapse; the latest geometry wins and is applied exactly once.
    pub fn request_resize(&self, terminal_id: Uuid, cols: u16, rows: u16, source: ResizeSource) {
        let state = self.inner.state(terminal_id);
        let token = {
            let mut st = state.lock();
            st.pending = Some((cols, rows));

            if st.debounce_timer.is_some() {
                // Timer already armed; it will pick up the new geometry
                debug!(
                    "Resize {}x{} for {} folded into pending request ({:?})",
                    cols, rows, terminal_id, source
                );
                return;
            }

            let token = CancellationToken::new();
            st.debounce_timer = Some(token.clone());
            token
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(inner.tuning.debounce) => {
                    inner.apply_pending(terminal_id);
                }
            }
        });
    }

    /// Force a full repaint via the two-step perturbation, subject to the
    /// safety rules. Failures and abandonments are logged, never surfaced.
    pub fn force_redraw(&self, terminal_id: Uuid) {
        Inner::schedule_redraw(&self.inner, terminal_id);
    }

    /// Redraw several terminals (e.g. after a reconnect), staggered with a
    /// small random delay each so the perturbations never fire as one storm.
    pub fn redraw_group(&self, terminal_ids: Vec<Uuid>) {
        let max = self.inner.tuning.stagger_max.as_millis() as u64;
        for terminal_id in terminal_ids {
            let delay = Duration::from_millis(fastrand::u64(0..=max));
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                sleep(delay).await;
                Inner::schedule_redraw(&inner, terminal_id);
            });
        }
    }

    /// Gate for the output pump. Returns true when the chunk falls inside
    /// a perturbation window and must be discarded; otherwise records the
    /// output instant for quiet-period tracking.
    pub fn on_output(&self, terminal_id: Uuid) -> bool {
        let state = self.inner.state(terminal_id);
        let mut st = state.lock();

        if let Some(until) = st.discard_until {
            if Instant::now() < until {
                return true;
            }
            st.discard_until = None;
        }

        st.last_output = Some(Instant::now());
        false
    }

    /// Cancel all timers for a terminal and drop its state. Must run
    /// before backend teardown so no timer fires against a freed terminal.
    pub fn cancel(&self, terminal_id: Uuid) {
        if let Some((_, state)) = self.inner.states.remove(&terminal_id) {
            let st = state.lock();
            if let Some(token) = &st.debounce_timer {
                token.cancel();
            }
            if let Some(token) = &st.redraw_task {
                token.cancel();
            }
        }
    }

    /// Cancel everything (daemon shutdown)
    pub fn shutdown(&self) {
        let ids: Vec<Uuid> = self.inner.states.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.cancel(id);
        }
    }
}

impl Inner {
    fn state(&self, terminal_id: Uuid) -> Arc<Mutex<TermState>> {
        Arc::clone(
            &self
                .states
                .entry(terminal_id)
                .or_insert_with(|| Arc::new(Mutex::new(TermState::default()))),
        )
    }

    fn apply_pending(&self, terminal_id: Uuid) {
        let state = match self.states.get(&terminal_id) {
            Some(state) => Arc::clone(&state),
            None => return, // cancelled during teardown
        };

        let dims = {
            let mut st = state.lock();
            st.debounce_timer = None;
            st.pending.take()
        };

        let Some((cols, rows)) = dims else { return };

        match self.backend.apply_resize(terminal_id, cols, rows) {
            Ok(()) => {
                state.lock().applied = Some((cols, rows));
                debug!("Applied resize {}x{} to {}", cols, rows, terminal_id);
            }
            Err(e) => {
                // Display-quality concern; never escalated to the caller
                warn!("Resize of {} failed, abandoned: {}", terminal_id, e);
            }
        }
    }

    /// Apply the redraw safety checks and, when they pass, spawn the
    /// guarded perturbation task
    fn schedule_redraw(inner: &Arc<Inner>, terminal_id: Uuid) {
        // A terminal closed before its (possibly staggered) trigger fires
        // must not be resurrected.
        let Some(state) = inner.states.get(&terminal_id).map(|s| Arc::clone(&s)) else {
            return;
        };

        let (token, cols, rows) = {
            let mut st = state.lock();

            if st.redraw_task.is_some() {
                debug!("Redraw of {} already pending", terminal_id);
                return;
            }

            if let Some(last) = st.last_redraw {
                if last.elapsed() < inner.tuning.redraw_min_interval {
                    debug!("Redraw of {} rate-limited", terminal_id);
                    return;
                }
            }

            let Some((cols, rows)) = st.applied else {
                debug!("Redraw of {} skipped: geometry unknown", terminal_id);
                return;
            };

            let token = CancellationToken::new();
            st.redraw_task = Some(token.clone());
            (token, cols, rows)
        };

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            inner
                .run_redraw(terminal_id, cols, rows, state, token)
                .await;
        });
    }

    async fn run_redraw(
        &self,
        terminal_id: Uuid,
        cols: u16,
        rows: u16,
        state: Arc<Mutex<TermState>>,
        token: CancellationToken,
    ) {
        // Wait for a quiet terminal. Perturbing mid-stream interleaves
        // repaint bytes with live output and corrupts the screen, so after
        // bounded deferrals the redraw is abandoned, never forced.
        let mut deferrals = 0u32;
        loop {
            if token.is_cancelled() {
                state.lock().redraw_task = None;
                return;
            }

            let quiet = {
                let st = state.lock();
                st.last_output
                    .map_or(true, |t| t.elapsed() >= self.tuning.quiet_period)
            };
            if quiet {
                break;
            }

            deferrals += 1;
            if deferrals > self.tuning.max_defer_attempts {
                info!(
                    "Redraw of {} abandoned: output continuous through {} deferrals",
                    terminal_id, self.tuning.max_defer_attempts
                );
                state.lock().redraw_task = None;
                return;
            }

            tokio::select! {
                _ = token.cancelled() => {
                    state.lock().redraw_task = None;
                    return;
                }
                _ = sleep(self.tuning.quiet_period) => {}
            }
        }

        // Open the discard window before touching the PTY so no repaint
        // byte can race past the gate.
        {
            let mut st = state.lock();
            st.last_redraw = Some(Instant::now());
            st.discard_until = Some(Instant::now() + PERTURB_SETTLE + DISCARD_TAIL);
        }

        let shrunk = cols.saturating_sub(1).max(1);
        if let Err(e) = self.backend.apply_resize(terminal_id, shrunk, rows) {
            warn!("Redraw shrink step for {} failed: {}", terminal_id, e);
            let mut st = state.lock();
            st.redraw_task = None;
            st.discard_until = None;
            return;
        }

        tokio::select! {
            _ = token.cancelled() => {
                // Restore geometry even when cancelled mid-perturbation
                let _ = self.backend.apply_resize(terminal_id, cols, rows);
                state.lock().redraw_task = None;
                return;
            }
            _ = sleep(PERTURB_SETTLE) => {}
        }

        if let Err(e) = self.backend.apply_resize(terminal_id, cols, rows) {
            warn!("Redraw restore step for {} failed: {}", terminal_id, e);
        }

        let mut st = state.lock();
        st.discard_until = Some(Instant::now() + DISCARD_TAIL);
        st.redraw_task = None;
        debug!("Redraw of {} complete", terminal_id);
    }
}

impl std::fmt::Debug for ResizeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResizeCoordinator")
            .field("tracked_terminals", &self.inner.states.len())
            .finish()
    }
}
