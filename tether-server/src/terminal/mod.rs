//! Terminal entities and the session registry

mod registry;

pub use registry::TerminalRegistry;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use tether_protocol::{BackingMode, ProcessKind, TerminalInfo, TerminalState};
use tether_utils::{unix_timestamp, Result, TetherError};

/// A logical terminal tracked by the registry
///
/// The id is assigned once and never changes for the life of the process;
/// for multiplexed terminals it is also encoded in the multiplexer session
/// name, which is what makes startup recovery possible.
#[derive(Debug)]
pub struct Terminal {
    id: Uuid,
    name: String,
    kind: ProcessKind,
    backing: BackingMode,
    cwd: PathBuf,
    mux_session: Option<String>,
    state: TerminalState,
    created_at: u64,
    /// Shared with the output pump so the hot path never takes the
    /// registry lock
    last_activity: Arc<AtomicU64>,
}

impl Terminal {
    /// Create a new terminal in `Spawning` state
    pub fn new(
        name: String,
        kind: ProcessKind,
        backing: BackingMode,
        cwd: PathBuf,
        mux_session: Option<String>,
    ) -> Self {
        let now = unix_timestamp();
        Self {
            id: Uuid::new_v4(),
            name,
            kind,
            backing,
            cwd,
            mux_session,
            state: TerminalState::Spawning,
            created_at: now,
            last_activity: Arc::new(AtomicU64::new(now)),
        }
    }

    /// Reconstruct a terminal discovered in the multiplexer inventory.
    /// Starts in `Detached` state; cwd and creation time are unknown.
    pub fn recovered(id: Uuid, name: String, mux_session: String) -> Self {
        let now = unix_timestamp();
        Self {
            id,
            name,
            kind: ProcessKind::Shell,
            backing: BackingMode::Multiplexed,
            cwd: PathBuf::from("/"),
            mux_session: Some(mux_session),
            state: TerminalState::Detached,
            created_at: now,
            last_activity: Arc::new(AtomicU64::new(now)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn backing(&self) -> BackingMode {
        self.backing
    }

    pub fn cwd(&self) -> &PathBuf {
        &self.cwd
    }

    pub fn mux_session(&self) -> Option<&str> {
        self.mux_session.as_deref()
    }

    pub fn state(&self) -> TerminalState {
        self.state
    }

    pub fn is_multiplexed(&self) -> bool {
        self.backing == BackingMode::Multiplexed
    }

    pub(crate) fn set_mux_session(&mut self, session: String) {
        self.mux_session = Some(session);
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// Record activity (input or output) now
    pub fn touch(&self) {
        self.last_activity.store(unix_timestamp(), Ordering::Relaxed);
    }

    /// Handle for the output pump to record activity without the registry
    pub fn activity_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.last_activity)
    }

    /// Move to a new lifecycle state, enforcing the legal transitions:
    /// `Spawning → Attached ⇄ Detached → Killed`, plus `Spawning → Killed`
    /// for terminals closed before the spawn finished. Nothing leaves
    /// `Killed`.
    pub fn transition(&mut self, to: TerminalState) -> Result<()> {
        use TerminalState::*;

        let ok = match (self.state, to) {
            (Spawning, Attached) => true,
            (Spawning, Killed) => true,
            (Attached, Detached) => true,
            (Detached, Attached) => true,
            (Attached, Killed) => true,
            (Detached, Killed) => true,
            (from, to) if from == to => true,
            _ => false,
        };

        if !ok {
            return Err(TetherError::internal(format!(
                "illegal terminal state transition {} -> {} for {}",
                self.state, to, self.id
            )));
        }

        self.state = to;
        Ok(())
    }

    /// Snapshot for the wire
    pub fn to_info(&self) -> TerminalInfo {
        TerminalInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            backing: self.backing,
            cwd: self.cwd.to_string_lossy().into_owned(),
            mux_session: self.mux_session.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity.load(Ordering::Relaxed),
            state: self.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_terminal() -> Terminal {
        Terminal::new(
            "work".into(),
            ProcessKind::Shell,
            BackingMode::Multiplexed,
            PathBuf::from("/tmp"),
            Some("tether-test".into()),
        )
    }

    #[test]
    fn test_new_terminal_is_spawning() {
        let t = shell_terminal();
        assert_eq!(t.state(), TerminalState::Spawning);
        assert_eq!(t.name(), "work");
    }

    #[test]
    fn test_full_lifecycle() {
        let mut t = shell_terminal();
        t.transition(TerminalState::Attached).unwrap();
        t.transition(TerminalState::Detached).unwrap();
        t.transition(TerminalState::Attached).unwrap();
        t.transition(TerminalState::Killed).unwrap();
        assert_eq!(t.state(), TerminalState::Killed);
    }

    #[test]
    fn test_no_exit_from_killed() {
        let mut t = shell_terminal();
        t.transition(TerminalState::Attached).unwrap();
        t.transition(TerminalState::Killed).unwrap();

        assert!(t.transition(TerminalState::Attached).is_err());
        assert!(t.transition(TerminalState::Detached).is_err());
        assert!(t.transition(TerminalState::Spawning).is_err());
        // Self-transition is a no-op, not an error
        assert!(t.transition(TerminalState::Killed).is_ok());
    }

    #[test]
    fn test_spawning_cannot_detach() {
        let mut t = shell_terminal();
        assert!(t.transition(TerminalState::Detached).is_err());
    }

    #[test]
    fn test_recovered_terminal() {
        let id = Uuid::new_v4();
        let t = Terminal::recovered(id, "term-9f3ab2c1".into(), format!("tether-{}", id));
        assert_eq!(t.id(), id);
        assert_eq!(t.state(), TerminalState::Detached);
        assert!(t.is_multiplexed());
        assert!(t.mux_session().unwrap().contains(&id.to_string()));
    }

    #[test]
    fn test_touch_updates_activity() {
        let t = shell_terminal();
        let before = t.to_info().last_activity_at;
        t.touch();
        assert!(t.to_info().last_activity_at >= before);
    }
}
