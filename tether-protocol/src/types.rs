//! Wire-level data types shared by client and server

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a terminal
///
/// Transitions: `Spawning → Attached ⇄ Detached → Killed`. `Killed` is
/// terminal; the server never resurrects a killed id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalState {
    /// Process is being spawned; not yet streaming
    Spawning,
    /// Local bridge is connected and output is flowing
    Attached,
    /// Multiplexer session is alive but no local bridge is connected
    Detached,
    /// Session destroyed; the id will never produce output again
    Killed,
}

impl TerminalState {
    /// Whether this state admits no further transitions
    pub fn is_final(&self) -> bool {
        matches!(self, TerminalState::Killed)
    }
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminalState::Spawning => "spawning",
            TerminalState::Attached => "attached",
            TerminalState::Detached => "detached",
            TerminalState::Killed => "killed",
        };
        write!(f, "{}", s)
    }
}

/// What kind of process a terminal runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessKind {
    /// Interactive login shell
    Shell,
    /// One-off command (exits when the command does)
    Command,
}

/// How a terminal is backed by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackingMode {
    /// Bridged into a durable multiplexer session; survives broker restarts
    Multiplexed,
    /// Direct PTY child; dies with the broker
    Raw,
}

/// What triggered a resize request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeSource {
    /// The client viewport changed (window resize, panel drag)
    Viewport,
    /// A client re-established ownership and needs a consistent repaint
    Reconnect,
    /// Programmatic caller (API, tooling)
    Api,
}

/// Snapshot of a terminal's registry entry, as sent to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalInfo {
    /// Stable unique id; for multiplexed terminals this is also encoded in
    /// the multiplexer session name
    pub id: Uuid,
    /// Display name (unique within the registry)
    pub name: String,
    pub kind: ProcessKind,
    pub backing: BackingMode,
    /// Working directory the process was started in
    pub cwd: String,
    /// Multiplexer session name, when backing is `Multiplexed`
    pub mux_session: Option<String>,
    /// Unix timestamp (seconds)
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last input or output
    pub last_activity_at: u64,
    pub state: TerminalState,
}

/// Parameters for spawning a new terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Display name; the server assigns one when absent and de-duplicates
    /// collisions
    pub name: Option<String>,
    pub kind: ProcessKind,
    /// Command to run instead of the default shell
    pub command: Option<String>,
    /// Working directory; server default when absent
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    /// Force raw backing even when a multiplexer is available
    #[serde(default)]
    pub raw: bool,
    /// Grant the spawning connection ownership of the new terminal.
    /// Gateways spawning on behalf of API callers set this to false: such a
    /// terminal has no owner until a client explicitly requests one.
    #[serde(default = "default_take_ownership")]
    pub take_ownership: bool,
}

fn default_take_ownership() -> bool {
    true
}

impl SpawnOptions {
    /// A plain interactive shell with the given geometry
    pub fn shell(cols: u16, rows: u16) -> Self {
        Self {
            name: None,
            kind: ProcessKind::Shell,
            command: None,
            cwd: None,
            cols,
            rows,
            raw: false,
            take_ownership: true,
        }
    }

    /// A named one-off command
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            kind: ProcessKind::Command,
            command: Some(command.into()),
            cwd: None,
            cols: 80,
            rows: 24,
            raw: false,
            take_ownership: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(TerminalState::Detached.to_string(), "detached");
        assert_eq!(TerminalState::Killed.to_string(), "killed");
    }

    #[test]
    fn test_killed_is_final() {
        assert!(TerminalState::Killed.is_final());
        assert!(!TerminalState::Attached.is_final());
        assert!(!TerminalState::Detached.is_final());
        assert!(!TerminalState::Spawning.is_final());
    }

    #[test]
    fn test_spawn_options_shell_defaults() {
        let opts = SpawnOptions::shell(120, 32);
        assert_eq!(opts.kind, ProcessKind::Shell);
        assert_eq!((opts.cols, opts.rows), (120, 32));
        assert!(opts.take_ownership);
        assert!(!opts.raw);
        assert!(opts.name.is_none());
    }

    #[test]
    fn test_spawn_options_roundtrip() {
        let opts = SpawnOptions::command("build", "cargo build");
        let bytes = bincode::serialize(&opts).unwrap();
        let back: SpawnOptions = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.name.as_deref(), Some("build"));
        assert_eq!(back.command.as_deref(), Some("cargo build"));
        assert_eq!(back.kind, ProcessKind::Command);
    }
}
