//! Authoritative directory of terminal entities

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;
use uuid::Uuid;

use tether_protocol::{BackingMode, ProcessKind, SpawnOptions, TerminalInfo};
use tether_utils::{Result, TetherError};

use super::Terminal;

/// Registry of all terminals known to the broker
///
/// The registry owns identity and metadata only; process plumbing lives in
/// the backend and routing in the router. All mutation goes through the
/// server's single `RwLock` around this struct, which serializes
/// registration against close and recovery.
#[derive(Debug, Default)]
pub struct TerminalRegistry {
    terminals: HashMap<Uuid, Terminal>,
    /// Display name -> id, for de-duplication
    name_to_id: HashMap<String, Uuid>,
    /// Counter feeding generated names
    next_name_seq: u64,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new terminal from spawn options.
    ///
    /// Validates the working directory, assigns a display name when absent,
    /// and de-duplicates colliding names with a numeric suffix. The entry
    /// starts in `Spawning` state; the caller flips it to `Attached` once
    /// the backend bind succeeds, or removes it when the spawn fails.
    pub fn register(
        &mut self,
        options: &SpawnOptions,
        backing: BackingMode,
        session_prefix: &str,
    ) -> Result<&Terminal> {
        let cwd = self.validate_cwd(options.cwd.as_deref())?;
        let name = self.resolve_name(options.name.as_deref());

        let mut terminal = Terminal::new(name.clone(), options.kind, backing, cwd, None);
        let id = terminal.id();

        // For multiplexed terminals the session name embeds the id, which
        // is the invariant recovery depends on.
        if backing == BackingMode::Multiplexed {
            terminal.set_mux_session(format!("{}{}", session_prefix, id));
        }

        self.name_to_id.insert(name, id);
        self.terminals.insert(id, terminal);

        debug!("Registered terminal {}", id);
        Ok(self.terminals.get(&id).expect("just inserted"))
    }

    /// Insert a terminal reconstructed from multiplexer inventory.
    /// Existing entries win; recovery never clobbers live state.
    pub fn insert_recovered(&mut self, mut terminal: Terminal) -> bool {
        let id = terminal.id();
        if self.terminals.contains_key(&id) {
            return false;
        }

        let name = self.resolve_name(Some(terminal.name()));
        terminal.set_name(name.clone());

        self.name_to_id.insert(name, id);
        self.terminals.insert(id, terminal);
        true
    }

    pub fn get(&self, id: Uuid) -> Option<&Terminal> {
        self.terminals.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Terminal> {
        self.terminals.get_mut(&id)
    }

    /// Snapshot of every terminal, oldest first
    pub fn list(&self) -> Vec<TerminalInfo> {
        let mut infos: Vec<TerminalInfo> =
            self.terminals.values().map(Terminal::to_info).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Snapshot filtered by process kind
    pub fn list_by_kind(&self, kind: ProcessKind) -> Vec<TerminalInfo> {
        self.list()
            .into_iter()
            .filter(|t| t.kind == kind)
            .collect()
    }

    /// Remove a terminal. Idempotent: an unknown id is a success that
    /// removes nothing.
    pub fn close(&mut self, id: Uuid) -> Option<Terminal> {
        let terminal = self.terminals.remove(&id)?;
        self.name_to_id.remove(terminal.name());
        debug!("Closed terminal {}", id);
        Some(terminal)
    }

    pub fn count(&self) -> usize {
        self.terminals.len()
    }

    fn validate_cwd(&self, cwd: Option<&str>) -> Result<PathBuf> {
        let path = match cwd {
            Some(dir) => PathBuf::from(dir),
            None => std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/")),
        };

        if !path.is_dir() {
            return Err(TetherError::validation(format!(
                "working directory does not exist: {}",
                path.display()
            )));
        }

        Ok(path)
    }

    /// Pick a display name: the requested one if free, a numeric-suffixed
    /// variant if taken, or a generated `term-N` when absent.
    fn resolve_name(&mut self, requested: Option<&str>) -> String {
        match requested {
            Some(name) if !self.name_to_id.contains_key(name) => name.to_string(),
            Some(name) => {
                let mut n = 2;
                loop {
                    let candidate = format!("{}-{}", name, n);
                    if !self.name_to_id.contains_key(&candidate) {
                        return candidate;
                    }
                    n += 1;
                }
            }
            None => loop {
                self.next_name_seq += 1;
                let candidate = format!("term-{}", self.next_name_seq);
                if !self.name_to_id.contains_key(&candidate) {
                    return candidate;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::TerminalState;

    fn opts(name: Option<&str>) -> SpawnOptions {
        SpawnOptions {
            name: name.map(String::from),
            kind: ProcessKind::Shell,
            command: None,
            cwd: Some("/tmp".into()),
            cols: 80,
            rows: 24,
            raw: false,
            take_ownership: true,
        }
    }

    #[test]
    fn test_register_assigns_name_when_absent() {
        let mut registry = TerminalRegistry::new();
        let id = {
            let t = registry
                .register(&opts(None), BackingMode::Multiplexed, "tether-")
                .unwrap();
            assert_eq!(t.name(), "term-1");
            t.id()
        };

        assert!(registry.get(id).is_some());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_register_deduplicates_names() {
        let mut registry = TerminalRegistry::new();
        registry
            .register(&opts(Some("build")), BackingMode::Multiplexed, "tether-")
            .unwrap();
        let name2 = registry
            .register(&opts(Some("build")), BackingMode::Multiplexed, "tether-")
            .unwrap()
            .name()
            .to_string();
        let name3 = registry
            .register(&opts(Some("build")), BackingMode::Multiplexed, "tether-")
            .unwrap()
            .name()
            .to_string();

        assert_eq!(name2, "build-2");
        assert_eq!(name3, "build-3");
    }

    #[test]
    fn test_register_rejects_bad_cwd() {
        let mut registry = TerminalRegistry::new();
        let mut options = opts(Some("x"));
        options.cwd = Some("/definitely/not/a/real/path".into());

        let result = registry.register(&options, BackingMode::Multiplexed, "tether-");
        assert!(matches!(result, Err(TetherError::Validation(_))));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_mux_session_name_embeds_id() {
        let mut registry = TerminalRegistry::new();
        let t = registry
            .register(&opts(None), BackingMode::Multiplexed, "tether-")
            .unwrap();
        let session = t.mux_session().unwrap();
        assert_eq!(session, format!("tether-{}", t.id()));
    }

    #[test]
    fn test_raw_terminal_has_no_mux_session() {
        let mut registry = TerminalRegistry::new();
        let t = registry
            .register(&opts(None), BackingMode::Raw, "tether-")
            .unwrap();
        assert!(t.mux_session().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut registry = TerminalRegistry::new();
        let id = registry
            .register(&opts(None), BackingMode::Multiplexed, "tether-")
            .unwrap()
            .id();

        assert!(registry.close(id).is_some());
        assert!(registry.close(id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_close_frees_name() {
        let mut registry = TerminalRegistry::new();
        let id = registry
            .register(&opts(Some("build")), BackingMode::Multiplexed, "tether-")
            .unwrap()
            .id();
        registry.close(id);

        let t = registry
            .register(&opts(Some("build")), BackingMode::Multiplexed, "tether-")
            .unwrap();
        assert_eq!(t.name(), "build");
    }

    #[test]
    fn test_list_by_kind() {
        let mut registry = TerminalRegistry::new();
        registry
            .register(&opts(Some("shell")), BackingMode::Multiplexed, "tether-")
            .unwrap();

        let mut cmd_opts = opts(Some("job"));
        cmd_opts.kind = ProcessKind::Command;
        cmd_opts.command = Some("cargo test".into());
        registry
            .register(&cmd_opts, BackingMode::Multiplexed, "tether-")
            .unwrap();

        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.list_by_kind(ProcessKind::Command).len(), 1);
        assert_eq!(
            registry.list_by_kind(ProcessKind::Command)[0].name,
            "job"
        );
    }

    #[test]
    fn test_insert_recovered_skips_existing() {
        let mut registry = TerminalRegistry::new();
        let id = Uuid::new_v4();

        let t = Terminal::recovered(id, "term-abc".into(), format!("tether-{}", id));
        assert!(registry.insert_recovered(t));

        let dup = Terminal::recovered(id, "term-abc".into(), format!("tether-{}", id));
        assert!(!registry.insert_recovered(dup));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(id).unwrap().state(), TerminalState::Detached);
    }
}
