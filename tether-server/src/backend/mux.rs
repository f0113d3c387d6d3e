//! Multiplexer control commands
//!
//! Drives the tmux binary for everything that is not the interactive
//! bridge: session inventory, teardown, and on-demand scrollback capture.
//! These run as short-lived child processes so nothing here can stall a
//! terminal's hot path.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use tether_utils::{Result, TetherError};

/// Client for the multiplexer CLI
#[derive(Debug, Clone)]
pub struct MuxClient {
    bin: String,
    prefix: String,
}

impl MuxClient {
    pub fn new(bin: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            prefix: prefix.into(),
        }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Session name for a terminal id. The id is recoverable from the name,
    /// which is what startup reconciliation relies on.
    pub fn session_name(&self, id: Uuid) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Extract a terminal id from a session name in our namespace
    pub fn parse_session_name(&self, name: &str) -> Option<Uuid> {
        let rest = name.strip_prefix(&self.prefix)?;
        Uuid::parse_str(rest).ok()
    }

    /// Whether the multiplexer binary is runnable at all
    pub async fn available(&self) -> bool {
        Command::new(&self.bin)
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Whether a session with this exact name exists
    pub async fn has_session(&self, session: &str) -> bool {
        self.run(&["has-session", "-t", &exact(session)])
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Destroy a session. Succeeds if the session is already gone.
    pub async fn kill_session(&self, session: &str) -> Result<()> {
        let out = self.run(&["kill-session", "-t", &exact(session)]).await?;
        if out.status.success() {
            debug!("Killed mux session {}", session);
            return Ok(());
        }

        // tmux reports a missing session (or no server) on stderr; both
        // mean there is nothing left to kill.
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.contains("can't find session") || stderr.contains("no server running") {
            return Ok(());
        }

        Err(TetherError::mux(format!(
            "kill-session {} failed: {}",
            session,
            stderr.trim()
        )))
    }

    /// Fetch up to `lines` lines of recent scrollback plus the visible screen
    pub async fn capture_pane(&self, session: &str, lines: u32) -> Result<Vec<u8>> {
        let start = format!("-{}", lines);
        let out = self
            .run(&[
                "capture-pane",
                "-p",
                "-e",
                "-t",
                &exact(session),
                "-S",
                &start,
            ])
            .await?;

        if !out.status.success() {
            return Err(TetherError::mux(format!(
                "capture-pane {} failed: {}",
                session,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        Ok(out.stdout)
    }

    /// List every session name in our reserved namespace
    ///
    /// A missing server is an empty inventory, not an error; that case is
    /// what the recovery scan degrades through.
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let out = self
            .run(&["list-sessions", "-F", "#{session_name}"])
            .await?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if stderr.contains("no server running") || stderr.contains("error connecting") {
                return Ok(Vec::new());
            }
            return Err(TetherError::mux(format!(
                "list-sessions failed: {}",
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|name| name.starts_with(&self.prefix))
            .map(String::from)
            .collect())
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TetherError::mux(format!("{} {:?}: {}", self.bin, args.first(), e)))
    }
}

/// tmux target prefixed with `=` for exact-name matching
fn exact(session: &str) -> String {
    format!("={}", session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name_roundtrip() {
        let mux = MuxClient::new("tmux", "tether-");
        let id = Uuid::new_v4();

        let name = mux.session_name(id);
        assert!(name.starts_with("tether-"));
        assert_eq!(mux.parse_session_name(&name), Some(id));
    }

    #[test]
    fn test_parse_rejects_foreign_sessions() {
        let mux = MuxClient::new("tmux", "tether-");
        assert_eq!(mux.parse_session_name("main"), None);
        assert_eq!(mux.parse_session_name("tether-not-a-uuid"), None);
        assert_eq!(mux.parse_session_name("other-prefix-abc"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_not_available() {
        let mux = MuxClient::new("/nonexistent/definitely-not-tmux", "tether-");
        assert!(!mux.available().await);
    }

    #[tokio::test]
    async fn test_missing_binary_list_errors() {
        let mux = MuxClient::new("/nonexistent/definitely-not-tmux", "tether-");
        assert!(mux.list_sessions().await.is_err());
    }

    #[tokio::test]
    async fn test_has_session_false_without_server() {
        let mux = MuxClient::new("/nonexistent/definitely-not-tmux", "tether-");
        assert!(!mux.has_session("tether-x").await);
    }
}
