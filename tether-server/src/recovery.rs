//! Startup reconciliation
//!
//! The broker persists nothing itself; the multiplexer's sessions are the
//! durable state. On start the reserved namespace is enumerated and a
//! Detached terminal is rebuilt for every session found, before the socket
//! is opened, so no client can ever observe a partial terminal list.

use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::MuxClient;
use crate::terminal::{Terminal, TerminalRegistry};

/// Outcome of the startup scan
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Terminals rebuilt into the registry
    pub recovered: usize,
    /// Session names in the namespace that did not decode to a terminal id
    pub skipped: Vec<String>,
}

/// Enumerate multiplexer inventory and rebuild registry entries.
///
/// The scan is bounded by `scan_timeout`; on timeout or a multiplexer
/// failure the broker starts with zero recovered sessions rather than
/// refusing to start.
pub async fn reconcile(
    mux: &MuxClient,
    registry: &RwLock<TerminalRegistry>,
    scan_timeout: Duration,
) -> RecoveryReport {
    let names = match timeout(scan_timeout, mux.list_sessions()).await {
        Ok(Ok(names)) => names,
        Ok(Err(e)) => {
            warn!("Recovery scan failed, starting with no sessions: {}", e);
            return RecoveryReport::default();
        }
        Err(_) => {
            warn!(
                "Recovery scan exceeded {:?}, starting with no sessions",
                scan_timeout
            );
            return RecoveryReport::default();
        }
    };

    let (terminals, skipped) = terminals_from_session_names(mux, &names);

    let mut report = RecoveryReport {
        recovered: 0,
        skipped,
    };

    let mut registry = registry.write().await;
    for terminal in terminals {
        if registry.insert_recovered(terminal) {
            report.recovered += 1;
        }
    }

    info!(
        "Recovery complete: {} terminals rebuilt, {} foreign names skipped",
        report.recovered,
        report.skipped.len()
    );

    report
}

/// Decode session names into Detached terminals. Pure so the mapping is
/// testable without a multiplexer.
///
/// The display name is best effort: the session name only encodes the id,
/// so the first id group has to serve until the user renames it.
pub fn terminals_from_session_names(
    mux: &MuxClient,
    names: &[String],
) -> (Vec<Terminal>, Vec<String>) {
    let mut terminals = Vec::new();
    let mut skipped = Vec::new();

    for name in names {
        match mux.parse_session_name(name) {
            Some(id) => {
                terminals.push(Terminal::recovered(id, derived_name(id), name.clone()));
            }
            None => skipped.push(name.clone()),
        }
    }

    (terminals, skipped)
}

fn derived_name(id: Uuid) -> String {
    let text = id.to_string();
    let group = text.split('-').next().unwrap_or(&text);
    format!("term-{}", group)
}
