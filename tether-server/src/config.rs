//! Server configuration: schema and loader

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use tether_utils::{config_file, Result, TetherError};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub mux: MuxConfig,
    pub terminal: TerminalConfig,
    pub resize: ResizeConfig,
}

/// General daemon settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override the unix socket path (default: XDG runtime dir)
    pub socket_path: Option<PathBuf>,
}

/// Multiplexer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Multiplexer binary
    pub bin: String,
    /// Reserved session-name namespace; the terminal id follows the prefix
    pub session_prefix: String,
    /// Upper bound on the startup inventory scan in milliseconds
    pub recovery_timeout_ms: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            bin: "tmux".to_string(),
            session_prefix: "tether-".to_string(),
            recovery_timeout_ms: 3000,
        }
    }
}

/// Terminal defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell to run when a spawn request names no command
    /// (default: $SHELL, then /bin/sh)
    pub default_shell: Option<String>,
    pub default_cols: u16,
    pub default_rows: u16,
    /// Scrollback lines fetched from the multiplexer on capture
    pub capture_lines: u32,
    /// In-memory scrollback cap for raw terminals, in bytes
    pub raw_scrollback_bytes: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            default_cols: 80,
            default_rows: 24,
            capture_lines: 200,
            raw_scrollback_bytes: 256 * 1024,
        }
    }
}

/// Resize coordinator tunables. All windows are short wall-clock timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResizeConfig {
    /// Debounce window for repeated resize requests (latest wins)
    pub debounce_ms: u64,
    /// Minimum interval between forced redraws of the same terminal
    pub redraw_min_interval_ms: u64,
    /// A redraw is deferred while the terminal produced output within
    /// this window
    pub quiet_period_ms: u64,
    /// Deferral attempts before a pending redraw is abandoned
    pub max_defer_attempts: u32,
    /// Ceiling for the per-terminal random delay when redrawing a group
    pub stagger_max_ms: u64,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 150,
            redraw_min_interval_ms: 1000,
            quiet_period_ms: 300,
            max_defer_attempts: 5,
            stagger_max_ms: 250,
        }
    }
}

impl TerminalConfig {
    /// Resolve the shell to spawn: config, then $SHELL, then /bin/sh
    pub fn shell(&self) -> String {
        self.default_shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the default location, falling back to
    /// defaults when no file exists
    pub fn load() -> Result<AppConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(AppConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| TetherError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<AppConfig> {
        toml::from_str(content).map_err(|e| TetherError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &AppConfig) -> Result<()> {
        if config.mux.session_prefix.is_empty() {
            return Err(TetherError::config("mux.session_prefix must not be empty"));
        }

        if config.resize.debounce_ms == 0 {
            return Err(TetherError::config("resize.debounce_ms must be positive"));
        }

        if config.resize.max_defer_attempts == 0 {
            return Err(TetherError::config(
                "resize.max_defer_attempts must be at least 1",
            ));
        }

        if config.terminal.default_cols == 0 || config.terminal.default_rows == 0 {
            return Err(TetherError::config(
                "terminal geometry must be non-zero",
            ));
        }

        Ok(())
    }

    /// Load and validate
    pub fn load_and_validate() -> Result<AppConfig> {
        let config = Self::load()?;
        Self::validate(&config)?;
        Ok(config)
    }
}
