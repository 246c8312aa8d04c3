use crate::error::{Result, ServeError};
use crate::layout;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServeConfig {
    /// Where server directories are kept
    #[serde(default)]
    pub storage: StorageConfig,

    /// How the Caddy binary is launched and stopped
    #[serde(default)]
    pub caddy: CaddyConfig,

    /// Status event delivery
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Managed root directory (default: `<data dir>/Serve/servers`)
    pub root: Option<PathBuf>,
}

impl StorageConfig {
    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(layout::default_root)
    }
}

/// Settings for the supervised server binary
///
/// # Security Warning
///
/// `binary` and `args` are executed directly. Configuration files must only
/// be writable by the user running the supervisor.
#[derive(Debug, Deserialize, Clone)]
pub struct CaddyConfig {
    /// Executable to launch (default: `caddy`, looked up on `PATH`)
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Argument template, split like a shell command line.
    /// Placeholders: `{config}`, `{id}`, `{root}`, `{port}`, `{access_log}`, `{error_log}`
    #[serde(default = "default_args")]
    pub args: String,

    /// How long a fresh process must survive to count as started, in milliseconds
    #[serde(default = "default_startup_check")]
    pub startup_check_ms: u64,

    /// Time between SIGTERM and SIGKILL, in milliseconds
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_ms: u64,

    /// Time to wait for a killed process to be reaped, in milliseconds
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_ms: u64,

    /// Upper bound for stopping everything at shutdown, in milliseconds
    #[serde(default = "default_shutdown_budget")]
    pub shutdown_budget_ms: u64,

    /// Refuse to start when the port is already bound
    #[serde(default = "default_check_port")]
    pub check_port: bool,
}

impl Default for CaddyConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: default_args(),
            startup_check_ms: default_startup_check(),
            shutdown_grace_period_ms: default_shutdown_grace_period(),
            kill_timeout_ms: default_kill_timeout(),
            shutdown_budget_ms: default_shutdown_budget(),
            check_port: default_check_port(),
        }
    }
}

impl CaddyConfig {
    /// Create a config launching `binary` with `args` (builder style, mostly for tests)
    pub fn command(binary: &str, args: &str) -> Self {
        Self {
            binary: binary.to_string(),
            args: args.to_string(),
            ..Self::default()
        }
    }

    pub fn with_timings(mut self, startup_check_ms: u64, grace_ms: u64, kill_ms: u64) -> Self {
        self.startup_check_ms = startup_check_ms;
        self.shutdown_grace_period_ms = grace_ms;
        self.kill_timeout_ms = kill_ms;
        self
    }

    pub fn startup_check(&self) -> Duration {
        Duration::from_millis(self.startup_check_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn shutdown_budget(&self) -> Duration {
        Duration::from_millis(self.shutdown_budget_ms)
    }

    /// Split the argument template, checking that it is well formed
    pub fn arg_template(&self) -> Result<Vec<String>> {
        shell_words::split(&self.args)
            .map_err(|e| ServeError::Config(format!("caddy.args: {}", e)))
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.binary.trim().is_empty() {
            return Err("caddy.binary must not be empty".to_string());
        }
        if let Err(e) = shell_words::split(&self.args) {
            return Err(format!("caddy.args is not a valid command line: {}", e));
        }
        if self.shutdown_budget_ms < self.kill_timeout_ms {
            return Err("caddy.shutdown_budget_ms must be at least caddy.kill_timeout_ms".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationConfig {
    /// Events buffered per subscriber before the oldest are dropped
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

// Default value functions
fn default_binary() -> String {
    "caddy".to_string()
}

fn default_args() -> String {
    "-conf {config}".to_string()
}

fn default_startup_check() -> u64 {
    300 // catches immediate failures such as a bound port
}

fn default_shutdown_grace_period() -> u64 {
    5000 // 5 seconds between SIGTERM and SIGKILL
}

fn default_kill_timeout() -> u64 {
    2000
}

fn default_shutdown_budget() -> u64 {
    10_000 // 10 seconds for all servers together
}

fn default_check_port() -> bool {
    true
}

fn default_capacity() -> usize {
    crate::notify::DEFAULT_CAPACITY
}

impl ServeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default location of the configuration file: `<config dir>/Serve/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|dir| dir.join("Serve").join("config.toml"))
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.caddy.validate() {
            errors.push(e);
        }
        if self.notifications.capacity == 0 {
            errors.push("notifications.capacity must be greater than 0".to_string());
        }
        if matches!(&self.storage.root, Some(root) if !root.is_absolute()) {
            errors.push("storage.root must be an absolute path".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
