//! Runtime settings.
//!
//! Paths and tunables are read from the environment once at startup:
//!
//! | Variable                 | Default           |
//! |--------------------------|-------------------|
//! | `SELFCONTROL_HOME`       | `~/.selfcontrol`  |
//! | `SELFCONTROL_HOSTS_FILE` | `/etc/hosts`      |
//! | `SELFCONTROL_POLL_MS`    | `1000`            |

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Data directory override.
pub const ENV_HOME: &str = "SELFCONTROL_HOME";
/// Hosts file override.
pub const ENV_HOSTS_FILE: &str = "SELFCONTROL_HOSTS_FILE";
/// Poll interval override, in milliseconds.
pub const ENV_POLL_MS: &str = "SELFCONTROL_POLL_MS";

const DEFAULT_HOSTS_FILE: &str = "/etc/hosts";
const DEFAULT_DIR_NAME: &str = ".selfcontrol";
const DEFAULT_POLL_MS: u64 = 1000;
const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

const CONFIG_FILE: &str = "config.yaml";
const SITES_FILE: &str = "blocked-sites.yaml";
const LOCK_FILE: &str = "selfcontrol.lock";
const PASSWORD_FILE: &str = "password.hash";
const LOG_FILE: &str = "background.log";

/// Errors raised while building settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// No home directory and no `SELFCONTROL_HOME`.
    #[error("cannot determine home directory; set {ENV_HOME}")]
    HomeDirectoryNotFound,

    /// `SELFCONTROL_POLL_MS` is not a number.
    #[error("{ENV_POLL_MS} must be a whole number of milliseconds, got '{0}'")]
    InvalidPollInterval(String),

    /// A value is outside its allowed range.
    #[error("{0}")]
    OutOfRange(String),
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory holding config, site list, lock and password files
    pub data_dir: PathBuf,
    /// Hosts file rewritten by blocks
    pub hosts_path: PathBuf,
    /// Tick interval of block timers
    pub poll_interval: Duration,
    /// How long to wait for a previous background instance to exit
    pub kill_timeout: Duration,
}

impl Settings {
    /// Creates settings rooted at `data_dir` with default tunables.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            hosts_path: PathBuf::from(DEFAULT_HOSTS_FILE),
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }

    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = match non_empty(ENV_HOME) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or(SettingsError::HomeDirectoryNotFound)?
                .join(DEFAULT_DIR_NAME),
        };

        let mut settings = Self::new(data_dir);
        if let Some(hosts) = non_empty(ENV_HOSTS_FILE) {
            settings.hosts_path = PathBuf::from(hosts);
        }
        if let Some(raw) = non_empty(ENV_POLL_MS) {
            let millis: u64 = raw
                .trim()
                .parse()
                .map_err(|_| SettingsError::InvalidPollInterval(raw.clone()))?;
            settings.poll_interval = Duration::from_millis(millis);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Sets the hosts file path.
    #[must_use]
    pub fn with_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hosts_path = path.into();
        self
    }

    /// Sets the timer poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the background kill timeout.
    #[must_use]
    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    /// Validates the tunables.
    ///
    /// # Errors
    ///
    /// The poll interval must lie in 1ms..=60s and the kill timeout must be
    /// non-zero.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.poll_interval.is_zero() || self.poll_interval > MAX_POLL_INTERVAL {
            return Err(SettingsError::OutOfRange(format!(
                "poll interval must be between 1ms and 60s, got {:?}",
                self.poll_interval
            )));
        }
        if self.kill_timeout.is_zero() {
            return Err(SettingsError::OutOfRange(
                "kill timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of `config.yaml`.
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    /// Path of `blocked-sites.yaml`.
    pub fn sites_path(&self) -> PathBuf {
        self.data_dir.join(SITES_FILE)
    }

    /// Path of the background lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }

    /// Path of the password hash file.
    pub fn password_path(&self) -> PathBuf {
        self.data_dir.join(PASSWORD_FILE)
    }

    /// Path the background worker writes its output to.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE)
    }

    /// The data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
