// ABOUTME: Store configuration loaded from LAUNCHERDB_* environment variables.
// ABOUTME: Resolves the data directory, database file name, and SQLite busy timeout.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_FILE_NAME: &str = "settings.db";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("LAUNCHERDB_BUSY_TIMEOUT_MS is not a valid number of milliseconds: {0}")]
    InvalidBusyTimeout(String),

    #[error("LAUNCHERDB_FILE must be a plain file name, got {0}")]
    InvalidFileName(String),
}

/// Where the launcher database lives and how it is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub home: PathBuf,
    pub file_name: String,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    /// Config rooted at `home` with default file name and timeout.
    pub fn in_dir(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            file_name: DEFAULT_FILE_NAME.to_string(),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - LAUNCHERDB_HOME: data directory (default: ~/.launcherdb)
    /// - LAUNCHERDB_FILE: database file name (default: settings.db)
    /// - LAUNCHERDB_BUSY_TIMEOUT_MS: SQLite busy timeout (default: 5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let home = lookup("LAUNCHERDB_HOME")
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                lookup("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".launcherdb")
            });

        let file_name = lookup("LAUNCHERDB_FILE")
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
        if file_name.contains('/') || file_name.contains('\\') {
            return Err(ConfigError::InvalidFileName(file_name));
        }

        let busy_timeout = match lookup("LAUNCHERDB_BUSY_TIMEOUT_MS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::InvalidBusyTimeout(raw))?,
            None => Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        };

        Ok(Self {
            home,
            file_name,
            busy_timeout,
        })
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    /// Full path of the database file.
    pub fn db_path(&self) -> PathBuf {
        self.home.join(&self.file_name)
    }
}
