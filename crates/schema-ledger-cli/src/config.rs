use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use schema_ledger_core::{LogTable, RunContext};
use serde::Deserialize;

pub const DEFAULT_DB: &str = "./schema_ledger.sqlite3";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Optional settings, read from a YAML file or assembled from command-line flags.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    pub db: Option<PathBuf>,
    pub table: Option<String>,
    /// Run deadline in seconds. `0` disables the deadline.
    pub timeout_secs: Option<u64>,
    pub log_level: Option<String>,
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db: PathBuf,
    pub table: LogTable,
    pub timeout: Option<Duration>,
    pub log_filter: String,
}

impl LedgerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&body)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn from_yaml(body: &str) -> Result<Self> {
        serde_yaml::from_str(body).context("invalid ledger config")
    }

    /// Fill every unset field of `self` from `lower`.
    #[must_use]
    pub fn merged_over(self, lower: Self) -> Self {
        Self {
            db: self.db.or(lower.db),
            table: self.table.or(lower.table),
            timeout_secs: self.timeout_secs.or(lower.timeout_secs),
            log_level: self.log_level.or(lower.log_level),
        }
    }

    /// Apply defaults and validate the log table name.
    pub fn into_settings(self) -> Result<Settings> {
        let table = match self.table {
            Some(raw) => LogTable::named(&raw)
                .with_context(|| format!("invalid log table name `{raw}`"))?,
            None => LogTable::default(),
        };

        Ok(Settings {
            db: self.db.unwrap_or_else(|| PathBuf::from(DEFAULT_DB)),
            table,
            timeout: self.timeout_secs.filter(|secs| *secs > 0).map(Duration::from_secs),
            log_filter: self.log_level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }
}

impl Settings {
    #[must_use]
    pub fn run_context(&self) -> RunContext {
        self.timeout.map_or_else(RunContext::background, RunContext::with_timeout)
    }
}
