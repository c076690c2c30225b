//! Coordination configuration.
//!
//! Layering: built-in defaults < TOML file < `CLAIMLOG_*` environment
//! variables. Validation runs once, at startup, and fails fast.
//!
//! In local dev the CLI calls `dotenvy::dotenv()` before loading, so a `.env`
//! file works the same way as exported variables.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backlog::{BackoffPolicy, DEFAULT_TASKS_ROOT, Jitter, Layout, RetryPolicy};
use crate::domain::{BranchName, Namespace};
use crate::error::{ConfigError, NameError};

pub const ENV_PREFIX: &str = "CLAIMLOG_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinationConfig {
    /// Coordination branch every worker publishes to.
    pub branch: BranchName,

    /// Publish attempts per operation (claim, heartbeat, completion).
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// A claim without a heartbeat for longer than this is reclaimed.
    pub lease_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub reclaim_interval_secs: u64,

    /// Idle wait of the worker loop when there is no work.
    pub poll_interval_secs: u64,

    /// Namespaces this deployment may draw from. Empty = all.
    pub namespaces: Vec<Namespace>,

    /// What this worker offers. Tasks with `required_capabilities` need at
    /// least one of them.
    pub capabilities: BTreeSet<String>,

    /// Directory (inside the substrate) that holds the namespaces.
    pub tasks_root: String,

    pub log_level: String,

    /// Local clone used by the git substrate.
    pub repo: Option<PathBuf>,
    pub remote: String,

    /// Author and committer of every coordination commit.
    pub author_name: String,
    pub author_email: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            branch: BranchName::default(),
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            lease_timeout_secs: 30,
            heartbeat_interval_secs: 10,
            reclaim_interval_secs: 15,
            poll_interval_secs: 5,
            namespaces: Vec::new(),
            capabilities: BTreeSet::new(),
            tasks_root: DEFAULT_TASKS_ROOT.to_string(),
            log_level: "info".to_string(),
            repo: None,
            remote: "origin".to_string(),
            author_name: "claimlog".to_string(),
            author_email: "claimlog@localhost".to_string(),
        }
    }
}

impl CoordinationConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Defaults, then the file at `path` (if given).
    pub fn from_file(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// File, then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `CLAIMLOG_*` variables found by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let var = |key: &str| {
            let name = format!("{ENV_PREFIX}{key}");
            lookup(&name).map(|value| (name, value))
        };

        if let Some((name, value)) = var("BRANCH") {
            self.branch = value.parse().map_err(|e: NameError| env_error(&name, &value, e))?;
        }
        if let Some((name, value)) = var("MAX_ATTEMPTS") {
            self.max_attempts = parse_number(&name, &value)?;
        }
        if let Some((name, value)) = var("BACKOFF_BASE_MS") {
            self.backoff_base_ms = parse_number(&name, &value)?;
        }
        if let Some((name, value)) = var("BACKOFF_MAX_MS") {
            self.backoff_max_ms = parse_number(&name, &value)?;
        }
        if let Some((name, value)) = var("LEASE_TIMEOUT_SECS") {
            self.lease_timeout_secs = parse_number(&name, &value)?;
        }
        if let Some((name, value)) = var("HEARTBEAT_INTERVAL_SECS") {
            self.heartbeat_interval_secs = parse_number(&name, &value)?;
        }
        if let Some((name, value)) = var("RECLAIM_INTERVAL_SECS") {
            self.reclaim_interval_secs = parse_number(&name, &value)?;
        }
        if let Some((name, value)) = var("POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_number(&name, &value)?;
        }
        if let Some((name, value)) = var("NAMESPACES") {
            self.namespaces = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse().map_err(|e: NameError| env_error(&name, &value, e)))
                .collect::<Result<_, _>>()?;
        }
        if let Some((_, value)) = var("CAPABILITIES") {
            self.capabilities = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some((_, value)) = var("TASKS_ROOT") {
            self.tasks_root = value;
        }
        if let Some((_, value)) = var("LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some((_, value)) = var("REPO") {
            self.repo = Some(PathBuf::from(value));
        }
        if let Some((_, value)) = var("REMOTE") {
            self.remote = value;
        }
        if let Some((_, value)) = var("AUTHOR_NAME") {
            self.author_name = value;
        }
        if let Some((_, value)) = var("AUTHOR_EMAIL") {
            self.author_email = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1".into());
        }
        if self.backoff_base_ms == 0 {
            return invalid("backoff_base_ms must be positive".into());
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return invalid(format!(
                "backoff_max_ms ({}) must be >= backoff_base_ms ({})",
                self.backoff_max_ms, self.backoff_base_ms
            ));
        }
        if self.heartbeat_interval_secs == 0 || self.reclaim_interval_secs == 0 || self.poll_interval_secs == 0 {
            return invalid("heartbeat, reclaim and poll intervals must be positive".into());
        }
        // one missed heartbeat must not be enough to lose a lease
        if self.lease_timeout_secs < self.heartbeat_interval_secs.saturating_mul(2) {
            return invalid(format!(
                "lease_timeout_secs ({}) must be at least twice heartbeat_interval_secs ({})",
                self.lease_timeout_secs, self.heartbeat_interval_secs
            ));
        }
        if self.remote.trim().is_empty() {
            return invalid("remote must not be empty".into());
        }
        if self.author_name.trim().is_empty() || self.author_email.trim().is_empty() {
            return invalid("author_name and author_email must not be empty".into());
        }
        Ok(())
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_max_ms),
            ),
            jitter: Jitter::Entropy,
        }
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.tasks_root.as_str())
    }
}

fn env_error(name: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Env {
        var: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: ToString,
{
    value.trim().parse().map_err(|e: T::Err| env_error(name, value, e))
}
