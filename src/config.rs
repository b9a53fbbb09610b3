// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Run configuration.
//!
//! A run is driven by one immutable [`RunConfig`], built in three layers:
//! built-in defaults, then an optional [`Settings`] file, then command line
//! flags. Later layers win. The engine only ever sees the final value.
//!
//! # Settings Layout
//!
//! ```toml
//! strategy = "pull"
//! parallel = 8
//! target = "~/fleet"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//! multiplier = 2.0
//! max_delay_ms = 30000
//!
//! [timeouts]
//! task_secs = 600
//! grace_secs = 10
//!
//! [overrides]
//! "github:acme/monorepo" = "fetch"
//! ```

use crate::{
    filter::{FilterError, FilterSpec},
    model::{RepoKey, SyncStrategy},
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::debug;

/// Default number of concurrent workers.
pub const DEFAULT_PARALLEL: usize = 4;

/// Settings file layout.
///
/// Every field is optional, so a settings file only needs to mention what it
/// wants to change.
#[derive(Default, Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Default strategy for existing repositories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<SyncStrategy>,

    /// Number of concurrent workers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel: Option<usize>,

    /// Default sync target directory. Shell expanded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,

    pub retry: RetrySettings,
    pub timeouts: TimeoutSettings,

    /// Per-repository strategy, keyed by `provider:org/name`.
    pub overrides: BTreeMap<String, SyncStrategy>,
}

/// Retry section of settings file.
#[derive(Default, Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

/// Timeout section of settings file.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSettings {
    /// Per-task deadline in seconds, zero disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_secs: Option<u64>,

    /// Grace period for in-flight tasks after cancellation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_secs: Option<u64>,
}

impl Settings {
    /// Load settings file.
    ///
    /// A missing file yields default settings unless `required` is set.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Io`] if file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file is not valid TOML.
    /// - Return [`ConfigError::ShellExpansion`] if target cannot be expanded.
    pub fn load(path: impl AsRef<Path>, required: bool) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(data) => {
                debug!("load settings from {}", path.display());
                data.parse()
            }
            Err(err) if err.kind() == ErrorKind::NotFound && !required => {
                debug!("no settings at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on target field.
        if let Some(target) = settings.target.take() {
            settings.target = Some(PathBuf::from(
                shellexpand::full(target.to_string_lossy().as_ref())
                    .map_err(ConfigError::ShellExpansion)?
                    .into_owned(),
            ));
        }

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Exponential backoff policy for transient failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt`, counting from 1.
    ///
    /// Computed as `base * multiplier^(attempt - 1)`, capped at max delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(secs)
    }
}

/// Fully resolved configuration of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root directory for local clones.
    pub target: PathBuf,

    /// Organizations to list, empty means everything the provider knows.
    pub organizations: Vec<String>,
    pub strategy: SyncStrategy,
    pub overrides: BTreeMap<RepoKey, SyncStrategy>,
    pub parallel: usize,
    pub resume: bool,
    pub force: bool,
    pub dry_run: bool,

    /// Draw progress bar while running.
    pub show_progress: bool,
    pub filter: FilterSpec,
    pub retry: RetryPolicy,

    /// Deadline covering every attempt of one task, `None` disables it.
    pub task_timeout: Option<Duration>,

    /// Time in-flight tasks get to finish after cancellation.
    pub grace_period: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target: PathBuf::from("."),
            organizations: Vec::new(),
            strategy: SyncStrategy::default(),
            overrides: BTreeMap::new(),
            parallel: DEFAULT_PARALLEL,
            resume: false,
            force: false,
            dry_run: false,
            show_progress: false,
            filter: FilterSpec::default(),
            retry: RetryPolicy::default(),
            task_timeout: Some(Duration::from_secs(600)),
            grace_period: Duration::from_secs(10),
        }
    }
}

impl RunConfig {
    /// Layer settings file on top of current values.
    pub fn apply_settings(&mut self, settings: Settings) {
        if let Some(strategy) = settings.strategy {
            self.strategy = strategy;
        }

        if let Some(parallel) = settings.parallel {
            self.parallel = parallel;
        }

        if let Some(target) = settings.target {
            self.target = target;
        }

        let retry = settings.retry;
        if let Some(max_attempts) = retry.max_attempts {
            self.retry.max_attempts = max_attempts;
        }

        if let Some(base) = retry.base_delay_ms {
            self.retry.base_delay = Duration::from_millis(base);
        }

        if let Some(multiplier) = retry.multiplier {
            self.retry.multiplier = multiplier;
        }

        if let Some(max) = retry.max_delay_ms {
            self.retry.max_delay = Duration::from_millis(max);
        }

        if let Some(secs) = settings.timeouts.task_secs {
            self.task_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(secs) = settings.timeouts.grace_secs {
            self.grace_period = Duration::from_secs(secs);
        }

        self.overrides.extend(
            settings
                .overrides
                .into_iter()
                .map(|(key, strategy)| (RepoKey::from(key), strategy)),
        );
    }

    /// Strategy for repository, honoring per-repository overrides.
    pub fn strategy_for(&self, key: &RepoKey) -> SyncStrategy {
        self.overrides.get(key).copied().unwrap_or(self.strategy)
    }

    /// Reject configurations that cannot drive a run.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Invalid`] naming the first offending value.
    pub fn validate(&self) -> Result<()> {
        if self.parallel == 0 {
            return Err(ConfigError::Invalid("parallel must be at least 1".into()));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max attempts must be at least 1".into(),
            ));
        }

        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry multiplier must be at least 1, got {}",
                self.retry.multiplier
            )));
        }

        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::Invalid(
                "max retry delay must not be shorter than base delay".into(),
            ));
        }

        if self.target.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("target directory is empty".into()));
        }

        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Failed to read settings file.
    #[error("cannot read settings file {:?}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Filter specification is invalid.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
