// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Core data model of a synchronization run.
//!
//! A run starts from a list of [`RepositoryDescriptor`]s handed over by a
//! directory provider. Each surviving descriptor becomes one [`SyncTask`],
//! which is resolved into exactly one [`Action`] and ends in exactly one
//! terminal [`Status`] carried by a [`SyncResult`].
//!
//! # Task Lifecycle
//!
//! Tasks move from pending, to running, to one terminal state. Workers take
//! ownership of a task and hand back a single result, so a terminal state can
//! never be revisited once recorded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Component, Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Platform-agnostic metadata for one remote repository.
///
/// Snapshot taken once per run. The engine never writes descriptors back
/// out anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    /// Hosting platform name, e.g., "github" or "gitlab".
    pub provider: String,

    /// Organization, group, or user owning the repository.
    pub organization: String,

    /// Repository name.
    pub name: String,

    /// URL to clone from.
    pub clone_url: String,

    /// Default branch of the remote, if known.
    #[serde(default)]
    pub default_branch: Option<String>,

    /// Primary language reported by the platform.
    #[serde(default)]
    pub language: Option<String>,

    /// Topic labels attached to the repository.
    #[serde(default)]
    pub topics: BTreeSet<String>,

    /// Star count.
    #[serde(default)]
    pub stars: u64,

    /// Repository size in kilobytes.
    #[serde(default)]
    pub size_kb: u64,

    #[serde(default)]
    pub archived: bool,

    #[serde(default)]
    pub fork: bool,

    #[serde(default)]
    pub private: bool,

    /// Last time the remote was updated.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RepositoryDescriptor {
    /// Construct minimal descriptor with every optional field left empty.
    pub fn new(
        provider: impl Into<String>,
        organization: impl Into<String>,
        name: impl Into<String>,
        clone_url: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            organization: organization.into(),
            name: name.into(),
            clone_url: clone_url.into(),
            default_branch: None,
            language: None,
            topics: BTreeSet::new(),
            stars: 0,
            size_kb: 0,
            archived: false,
            fork: false,
            private: false,
            updated_at: None,
        }
    }

    /// Stable key of the form `provider:org/name`.
    pub fn key(&self) -> RepoKey {
        RepoKey(format!(
            "{}:{}/{}",
            self.provider, self.organization, self.name
        ))
    }

    /// Name qualified by its organization, i.e., `org/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.organization, self.name)
    }

    /// Path of the local clone relative to the sync target.
    ///
    /// Always `<provider>/<org>/<name>`, so every descriptor maps to exactly
    /// one local path.
    ///
    /// # Errors
    ///
    /// - Return [`ModelError::InvalidComponent`] if any component is empty,
    ///   a relative marker, or would escape its parent directory.
    pub fn relative_path(&self) -> Result<PathBuf> {
        let mut path = PathBuf::new();
        for (component, value) in [
            ("provider", &self.provider),
            ("organization", &self.organization),
            ("name", &self.name),
        ] {
            if !is_plain_component(value) {
                return Err(ModelError::InvalidComponent {
                    component,
                    value: value.clone(),
                });
            }
            path.push(value);
        }

        Ok(path)
    }
}

fn is_plain_component(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == value
    ) && !value.contains(['/', '\\'])
}

/// Stable repository key, `provider:org/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoKey(String);

impl RepoKey {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for RepoKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

impl From<String> for RepoKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl Display for RepoKey {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.0)
    }
}

/// User-selected policy for updating repositories that already exist.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Hard reset to remote tracking branch.
    Reset,

    /// Merge remote changes into current branch.
    #[default]
    Pull,

    /// Update remote tracking refs only.
    Fetch,

    /// Replay local commits on top of remote changes.
    Rebase,

    /// Remove and clone fresh.
    Clone,

    /// Leave existing repositories alone.
    Skip,
}

impl SyncStrategy {
    pub const ALL: [SyncStrategy; 6] = [
        Self::Reset,
        Self::Pull,
        Self::Fetch,
        Self::Rebase,
        Self::Clone,
        Self::Skip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Pull => "pull",
            Self::Fetch => "fetch",
            Self::Rebase => "rebase",
            Self::Clone => "clone",
            Self::Skip => "skip",
        }
    }
}

impl Display for SyncStrategy {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for SyncStrategy {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| ModelError::UnknownStrategy(value.to_owned()))
    }
}

/// Concrete operation resolved for one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Clone,
    Reset,
    Pull,
    Fetch,
    Rebase,
    Skip,
    ConflictManualRequired,
}

impl Action {
    /// Action may discard local work.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Clone | Self::Reset)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Reset => "reset",
            Self::Pull => "pull",
            Self::Fetch => "fetch",
            Self::Rebase => "rebase",
            Self::Skip => "skip",
            Self::ConflictManualRequired => "conflict-manual-required",
        }
    }
}

impl Display for Action {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Skipped,
    Conflict,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    /// Status counts as finished work that a resumed run can skip.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Unit of work for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
    pub key: RepoKey,
    pub descriptor: RepositoryDescriptor,
    pub strategy: SyncStrategy,
    pub path: PathBuf,
}

impl SyncTask {
    /// Construct new task rooted at sync target.
    ///
    /// # Errors
    ///
    /// - Return [`ModelError::InvalidComponent`] if the descriptor cannot be
    ///   mapped onto a local path.
    pub fn new(
        descriptor: RepositoryDescriptor,
        target: impl AsRef<Path>,
        strategy: SyncStrategy,
    ) -> Result<Self> {
        let path = target.as_ref().join(descriptor.relative_path()?);
        Ok(Self {
            key: descriptor.key(),
            descriptor,
            strategy,
            path,
        })
    }
}

/// Terminal outcome of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub key: RepoKey,
    pub path: PathBuf,
    pub status: Status,

    /// Resolved action, absent when the task never reached resolution.
    pub action: Option<Action>,

    /// One line, human-readable explanation.
    pub reason: String,
    pub duration: Duration,
    pub retries: u32,
}

/// Data model error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// Descriptor field cannot be used as a path component.
    #[error("invalid repository {component} {value:?}")]
    InvalidComponent {
        component: &'static str,
        value: String,
    },

    /// Strategy name not recognized.
    #[error("unknown strategy {0:?}, expected one of reset, pull, fetch, rebase, clone, skip")]
    UnknownStrategy(String),
}

/// Friendly result alias :3
type Result<T, E = ModelError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn descriptor_key_and_path() -> anyhow::Result<()> {
        let descriptor = RepositoryDescriptor::new("github", "acme", "api", "https://x/api.git");
        assert_eq!(descriptor.key().as_str(), "github:acme/api");
        assert_eq!(descriptor.full_name(), "acme/api");

        let task = SyncTask::new(descriptor, "/srv/fleet", SyncStrategy::Pull)?;
        assert_eq!(task.path, PathBuf::from("/srv/fleet/github/acme/api"));

        Ok(())
    }

    #[test]
    fn descriptor_path_rejects_escapes() {
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            let descriptor = RepositoryDescriptor::new("github", "acme", bad, "url");
            assert!(
                descriptor.relative_path().is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Rebase".parse::<SyncStrategy>(), Ok(SyncStrategy::Rebase));
        assert_eq!(" skip ".parse::<SyncStrategy>(), Ok(SyncStrategy::Skip));
        assert!("merge".parse::<SyncStrategy>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&Status::Conflict)?, "\"conflict\"");
        assert_eq!(
            serde_json::to_string(&Action::ConflictManualRequired)?,
            "\"conflict-manual-required\""
        );

        Ok(())
    }
}
