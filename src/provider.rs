// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository directory providers.
//!
//! A provider answers one question: which repositories belong to an
//! organization? Hosting platform adapters live behind the
//! [`DirectoryProvider`] trait, and own their pagination, rate limiting, and
//! retries. The engine calls each provider once per organization and treats
//! any error as fatal.
//!
//! The only built-in provider is [`ManifestProvider`], which reads a JSON
//! array of descriptors from disk.

use crate::{
    filter::{FilterSpec, Inclusion},
    model::RepositoryDescriptor,
};

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Listing hints derived from the filter specification.
///
/// Adapters may use these to ask their platform for less data. Ignoring
/// them is always correct, because the filter engine runs afterwards anyway.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListHints {
    pub archived: Inclusion,
    pub fork: Inclusion,
}

impl From<&FilterSpec> for ListHints {
    fn from(spec: &FilterSpec) -> Self {
        Self {
            archived: spec.archived,
            fork: spec.fork,
        }
    }
}

/// Layer of indirection for repository listing.
pub trait DirectoryProvider: Send + Sync + 'static {
    /// List repositories of an organization.
    ///
    /// An empty organization name means every repository the provider
    /// knows about.
    fn list_repositories(
        &self,
        organization: &str,
        hints: &ListHints,
    ) -> Result<Vec<RepositoryDescriptor>>;
}

/// Provider backed by a JSON manifest of descriptors.
#[derive(Debug, Default, Clone)]
pub struct ManifestProvider {
    descriptors: Vec<RepositoryDescriptor>,
}

impl ManifestProvider {
    /// Construct provider over descriptors already in memory.
    pub fn new(descriptors: impl IntoIterator<Item = RepositoryDescriptor>) -> Self {
        Self {
            descriptors: descriptors.into_iter().collect(),
        }
    }

    /// Read manifest file.
    ///
    /// # Errors
    ///
    /// - Return [`ProviderError::Io`] if manifest cannot be read.
    /// - Return [`ProviderError::Parse`] if manifest is not a JSON array of
    ///   descriptors.
    #[instrument(skip(path), level = "debug")]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ProviderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let descriptors: Vec<RepositoryDescriptor> =
            serde_json::from_str(&data).map_err(|source| ProviderError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("manifest {} lists {} repositories", path.display(), descriptors.len());

        Ok(Self { descriptors })
    }
}

impl DirectoryProvider for ManifestProvider {
    fn list_repositories(
        &self,
        organization: &str,
        hints: &ListHints,
    ) -> Result<Vec<RepositoryDescriptor>> {
        Ok(self
            .descriptors
            .iter()
            .filter(|descriptor| {
                organization.is_empty() || descriptor.organization.eq_ignore_ascii_case(organization)
            })
            .filter(|descriptor| hints.archived.allows_flagged() || !descriptor.archived)
            .filter(|descriptor| hints.fork.allows_flagged() || !descriptor.fork)
            .cloned()
            .collect())
    }
}

/// Directory provider error types.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Manifest cannot be read.
    #[error("cannot read manifest {:?}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest is malformed.
    #[error("cannot parse manifest {:?}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Hosting platform refuses to answer.
    #[error("directory listing for {organization:?} failed: {message}")]
    Listing {
        organization: String,
        message: String,
    },
}

/// Friendly result alias :3
type Result<T, E = ProviderError> = std::result::Result<T, E>;
