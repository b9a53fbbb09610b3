// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Run orchestration.
//!
//! Tie every piece together for one synchronization run: list, filter, plan,
//! schedule, and report. Only invalid configuration and directory provider
//! errors abort a run. Everything that goes wrong with a single repository
//! ends up in the report instead.

use crate::{
    checkpoint::CheckpointStore,
    config::{ConfigError, RunConfig},
    filter::filter,
    git::GitBackend,
    model::{RepoKey, RepositoryDescriptor, SyncTask},
    provider::{DirectoryProvider, ListHints, ProviderError},
    report::{Report, ReportError, Reporter},
    scheduler::Scheduler,
};

use std::{collections::HashSet, path::PathBuf, sync::Arc};
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Run one synchronization pass.
///
/// Provider calls happen before any task is scheduled, so time spent
/// listing never counts against task deadlines.
///
/// # Errors
///
/// - Return [`EngineError::Config`] if configuration is invalid.
/// - Return [`EngineError::Target`] if sync target cannot be created.
/// - Return [`EngineError::Provider`] if any organization cannot be listed.
/// - Return [`EngineError::Report`] if progress reporting cannot start.
#[instrument(skip_all, fields(target = %config.target.display()), level = "debug")]
pub async fn run<P, B>(
    config: RunConfig,
    provider: Arc<P>,
    backend: Arc<B>,
    cancel: CancellationToken,
) -> Result<Report>
where
    P: DirectoryProvider,
    B: GitBackend,
{
    config.validate()?;
    tokio::fs::create_dir_all(&config.target)
        .await
        .map_err(|source| EngineError::Target {
            path: config.target.clone(),
            source,
        })?;
    let config = Arc::new(config);

    let listed = list_all(provider, &config).await?;
    let listed_count = listed.len();
    let kept = filter(listed, &config.filter);
    info!("{} of {listed_count} repositories pass filters", kept.len());

    let tasks = plan(kept, &config);
    let target = config.target.clone();
    let resume = config.resume;
    let checkpoint = spawn_blocking(move || CheckpointStore::open(target, resume)).await?;

    let stream = Scheduler::new(backend, config.clone(), checkpoint, cancel).submit(tasks);
    let reporter = Reporter::new(stream.total(), config.show_progress)?;
    Ok(reporter.consume(stream).await)
}

async fn list_all<P: DirectoryProvider>(
    provider: Arc<P>,
    config: &RunConfig,
) -> Result<Vec<RepositoryDescriptor>> {
    let hints = ListHints::from(&config.filter);
    let organizations = if config.organizations.is_empty() {
        vec![String::new()]
    } else {
        config.organizations.clone()
    };

    let mut descriptors = Vec::new();
    for organization in organizations {
        let provider = provider.clone();
        let org = organization.clone();
        let listed = spawn_blocking(move || provider.list_repositories(&org, &hints))
            .await?
            .map_err(|source| EngineError::Provider {
                organization: organization.clone(),
                source,
            })?;
        info!(
            "listed {} repositories for {}",
            listed.len(),
            if organization.is_empty() { "all organizations" } else { organization.as_str() }
        );
        descriptors.extend(listed);
    }

    Ok(descriptors)
}

/// Turn descriptors into tasks.
///
/// Descriptors that cannot map onto a local path, or that repeat a key seen
/// earlier, are dropped with a warning.
pub fn plan(descriptors: Vec<RepositoryDescriptor>, config: &RunConfig) -> Vec<SyncTask> {
    let mut seen: HashSet<RepoKey> = HashSet::new();
    let mut tasks = Vec::with_capacity(descriptors.len());

    for descriptor in descriptors {
        let key = descriptor.key();
        if !seen.insert(key.clone()) {
            warn!("{key} listed more than once, keeping first entry");
            continue;
        }

        let strategy = config.strategy_for(&key);
        match SyncTask::new(descriptor, &config.target, strategy) {
            Ok(task) => tasks.push(task),
            Err(err) => warn!("skip {key}: {err}"),
        }
    }

    tasks
}

/// Engine error types.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Sync target directory cannot be created.
    #[error("cannot create target directory {:?}", path.display())]
    Target {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory provider fails.
    #[error("cannot list repositories of {organization:?}")]
    Provider {
        organization: String,
        #[source]
        source: ProviderError,
    },

    /// Reporting cannot start.
    #[error(transparent)]
    Report(#[from] ReportError),

    /// Background task died.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Friendly result alias :3
type Result<T, E = EngineError> = std::result::Result<T, E>;
