// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git execution seam.
//!
//! Every interaction the scheduler has with Git goes through the
//! [`GitBackend`] trait, so tests can swap in an in-memory backend while the
//! real binary uses [`Git2Backend`] built on top of libgit2.
//!
//! # Failure Classes
//!
//! Operations fail with an [`OperationError`], which tells the scheduler
//! whether an attempt may be retried:
//!
//! - [`OperationError::Transient`]: network hiccups, timeouts, rate limits.
//! - [`OperationError::Permanent`]: bad credentials, missing remotes, broken
//!   local paths.
//! - [`OperationError::Conflict`]: merge or rebase needs a human.
//! - [`OperationError::Cancelled`]: transfer aborted by cancellation.

use crate::{
    inspect::{count_dirty_entries, inspect, InspectError, LocalRepoState},
    model::Action,
};

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    BranchType, Config, ErrorClass, ErrorCode, FetchOptions, Oid, RebaseOptions,
    RemoteCallbacks, Repository, ResetType, Signature,
};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Request to run one executable action against a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub action: Action,
    pub path: PathBuf,
    pub clone_url: String,
    pub default_branch: Option<String>,
}

/// Layer of indirection for Git access.
pub trait GitBackend: Send + Sync + 'static {
    /// Inspect local state of a repository path.
    fn inspect(&self, path: &Path) -> Result<LocalRepoState, InspectError>;

    /// Run action, returning a one line summary of what happened.
    fn execute(&self, request: &ActionRequest, cancel: &CancellationToken) -> Result<String>;
}

/// Git access through libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct Git2Backend;

impl GitBackend for Git2Backend {
    fn inspect(&self, path: &Path) -> Result<LocalRepoState, InspectError> {
        inspect(path)
    }

    /// Run action through libgit2.
    ///
    /// # Errors
    ///
    /// - Return [`OperationError::Cancelled`] if token is raised before or
    ///   during a transfer.
    /// - Return [`OperationError::Conflict`] if a merge or rebase cannot be
    ///   applied cleanly. The working tree is rolled back first.
    /// - Return [`OperationError::Transient`] or [`OperationError::Permanent`]
    ///   for everything else, depending on the failure.
    #[instrument(skip(self, request, cancel), fields(action = %request.action, path = %request.path.display()), level = "debug")]
    fn execute(&self, request: &ActionRequest, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(OperationError::Cancelled);
        }

        let transfer = Transfer::load(cancel)?;
        match request.action {
            Action::Clone => clone(request, &transfer),
            Action::Fetch => {
                let repository = Repository::open(&request.path)?;
                transfer.fetch_origin(&repository)?;
                Ok("fetched origin".into())
            }
            Action::Reset => reset(request, &transfer),
            Action::Pull => pull(request, &transfer),
            Action::Rebase => rebase(request, &transfer),
            Action::Skip => Ok("nothing to do".into()),
            Action::ConflictManualRequired => Err(OperationError::Conflict(
                "local changes need manual resolution".into(),
            )),
        }
    }
}

/// Remote transfer settings shared by clone and fetch.
struct Transfer<'a> {
    authenticator: GitAuthenticator,
    config: Config,
    cancel: &'a CancellationToken,
}

impl<'a> Transfer<'a> {
    fn load(cancel: &'a CancellationToken) -> Result<Self> {
        let config = match Config::open_default() {
            Ok(config) => config,
            Err(err) => {
                warn!("cannot open git configuration, using empty one: {err}");
                Config::new()?
            }
        };

        Ok(Self {
            authenticator: GitAuthenticator::default()
                .try_password_prompt(0)
                .set_prompter(NonInteractivePrompter),
            config,
            cancel,
        })
    }

    fn fetch_options(&self) -> FetchOptions<'_> {
        let cancel = self.cancel;
        let mut rc = RemoteCallbacks::new();
        rc.credentials(self.authenticator.credentials(&self.config));
        rc.transfer_progress(move |_| !cancel.is_cancelled());
        rc.sideband_progress(move |_| !cancel.is_cancelled());

        let mut fo = FetchOptions::new();
        fo.remote_callbacks(rc);
        fo
    }

    fn fetch_origin(&self, repository: &Repository) -> Result<()> {
        let mut remote = repository.find_remote("origin")?;
        let mut fo = self.fetch_options();
        remote.fetch::<&str>(&[], Some(&mut fo), None)?;
        debug!("fetched {:?}", remote.url().unwrap_or_default());
        Ok(())
    }
}

/// Credential prompter that never asks anyone anything.
///
/// Workers run unattended in parallel, so credentials must come from
/// ssh-agent, default keys, or credential helpers.
#[derive(Debug, Default, Clone, Copy)]
struct NonInteractivePrompter;

impl Prompter for NonInteractivePrompter {
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        warn!("credentials required at {url}, but prompting is disabled");
        None
    }

    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        warn!("password required at {url} for user {username}, but prompting is disabled");
        None
    }

    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        warn!(
            "passphrase required for ssh key {}, but prompting is disabled",
            ssh_key_path.display()
        );
        None
    }
}

/// Clone into staging directory next to target, then swap it in.
fn clone(request: &ActionRequest, transfer: &Transfer<'_>) -> Result<String> {
    let parent = request.path.parent().ok_or_else(|| {
        OperationError::Permanent(format!("{} has no parent directory", request.path.display()))
    })?;
    fs::create_dir_all(parent)?;

    // INVARIANT: Failed clones leave nothing behind at the target path.
    //   - Staging directory is removed on drop no matter what happens.
    let staging = tempfile::Builder::new()
        .prefix(".fleetsync-clone-")
        .tempdir_in(parent)?;
    let checkout = staging.path().join("repo");

    let mut builder = RepoBuilder::new();
    builder.fetch_options(transfer.fetch_options());
    if let Some(branch) = &request.default_branch {
        builder.branch(branch);
    }

    info!("clone {} into {}", request.clone_url, request.path.display());
    let repository = builder.clone(&request.clone_url, &checkout)?;
    let head = repository
        .head()
        .ok()
        .and_then(|head| head.shorthand().map(str::to_owned));
    drop(repository);

    if let Ok(meta) = fs::symlink_metadata(&request.path) {
        if meta.is_dir() {
            fs::remove_dir_all(&request.path)?;
        } else {
            fs::remove_file(&request.path)?;
        }
    }
    fs::rename(&checkout, &request.path)?;

    Ok(match head {
        Some(branch) => format!("cloned {branch}"),
        None => "cloned empty repository".into(),
    })
}

fn reset(request: &ActionRequest, transfer: &Transfer<'_>) -> Result<String> {
    let repository = Repository::open(&request.path)?;
    transfer.fetch_origin(&repository)?;

    let (upstream, oid) = upstream_target(&repository, request.default_branch.as_deref())?;
    let commit = repository.find_commit(oid)?;
    repository.reset(commit.as_object(), ResetType::Hard, None)?;
    repository.cleanup_state()?;

    Ok(format!("reset to {upstream} at {}", short(oid)))
}

fn pull(request: &ActionRequest, transfer: &Transfer<'_>) -> Result<String> {
    let repository = Repository::open(&request.path)?;
    transfer.fetch_origin(&repository)?;

    let (upstream, oid) = upstream_target(&repository, request.default_branch.as_deref())?;
    let incoming = repository.find_annotated_commit(oid)?;
    let (analysis, _) = repository.merge_analysis(&[&incoming])?;

    if analysis.is_up_to_date() {
        return Ok(format!("already up to date with {upstream}"));
    }

    ensure_clean(&repository)?;
    if analysis.is_fast_forward() || analysis.is_unborn() {
        fast_forward(&repository, oid, &upstream)?;
        return Ok(format!("fast-forwarded to {upstream} at {}", short(oid)));
    }

    repository.merge(&[&incoming], None, None)?;
    let mut index = repository.index()?;
    if index.has_conflicts() {
        // INVARIANT: Tree was clean right before merging.
        //   - Hard reset only undoes what the merge itself wrote.
        let head = repository.head()?.peel_to_commit()?;
        repository.reset(head.as_object(), ResetType::Hard, None)?;
        repository.cleanup_state()?;
        return Err(OperationError::Conflict(format!(
            "merge with {upstream} conflicts; resolve manually"
        )));
    }

    let tree = repository.find_tree(index.write_tree()?)?;
    let signature = signature(&repository)?;
    let local = repository.head()?.peel_to_commit()?;
    let remote = repository.find_commit(oid)?;
    let merged = repository.commit(
        Some("HEAD"),
        &signature,
        &signature,
        &format!("Merge {upstream}"),
        &tree,
        &[&local, &remote],
    )?;
    repository.cleanup_state()?;

    Ok(format!("merged {upstream} at {}", short(merged)))
}

fn rebase(request: &ActionRequest, transfer: &Transfer<'_>) -> Result<String> {
    let repository = Repository::open(&request.path)?;
    transfer.fetch_origin(&repository)?;

    let (upstream, oid) = upstream_target(&repository, request.default_branch.as_deref())?;
    let onto = repository.find_annotated_commit(oid)?;
    let (analysis, _) = repository.merge_analysis(&[&onto])?;

    if analysis.is_up_to_date() {
        return Ok(format!("already up to date with {upstream}"));
    }

    ensure_clean(&repository)?;
    if analysis.is_fast_forward() || analysis.is_unborn() {
        fast_forward(&repository, oid, &upstream)?;
        return Ok(format!("fast-forwarded to {upstream} at {}", short(oid)));
    }

    let signature = signature(&repository)?;
    let mut opts = RebaseOptions::new();
    let mut rebase = repository.rebase(None, Some(&onto), None, Some(&mut opts))?;
    let mut replayed = 0usize;

    while let Some(operation) = rebase.next() {
        let applied = operation.and_then(|_| {
            if repository.index()?.has_conflicts() {
                return Err(git2::Error::new(
                    ErrorCode::Unmerged,
                    ErrorClass::Rebase,
                    "conflicts while replaying commit",
                ));
            }

            match rebase.commit(None, &signature, None) {
                Ok(_) => Ok(()),
                Err(err) if err.code() == ErrorCode::Applied => Ok(()),
                Err(err) => Err(err),
            }
        });

        if let Err(err) = applied {
            rebase.abort()?;
            return match OperationError::from(err) {
                OperationError::Conflict(_) => Err(OperationError::Conflict(format!(
                    "rebase onto {upstream} conflicts; resolve manually"
                ))),
                other => Err(other),
            };
        }
        replayed += 1;
    }
    rebase.finish(Some(&signature))?;

    Ok(format!("rebased {replayed} commit(s) onto {upstream}"))
}

/// Refuse to continue if working tree picked up changes since inspection.
fn ensure_clean(repository: &Repository) -> Result<()> {
    match count_dirty_entries(repository)? {
        0 => Ok(()),
        1 => Err(OperationError::Conflict(
            "1 uncommitted file; resolve manually".into(),
        )),
        count => Err(OperationError::Conflict(format!(
            "{count} uncommitted files; resolve manually"
        ))),
    }
}

fn fast_forward(repository: &Repository, oid: Oid, upstream: &str) -> Result<()> {
    let head = repository.find_reference("HEAD")?;
    let refname = head
        .symbolic_target()
        .map(str::to_owned)
        .ok_or_else(|| OperationError::Permanent("HEAD is detached".into()))?;

    // INVARIANT: Working tree moves before the branch does.
    //   - Safe checkout never overwrites local changes, so a refusal leaves
    //     both branch and working tree untouched.
    let target = repository.find_commit(oid)?;
    let mut checkout = CheckoutBuilder::new();
    checkout.safe();
    if let Err(err) = repository.checkout_tree(target.as_object(), Some(&mut checkout)) {
        return Err(match err.code() {
            ErrorCode::Conflict => OperationError::Conflict(format!(
                "local changes would be overwritten by {upstream}; resolve manually"
            )),
            _ => err.into(),
        });
    }

    match repository.find_reference(&refname) {
        Ok(mut reference) => {
            reference.set_target(oid, "fleetsync: fast-forward")?;
        }
        Err(err) if err.code() == ErrorCode::NotFound => {
            repository.reference(&refname, oid, true, "fleetsync: fast-forward")?;
        }
        Err(err) => return Err(err.into()),
    }

    repository.set_head(&refname)?;

    Ok(())
}

/// Remote tracking target for current branch.
///
/// Use configured upstream of current branch, otherwise fall back to
/// `origin/<default_branch>`, and finally `origin/HEAD`.
fn upstream_target(repository: &Repository, default_branch: Option<&str>) -> Result<(String, Oid)> {
    if let Ok(head) = repository.head() {
        if let Some(name) = head.is_branch().then(|| head.shorthand()).flatten() {
            let branch = repository.find_branch(name, BranchType::Local)?;
            if let Ok(upstream) = branch.upstream() {
                let label = upstream.name()?.unwrap_or("upstream").to_owned();
                if let Some(oid) = upstream.get().target() {
                    return Ok((label, oid));
                }
            }
        }
    }

    let mut candidates = Vec::new();
    if let Some(branch) = default_branch {
        candidates.push(format!("origin/{branch}"));
    }
    candidates.push("origin/HEAD".into());

    for candidate in candidates {
        if let Ok(oid) = repository.refname_to_id(&format!("refs/remotes/{candidate}")) {
            return Ok((candidate, oid));
        }
    }

    Err(OperationError::Permanent(
        "no upstream branch to synchronize with".into(),
    ))
}

fn signature(repository: &Repository) -> Result<Signature<'static>> {
    match repository.signature() {
        Ok(signature) => Ok(signature),
        Err(_) => Ok(Signature::now("fleetsync", "fleetsync@localhost")?),
    }
}

fn short(oid: Oid) -> String {
    let mut text = oid.to_string();
    text.truncate(7);
    text
}

const TRANSIENT_MARKERS: [&str; 9] = [
    "timed out",
    "timeout",
    "rate limit",
    "connection",
    "temporary",
    "temporarily",
    "try again",
    "too many requests",
    "early eof",
];

const PERMANENT_MARKERS: [&str; 8] = [
    "authentication",
    "not found",
    "access denied",
    "permission denied",
    "does not exist",
    "could not read from remote",
    "invalid",
    "unsupported url",
];

/// Classify failure message into a failure class.
///
/// Permanent markers win over transient ones, so that "authentication
/// failed after connection reset" is never retried. HTTP status codes only
/// decide when no marker matches.
pub fn classify_message(message: &str) -> Option<FailureClass> {
    let lower = message.to_ascii_lowercase();
    if PERMANENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return Some(FailureClass::Permanent);
    }

    if TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return Some(FailureClass::Transient);
    }

    http_status_class(&lower)
}

/// Classify HTTP status codes mentioned in a lowercase message.
///
/// 429 and 5xx may clear up on their own. Any other 4xx will not.
fn http_status_class(message: &str) -> Option<FailureClass> {
    if !(message.contains("status") || message.contains("http") || message.contains("code")) {
        return None;
    }

    let codes: Vec<u16> = message
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|digits| digits.parse::<u16>().ok())
        .filter(|code| (400..600).contains(code))
        .collect();

    if codes.iter().any(|&code| code == 429 || code >= 500) {
        Some(FailureClass::Transient)
    } else if codes.is_empty() {
        None
    } else {
        Some(FailureClass::Permanent)
    }
}

/// Coarse failure class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// Git operation error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// Failure that may go away on another attempt.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Failure that will not go away by retrying.
    #[error("{0}")]
    Permanent(String),

    /// Merge or rebase needs manual resolution.
    #[error("{0}")]
    Conflict(String),

    /// Operation aborted through cancellation.
    #[error("cancelled")]
    Cancelled,
}

impl OperationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<git2::Error> for OperationError {
    fn from(err: git2::Error) -> Self {
        let message = err.message().to_owned();
        match err.code() {
            ErrorCode::User => return Self::Cancelled,
            ErrorCode::Conflict | ErrorCode::MergeConflict | ErrorCode::Unmerged => {
                return Self::Conflict(message)
            }
            ErrorCode::Auth | ErrorCode::Certificate | ErrorCode::NotFound => {
                return Self::Permanent(message)
            }
            ErrorCode::Locked => return Self::Transient(message),
            _ => {}
        }

        match classify_message(&message) {
            Some(FailureClass::Permanent) => Self::Permanent(message),
            Some(FailureClass::Transient) => Self::Transient(message),
            None if matches!(err.class(), ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh) => {
                Self::Transient(message)
            }
            None => Self::Permanent(message),
        }
    }
}

impl From<std::io::Error> for OperationError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                Self::Transient(err.to_string())
            }
            _ => Self::Permanent(err.to_string()),
        }
    }
}

/// Friendly result alias :3
type Result<T, E = OperationError> = std::result::Result<T, E>;
