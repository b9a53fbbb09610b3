// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local working tree inspection.
//!
//! Determine the state of a local clone right before the resolver decides
//! what to do with it. Inspection is strictly read-only, so any number of
//! workers can inspect different paths at the same time.

use git2::{BranchType, ErrorCode, Repository, RepositoryState, Status, StatusOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Snapshot of a local path's Git state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LocalRepoState {
    pub exists: bool,
    pub is_git_repo: bool,
    pub has_uncommitted_changes: bool,

    /// Number of changed or untracked entries in the working tree.
    pub dirty_entries: usize,
    pub has_stash: bool,
    pub merge_in_progress: bool,
    pub rebase_in_progress: bool,

    /// Checked out branch, `None` if detached or unborn.
    pub current_branch: Option<String>,
    pub has_upstream: bool,
    pub ahead: usize,
    pub behind: usize,
}

impl LocalRepoState {
    /// State of a path that does not exist.
    pub fn missing() -> Self {
        Self::default()
    }

    /// State of a clean, up to date clone on the given branch.
    pub fn clean(branch: impl Into<String>) -> Self {
        Self {
            exists: true,
            is_git_repo: true,
            current_branch: Some(branch.into()),
            has_upstream: true,
            ..Self::default()
        }
    }

    /// Working tree has local edits, or an operation is half way done.
    pub fn is_dirty(&self) -> bool {
        self.has_uncommitted_changes || self.merge_in_progress || self.rebase_in_progress
    }
}

/// Inspect local path.
///
/// # Errors
///
/// - Return [`InspectError::NotAGitRepository`] if path exists but is not a
///   Git working tree.
/// - Return [`InspectError::Git2`] if libgit2 cannot read repository state.
#[instrument(skip(path), fields(path = %path.as_ref().display()), level = "debug")]
pub fn inspect(path: impl AsRef<Path>) -> Result<LocalRepoState> {
    let path = path.as_ref();
    if !path.exists() {
        debug!("nothing at {}", path.display());
        return Ok(LocalRepoState::missing());
    }

    let mut repository = match Repository::open(path) {
        Ok(repository) if !repository.is_bare() => repository,
        Ok(_) => return Err(InspectError::NotAGitRepository(path.to_path_buf())),
        Err(err) if err.code() == ErrorCode::NotFound => {
            return Err(InspectError::NotAGitRepository(path.to_path_buf()))
        }
        Err(err) => return Err(err.into()),
    };

    // INVARIANT: Repository must be rooted exactly at target path.
    //   - Opening a subdirectory of some other clone must not count.
    if let Some(workdir) = repository.workdir() {
        if !same_path(workdir, path) {
            return Err(InspectError::NotAGitRepository(path.to_path_buf()));
        }
    }

    let mut state = LocalRepoState {
        exists: true,
        is_git_repo: true,
        ..LocalRepoState::default()
    };

    state.dirty_entries = count_dirty_entries(&repository)?;
    state.has_uncommitted_changes = state.dirty_entries > 0;

    match repository.state() {
        RepositoryState::Merge
        | RepositoryState::Revert
        | RepositoryState::RevertSequence
        | RepositoryState::CherryPick
        | RepositoryState::CherryPickSequence => state.merge_in_progress = true,
        RepositoryState::Rebase
        | RepositoryState::RebaseInteractive
        | RepositoryState::RebaseMerge
        | RepositoryState::ApplyMailbox
        | RepositoryState::ApplyMailboxOrRebase => state.rebase_in_progress = true,
        RepositoryState::Clean | RepositoryState::Bisect => {}
    }

    let mut has_stash = false;
    repository.stash_foreach(|_, _, _| {
        has_stash = true;
        false
    })?;
    state.has_stash = has_stash;

    if let Some((branch, tracking)) = branch_tracking(&repository)? {
        state.current_branch = Some(branch);
        if let Some((ahead, behind)) = tracking {
            state.has_upstream = true;
            state.ahead = ahead;
            state.behind = behind;
        }
    }

    debug!(?state, "inspected");
    Ok(state)
}

/// Count changed, staged, and untracked entries. Ignored files do not count.
pub(crate) fn count_dirty_entries(repository: &Repository) -> Result<usize, git2::Error> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .include_ignored(false)
        .recurse_untracked_dirs(false)
        .exclude_submodules(true);

    let statuses = repository.statuses(Some(&mut opts))?;
    Ok(statuses
        .iter()
        .filter(|entry| {
            let status = entry.status();
            status != Status::CURRENT && !status.contains(Status::IGNORED)
        })
        .count())
}

/// Current branch name with `(ahead, behind)` against its upstream.
fn branch_tracking(repository: &Repository) -> Result<Option<(String, Option<(usize, usize)>)>> {
    let head = match repository.head() {
        Ok(head) => head,
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
            return Ok(None)
        }
        Err(err) => return Err(err.into()),
    };

    if !head.is_branch() {
        return Ok(None);
    }

    let Some(name) = head.shorthand().map(str::to_owned) else {
        return Ok(None);
    };

    let branch = repository.find_branch(&name, BranchType::Local)?;
    let upstream = match branch.upstream() {
        Ok(upstream) => upstream,
        Err(err) if err.code() == ErrorCode::NotFound => return Ok(Some((name, None))),
        Err(err) => return Err(err.into()),
    };

    let tracking = match (head.target(), upstream.get().target()) {
        (Some(local), Some(remote)) => Some(repository.graph_ahead_behind(local, remote)?),
        _ => None,
    };

    Ok(Some((name, tracking)))
}

fn same_path(left: &Path, right: &Path) -> bool {
    match (left.canonicalize(), right.canonicalize()) {
        (Ok(left), Ok(right)) => left == right,
        _ => left.components().eq(right.components()),
    }
}

/// Local state inspection error types.
#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    /// Path exists, but holds no Git working tree.
    #[error("path {:?} exists but is not a git repository", .0.display())]
    NotAGitRepository(PathBuf),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
type Result<T, E = InspectError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{RepositoryInitOptions, Signature};
    use pretty_assertions::assert_eq;
    use std::fs::write;

    fn init_with_commit(path: &Path) -> anyhow::Result<Repository> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repository = Repository::init_opts(path, &opts)?;
        write(path.join("README"), "hello\n")?;
        {
            let mut index = repository.index()?;
            index.add_path(Path::new("README"))?;
            index.write()?;
            let tree = repository.find_tree(index.write_tree()?)?;
            let signature = Signature::now("John Doe", "john@doe.com")?;
            repository.commit(Some("HEAD"), &signature, &signature, "init", &tree, &[])?;
        }
        Ok(repository)
    }

    #[test]
    fn missing_path_reports_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let state = inspect(dir.path().join("nope"))?;
        assert_eq!(state, LocalRepoState::missing());
        Ok(())
    }

    #[test]
    fn plain_directory_is_not_a_repository() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let result = inspect(dir.path());
        assert!(matches!(result, Err(InspectError::NotAGitRepository(_))));
        Ok(())
    }

    #[test]
    fn subdirectory_of_clone_is_not_a_repository() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        init_with_commit(dir.path())?;
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested)?;
        assert!(matches!(
            inspect(&nested),
            Err(InspectError::NotAGitRepository(_))
        ));
        Ok(())
    }

    #[test]
    fn clean_clone_without_upstream() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        init_with_commit(dir.path())?;

        let state = inspect(dir.path())?;
        assert_eq!(
            state,
            LocalRepoState {
                exists: true,
                is_git_repo: true,
                current_branch: Some("main".into()),
                ..LocalRepoState::default()
            }
        );
        assert!(!state.is_dirty());
        Ok(())
    }

    #[test]
    fn untracked_and_modified_files_make_dirty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        init_with_commit(dir.path())?;
        write(dir.path().join("README"), "changed\n")?;
        write(dir.path().join("notes.txt"), "scratch\n")?;

        let state = inspect(dir.path())?;
        assert!(state.has_uncommitted_changes);
        assert_eq!(state.dirty_entries, 2);
        assert!(state.is_dirty());
        Ok(())
    }

    #[test]
    fn stash_is_detected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut repository = init_with_commit(dir.path())?;
        write(dir.path().join("README"), "stash me\n")?;
        let signature = Signature::now("John Doe", "john@doe.com")?;
        repository.stash_save(&signature, "wip", None)?;

        let state = inspect(dir.path())?;
        assert!(state.has_stash);
        assert!(!state.has_uncommitted_changes);
        Ok(())
    }

    #[test]
    fn merge_head_marks_merge_in_progress() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let repository = init_with_commit(dir.path())?;
        let head = repository.head()?.target().map(|oid| oid.to_string());
        write(
            dir.path().join(".git").join("MERGE_HEAD"),
            format!("{}\n", head.unwrap_or_default()),
        )?;

        let state = inspect(dir.path())?;
        assert!(state.merge_in_progress);
        assert!(state.is_dirty());
        Ok(())
    }
}
