// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT


use fleetsync::{config::RetryPolicy, ManifestProvider, RepositoryDescriptor, RunConfig};

use anyhow::Result;
use git2::{IndexEntry, IndexTime, Repository, RepositoryInitOptions};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::TempDir;

/// Bare repository standing in for a hosted remote.
pub(crate) struct RepoFixture {
    repo: Repository,
    path: PathBuf,
}

impl RepoFixture {
    pub(crate) fn new(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        opts.bare(true);
        let repo = Repository::init_opts(path.as_ref(), &opts)?;

        // INVARIANT: Always provide valid name and email.
        //   - Git will complain if this is not set in CI/CD environments.
        let mut config = repo.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        Ok(Self {
            repo,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub(crate) fn url(&self) -> String {
        self.path.display().to_string()
    }

    pub(crate) fn stage_and_commit(
        &self,
        filename: impl AsRef<Path>,
        contents: impl AsRef<str>,
    ) -> Result<()> {
        let entry = IndexEntry {
            ctime: IndexTime::new(0, 0),
            mtime: IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            file_size: contents.as_ref().len() as u32,
            id: self.repo.blob(contents.as_ref().as_bytes())?,
            flags: 0,
            flags_extended: 0,
            path: filename
                .as_ref()
                .as_os_str()
                .to_string_lossy()
                .into_owned()
                .into_bytes(),
        };

        // INVARIANT: Always use new tree produced by index after staging new entry.
        let mut index = self.repo.index()?;
        index.add_frombuffer(&entry, contents.as_ref().as_bytes())?;
        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;

        // INVARIANT: Always determine latest parent commits to append to.
        let signature = self.repo.signature()?;
        let mut parents = Vec::new();
        if let Some(parent) = self.repo.head().ok().and_then(|head| head.target()) {
            parents.push(self.repo.find_commit(parent)?);
        }
        let parents = parents.iter().collect::<Vec<_>>();

        // INVARIANT: Commit to HEAD by appending to obtained parent commits.
        self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            format!("chore: add {:?}", filename.as_ref()).as_ref(),
            &tree,
            &parents,
        )?;

        Ok(())
    }
}

/// Set of remotes plus a sync target, all inside one temporary directory.
pub(crate) struct FleetFixture {
    root: TempDir,
    remotes: Vec<(String, RepoFixture)>,
}

impl FleetFixture {
    pub(crate) fn new(names: &[&str]) -> Result<Self> {
        let root = tempfile::tempdir()?;
        let mut remotes = Vec::new();
        for name in names {
            let remote = RepoFixture::new(root.path().join("remotes").join(format!("{name}.git")))?;
            remote.stage_and_commit("README", format!("# {name}\n"))?;
            remotes.push((name.to_string(), remote));
        }

        Ok(Self { root, remotes })
    }

    pub(crate) fn target(&self) -> PathBuf {
        self.root.path().join("fleet")
    }

    pub(crate) fn local_path(&self, name: &str) -> PathBuf {
        self.target().join("local").join("acme").join(name)
    }

    pub(crate) fn remote(&self, name: &str) -> Result<&RepoFixture> {
        self.remotes
            .iter()
            .find(|(remote, _)| remote == name)
            .map(|(_, fixture)| fixture)
            .ok_or_else(|| anyhow::anyhow!("no remote named {name}"))
    }

    pub(crate) fn descriptors(&self) -> Vec<RepositoryDescriptor> {
        self.remotes
            .iter()
            .map(|(name, remote)| {
                let mut descriptor = RepositoryDescriptor::new("local", "acme", name, remote.url());
                descriptor.default_branch = Some("main".into());
                descriptor
            })
            .collect()
    }

    pub(crate) fn provider(&self) -> ManifestProvider {
        ManifestProvider::new(self.descriptors())
    }

    /// Clone remote into its local path ahead of a run.
    pub(crate) fn pre_clone(&self, name: &str) -> Result<Repository> {
        Ok(Repository::clone(&self.remote(name)?.url(), self.local_path(name))?)
    }

    pub(crate) fn config(&self) -> RunConfig {
        RunConfig {
            target: self.target(),
            parallel: 2,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                multiplier: 2.0,
                max_delay: Duration::from_millis(50),
            },
            task_timeout: Some(Duration::from_secs(60)),
            grace_period: Duration::from_secs(1),
            ..RunConfig::default()
        }
    }
}
