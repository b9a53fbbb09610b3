// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Keep a fleet of local Git clones in sync with their remotes.
//!
//! Given a list of repositories from a [`DirectoryProvider`], fleetsync
//! brings every matching local clone under one target directory up to date,
//! many at a time, without ever destroying local work unless told to.
//!
//! # Safety First
//!
//! Each repository is inspected right before anything is done to it. Dirty
//! working trees, half-done merges, and half-done rebases are reported as
//! conflicts under the pull and rebase strategies instead of being touched.
//! Only the reset and clone strategies may discard local work, and only
//! because the user asked for exactly that.
//!
//! # Resumable Runs
//!
//! Outcomes are recorded in a checkpoint file at the top-level of the target
//! directory. A resumed run skips everything already settled, so an
//! interrupted run can pick up where it left off.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod filter;
pub mod git;
pub mod inspect;
pub mod model;
pub mod path;
pub mod provider;
pub mod report;
pub mod resolve;
pub mod scheduler;

pub use config::{RetryPolicy, RunConfig, Settings};
pub use engine::{run, EngineError};
pub use filter::{FilterSpec, Inclusion};
pub use git::{Git2Backend, GitBackend};
pub use model::{Action, RepoKey, RepositoryDescriptor, Status, SyncResult, SyncStrategy, SyncTask};
pub use provider::{DirectoryProvider, ListHints, ManifestProvider};
pub use report::Report;
