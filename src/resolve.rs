// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Strategy resolution.
//!
//! Map a user-selected [`SyncStrategy`] and the inspected [`LocalRepoState`]
//! onto exactly one [`Action`]. Resolution is pure, so it is safe to run it
//! again before every retry attempt.

use crate::{
    inspect::LocalRepoState,
    model::{Action, SyncStrategy},
};

/// Resolved action with a short human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub action: Action,
    pub rationale: String,
}

impl Resolution {
    fn new(action: Action, rationale: impl Into<String>) -> Self {
        Self {
            action,
            rationale: rationale.into(),
        }
    }
}

/// Resolve action for a repository path in a given local state.
///
/// # Invariants
///
/// - Missing paths always resolve to [`Action::Clone`], even under skip.
/// - Dirty working trees never resolve to [`Action::Reset`] or
///   [`Action::Clone`] under pull or rebase.
pub fn resolve(strategy: SyncStrategy, state: &LocalRepoState) -> Resolution {
    if !state.exists {
        return Resolution::new(Action::Clone, "not present locally");
    }

    match strategy {
        SyncStrategy::Skip => Resolution::new(Action::Skip, "skip strategy leaves existing clones"),
        SyncStrategy::Clone => Resolution::new(Action::Clone, "clone strategy replaces local copy"),
        SyncStrategy::Reset => {
            Resolution::new(Action::Reset, "hard reset to remote tracking branch")
        }
        SyncStrategy::Fetch => Resolution::new(Action::Fetch, "update remote tracking refs"),
        SyncStrategy::Pull | SyncStrategy::Rebase => match dirty_cause(state) {
            Some(cause) => Resolution::new(
                Action::ConflictManualRequired,
                format!("{cause}; resolve manually"),
            ),
            None if strategy == SyncStrategy::Pull => {
                Resolution::new(Action::Pull, "merge remote changes")
            }
            None => Resolution::new(Action::Rebase, "rebase local commits onto remote"),
        },
    }
}

/// Resolve action for a path that exists but holds no Git repository.
///
/// Only clone replaces such a path, and only skip leaves it alone. Every
/// other strategy yields `None`, meaning the task cannot proceed.
pub fn resolve_unmanaged(strategy: SyncStrategy) -> Option<Resolution> {
    match strategy {
        SyncStrategy::Clone => Some(Resolution::new(
            Action::Clone,
            "replace non-repository path with fresh clone",
        )),
        SyncStrategy::Skip => Some(Resolution::new(
            Action::Skip,
            "path exists but is not a git repository",
        )),
        SyncStrategy::Reset | SyncStrategy::Pull | SyncStrategy::Fetch | SyncStrategy::Rebase => {
            None
        }
    }
}

fn dirty_cause(state: &LocalRepoState) -> Option<String> {
    if state.merge_in_progress {
        return Some("merge in progress".into());
    }

    if state.rebase_in_progress {
        return Some("rebase in progress".into());
    }

    if state.has_uncommitted_changes {
        let count = state.dirty_entries.max(1);
        let noun = if count == 1 { "file" } else { "files" };
        return Some(format!("{count} uncommitted {noun}"));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use simple_test_case::test_case;

    fn dirty(entries: usize) -> LocalRepoState {
        LocalRepoState {
            has_uncommitted_changes: true,
            dirty_entries: entries,
            ..LocalRepoState::clean("main")
        }
    }

    fn merging() -> LocalRepoState {
        LocalRepoState {
            merge_in_progress: true,
            ..LocalRepoState::clean("main")
        }
    }

    fn rebasing() -> LocalRepoState {
        LocalRepoState {
            rebase_in_progress: true,
            ..LocalRepoState::clean("main")
        }
    }

    #[test_case(SyncStrategy::Pull, LocalRepoState::missing(), Action::Clone; "missing pull clones")]
    #[test_case(SyncStrategy::Skip, LocalRepoState::missing(), Action::Clone; "missing skip clones")]
    #[test_case(SyncStrategy::Skip, dirty(2), Action::Skip; "existing skip skips")]
    #[test_case(SyncStrategy::Clone, dirty(2), Action::Clone; "clone replaces dirty")]
    #[test_case(SyncStrategy::Reset, dirty(2), Action::Reset; "reset proceeds on dirty")]
    #[test_case(SyncStrategy::Fetch, merging(), Action::Fetch; "fetch ignores merge")]
    #[test_case(SyncStrategy::Pull, LocalRepoState::clean("main"), Action::Pull; "clean pull")]
    #[test_case(SyncStrategy::Rebase, LocalRepoState::clean("main"), Action::Rebase; "clean rebase")]
    #[test_case(SyncStrategy::Pull, dirty(1), Action::ConflictManualRequired; "dirty pull")]
    #[test_case(SyncStrategy::Rebase, rebasing(), Action::ConflictManualRequired; "mid rebase")]
    #[test]
    fn resolve_action(strategy: SyncStrategy, state: LocalRepoState, expect: Action) {
        use pretty_assertions::assert_eq;

        assert_eq!(resolve(strategy, &state).action, expect);
    }

    #[test_case(dirty(3), "3 uncommitted files; resolve manually"; "several files")]
    #[test_case(dirty(1), "1 uncommitted file; resolve manually"; "single file")]
    #[test_case(merging(), "merge in progress; resolve manually"; "merge")]
    #[test_case(rebasing(), "rebase in progress; resolve manually"; "rebase")]
    #[test]
    fn conflict_rationale_names_cause(state: LocalRepoState, expect: &str) {
        use pretty_assertions::assert_eq;

        let resolution = resolve(SyncStrategy::Pull, &state);
        assert_eq!(resolution.action, Action::ConflictManualRequired);
        assert_eq!(resolution.rationale, expect);
    }

    #[test]
    fn unmanaged_paths() {
        assert_eq!(
            resolve_unmanaged(SyncStrategy::Clone).map(|r| r.action),
            Some(Action::Clone)
        );
        assert_eq!(
            resolve_unmanaged(SyncStrategy::Skip).map(|r| r.action),
            Some(Action::Skip)
        );
        for strategy in [
            SyncStrategy::Reset,
            SyncStrategy::Pull,
            SyncStrategy::Fetch,
            SyncStrategy::Rebase,
        ] {
            assert_eq!(resolve_unmanaged(strategy), None);
        }
    }

    fn state_strategy() -> impl Strategy<Value = LocalRepoState> {
        (
            any::<bool>(),
            0usize..5,
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(exists, entries, merge, rebase, stash)| {
                if !exists {
                    return LocalRepoState::missing();
                }
                LocalRepoState {
                    has_uncommitted_changes: entries > 0,
                    dirty_entries: entries,
                    merge_in_progress: merge,
                    rebase_in_progress: rebase,
                    has_stash: stash,
                    ..LocalRepoState::clean("main")
                }
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn dirty_pull_or_rebase_is_never_destructive(
            state in state_strategy(),
            rebase in any::<bool>(),
        ) {
            prop_assume!(state.exists && state.is_dirty());
            let strategy = if rebase { SyncStrategy::Rebase } else { SyncStrategy::Pull };
            let action = resolve(strategy, &state).action;
            prop_assert!(!action.is_destructive());
            prop_assert_eq!(action, Action::ConflictManualRequired);
        }

        #[test]
        fn missing_always_clones(index in 0usize..SyncStrategy::ALL.len()) {
            let strategy = SyncStrategy::ALL[index];
            prop_assert_eq!(resolve(strategy, &LocalRepoState::missing()).action, Action::Clone);
        }
    }
}
