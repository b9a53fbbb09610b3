// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Descriptor filtering.
//!
//! Narrow the descriptor list handed over by a directory provider before
//! any task gets scheduled. Filtering is a pure function of its inputs.
//!
//! # Evaluation Order
//!
//! 1. Type filters: archived, fork, and private inclusion flags.
//! 2. Name patterns: include and exclude regular expressions.
//! 3. Numeric and date filters: stars, size, last update.
//! 4. Language and topic membership.
//!
//! A descriptor survives only if every active predicate accepts it. Topics
//! use AND semantics, so every required topic must be present.

use crate::model::RepositoryDescriptor;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Inclusion rule for a boolean descriptor flag.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Inclusion {
    /// Flag does not matter.
    #[default]
    Any,

    /// Drop descriptors with flag set.
    Exclude,

    /// Keep only descriptors with flag set.
    Only,
}

impl Inclusion {
    fn accepts(&self, flag: bool) -> bool {
        match self {
            Self::Any => true,
            Self::Exclude => !flag,
            Self::Only => flag,
        }
    }

    /// Flag may be set on surviving descriptors.
    pub fn allows_flagged(&self) -> bool {
        !matches!(self, Self::Exclude)
    }
}

impl FromStr for Inclusion {
    type Err = FilterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "any" | "include" => Ok(Self::Any),
            "exclude" | "no" => Ok(Self::Exclude),
            "only" => Ok(Self::Only),
            _ => Err(FilterError::UnknownInclusion(value.to_owned())),
        }
    }
}

impl Display for Inclusion {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Any => "any",
            Self::Exclude => "exclude",
            Self::Only => "only",
        })
    }
}

/// Set of predicates narrowing a descriptor list.
///
/// The default value has no active predicate and keeps everything.
#[derive(Debug, Default, Clone)]
pub struct FilterSpec {
    pub archived: Inclusion,
    pub fork: Inclusion,
    pub private: Inclusion,
    pub include_pattern: Option<Regex>,
    pub exclude_pattern: Option<Regex>,
    pub min_stars: Option<u64>,
    pub max_stars: Option<u64>,
    pub min_size_kb: Option<u64>,
    pub max_size_kb: Option<u64>,

    /// Keep descriptors updated strictly after this instant.
    pub updated_after: Option<DateTime<Utc>>,

    /// Accepted languages, any of them matches. Compared case-insensitively.
    pub languages: BTreeSet<String>,

    /// Required topics, all of them must match. Compared case-insensitively.
    pub topics: BTreeSet<String>,
}

impl FilterSpec {
    /// Compile include pattern.
    ///
    /// # Errors
    ///
    /// - Return [`FilterError::Pattern`] if pattern is not a valid regex.
    pub fn with_include_pattern(mut self, pattern: impl AsRef<str>) -> Result<Self> {
        self.include_pattern = Some(compile(pattern.as_ref())?);
        Ok(self)
    }

    /// Compile exclude pattern.
    ///
    /// # Errors
    ///
    /// - Return [`FilterError::Pattern`] if pattern is not a valid regex.
    pub fn with_exclude_pattern(mut self, pattern: impl AsRef<str>) -> Result<Self> {
        self.exclude_pattern = Some(compile(pattern.as_ref())?);
        Ok(self)
    }

    /// Check whether descriptor passes every active predicate.
    pub fn accepts(&self, descriptor: &RepositoryDescriptor) -> bool {
        self.accepts_type(descriptor)
            && self.accepts_name(descriptor)
            && self.accepts_metrics(descriptor)
            && self.accepts_labels(descriptor)
    }

    fn accepts_type(&self, descriptor: &RepositoryDescriptor) -> bool {
        self.archived.accepts(descriptor.archived)
            && self.fork.accepts(descriptor.fork)
            && self.private.accepts(descriptor.private)
    }

    fn accepts_name(&self, descriptor: &RepositoryDescriptor) -> bool {
        let full_name = descriptor.full_name();
        let matches =
            |regex: &Regex| regex.is_match(&descriptor.name) || regex.is_match(&full_name);

        if let Some(include) = &self.include_pattern {
            if !matches(include) {
                return false;
            }
        }

        if let Some(exclude) = &self.exclude_pattern {
            if matches(exclude) {
                return false;
            }
        }

        true
    }

    fn accepts_metrics(&self, descriptor: &RepositoryDescriptor) -> bool {
        let at_least = |bound: Option<u64>, value: u64| bound.is_none_or(|bound| value >= bound);
        let at_most = |bound: Option<u64>, value: u64| bound.is_none_or(|bound| value <= bound);

        at_least(self.min_stars, descriptor.stars)
            && at_most(self.max_stars, descriptor.stars)
            && at_least(self.min_size_kb, descriptor.size_kb)
            && at_most(self.max_size_kb, descriptor.size_kb)
            && match self.updated_after {
                Some(after) => descriptor.updated_at.is_some_and(|updated| updated > after),
                None => true,
            }
    }

    fn accepts_labels(&self, descriptor: &RepositoryDescriptor) -> bool {
        if !self.languages.is_empty() {
            let Some(language) = &descriptor.language else {
                return false;
            };

            if !self
                .languages
                .iter()
                .any(|wanted| wanted.eq_ignore_ascii_case(language))
            {
                return false;
            }
        }

        self.topics.iter().all(|required| {
            descriptor
                .topics
                .iter()
                .any(|topic| topic.eq_ignore_ascii_case(required))
        })
    }
}

/// Narrow descriptors down to those accepted by filter specification.
///
/// Input order is preserved. Output is always a subset of input, and
/// filtering twice with the same specification changes nothing.
pub fn filter(
    descriptors: impl IntoIterator<Item = RepositoryDescriptor>,
    spec: &FilterSpec,
) -> Vec<RepositoryDescriptor> {
    descriptors
        .into_iter()
        .filter(|descriptor| spec.accepts(descriptor))
        .collect()
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| FilterError::Pattern {
        pattern: pattern.to_owned(),
        source,
    })
}

/// Filter specification error types.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// Name pattern is not a valid regular expression.
    #[error("invalid name pattern {pattern:?}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Inclusion rule not recognized.
    #[error("unknown inclusion rule {0:?}, expected one of any, exclude, only")]
    UnknownInclusion(String),
}

/// Friendly result alias :3
type Result<T, E = FilterError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn repo(name: &str) -> RepositoryDescriptor {
        RepositoryDescriptor::new("github", "acme", name, format!("https://x/{name}.git"))
    }

    fn names(descriptors: &[RepositoryDescriptor]) -> Vec<&str> {
        descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    fn sample() -> Vec<RepositoryDescriptor> {
        let mut api = repo("api");
        api.language = Some("Rust".into());
        api.topics = ["backend", "http"].into_iter().map(String::from).collect();
        api.stars = 120;
        api.size_kb = 2_048;
        api.updated_at = Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());

        let mut web = repo("web");
        web.language = Some("TypeScript".into());
        web.topics = ["frontend"].into_iter().map(String::from).collect();
        web.stars = 40;
        web.size_kb = 9_000;
        web.private = true;
        web.updated_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let mut old = repo("legacy-api");
        old.archived = true;
        old.language = Some("Go".into());
        old.topics = ["backend"].into_iter().map(String::from).collect();

        let mut fork = repo("serde-fork");
        fork.fork = true;
        fork.language = Some("rust".into());
        fork.stars = 3;

        vec![api, web, old, fork]
    }

    #[test]
    fn empty_spec_keeps_everything() {
        let input = sample();
        assert_eq!(filter(input.clone(), &FilterSpec::default()), input);
    }

    #[test]
    fn type_filters() {
        let spec = FilterSpec {
            archived: Inclusion::Exclude,
            fork: Inclusion::Exclude,
            ..FilterSpec::default()
        };
        assert_eq!(names(&filter(sample(), &spec)), ["api", "web"]);

        let spec = FilterSpec {
            private: Inclusion::Only,
            ..FilterSpec::default()
        };
        assert_eq!(names(&filter(sample(), &spec)), ["web"]);
    }

    #[test]
    fn name_patterns_match_name_or_full_name() -> anyhow::Result<()> {
        let spec = FilterSpec::default().with_include_pattern("api$")?;
        assert_eq!(names(&filter(sample(), &spec)), ["api", "legacy-api"]);

        let spec = FilterSpec::default()
            .with_include_pattern("^acme/")?
            .with_exclude_pattern("^legacy-")?;
        assert_eq!(names(&filter(sample(), &spec)), ["api", "web", "serde-fork"]);

        Ok(())
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let result = FilterSpec::default().with_include_pattern("(unclosed");
        assert!(matches!(result, Err(FilterError::Pattern { .. })));
    }

    #[test]
    fn numeric_and_date_filters() {
        let spec = FilterSpec {
            min_stars: Some(10),
            max_size_kb: Some(4_096),
            ..FilterSpec::default()
        };
        assert_eq!(names(&filter(sample(), &spec)), ["api"]);

        let spec = FilterSpec {
            updated_after: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            ..FilterSpec::default()
        };
        assert_eq!(names(&filter(sample(), &spec)), ["api"]);
    }

    #[test]
    fn languages_are_any_of_and_topics_are_all_of() {
        let spec = FilterSpec {
            languages: ["RUST".to_string()].into(),
            ..FilterSpec::default()
        };
        assert_eq!(names(&filter(sample(), &spec)), ["api", "serde-fork"]);

        let spec = FilterSpec {
            topics: ["backend".to_string()].into(),
            ..FilterSpec::default()
        };
        assert_eq!(names(&filter(sample(), &spec)), ["api", "legacy-api"]);

        let spec = FilterSpec {
            topics: ["backend".to_string(), "http".to_string()].into(),
            ..FilterSpec::default()
        };
        assert_eq!(names(&filter(sample(), &spec)), ["api"]);
    }

    fn descriptor_strategy() -> impl Strategy<Value = RepositoryDescriptor> {
        (
            "[a-d]{1,3}",
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            0u64..200,
            0u64..10_000,
            prop::option::of(prop::sample::select(vec!["Rust", "Go", "rust"])),
            prop::collection::btree_set(prop::sample::select(vec!["a", "b", "c"]), 0..3),
        )
            .prop_map(
                |(name, archived, fork, private, stars, size_kb, language, topics)| {
                    let mut descriptor = repo(&name);
                    descriptor.archived = archived;
                    descriptor.fork = fork;
                    descriptor.private = private;
                    descriptor.stars = stars;
                    descriptor.size_kb = size_kb;
                    descriptor.language = language.map(String::from);
                    descriptor.topics = topics.into_iter().map(String::from).collect();
                    descriptor
                },
            )
    }

    fn inclusion_strategy() -> impl Strategy<Value = Inclusion> {
        prop::sample::select(vec![Inclusion::Any, Inclusion::Exclude, Inclusion::Only])
    }

    fn spec_strategy() -> impl Strategy<Value = FilterSpec> {
        (
            inclusion_strategy(),
            inclusion_strategy(),
            prop::option::of(prop::sample::select(vec!["^a", "b", "c$"])),
            prop::option::of(0u64..200),
            prop::option::of(0u64..10_000),
            prop::collection::btree_set(prop::sample::select(vec!["a", "b"]), 0..2),
        )
            .prop_map(|(archived, fork, pattern, min_stars, max_size_kb, topics)| {
                FilterSpec {
                    archived,
                    fork,
                    include_pattern: pattern.map(|p| Regex::new(p).unwrap()),
                    min_stars,
                    max_size_kb,
                    topics: topics.into_iter().map(String::from).collect(),
                    ..FilterSpec::default()
                }
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn filter_is_subset_and_idempotent(
            input in prop::collection::vec(descriptor_strategy(), 0..12),
            spec in spec_strategy(),
        ) {
            let once = filter(input.clone(), &spec);
            prop_assert!(once.iter().all(|kept| input.contains(kept)));
            prop_assert!(once.len() <= input.len());

            let twice = filter(once.clone(), &spec);
            prop_assert_eq!(twice, once);
        }
    }
}
