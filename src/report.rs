// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Result aggregation and reporting.
//!
//! The [`Reporter`] drains a [`ResultStream`], keeps running counts behind a
//! progress bar, and finally produces a [`Report`]. Reports render either as
//! JSON or as a table meant for humans.

use crate::{
    model::{Action, RepoKey, Status, SyncResult},
    scheduler::ResultStream,
};

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
    time::{Duration, Instant},
};
use tabled::{settings::Style, Table, Tabled};
use tracing::debug;

/// Progress bar refresh rate, independent of how fast results arrive.
const REFRESH_HZ: u8 = 4;

/// Drain result stream while showing progress.
#[derive(Debug)]
pub struct Reporter {
    bar: ProgressBar,
    summary: Summary,
}

impl Reporter {
    /// Construct new reporter for a given number of tasks.
    ///
    /// # Errors
    ///
    /// - Return [`ReportError::Template`] if progress bar style is invalid.
    pub fn new(total: usize, visible: bool) -> Result<Self> {
        let target = if visible {
            ProgressDrawTarget::stderr_with_hz(REFRESH_HZ)
        } else {
            ProgressDrawTarget::hidden()
        };

        let bar = ProgressBar::with_draw_target(Some(total as u64), target);
        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  [{wide_bar:.yellow/blue}]  {pos}/{len} ({percent}%)  {msg}",
        )?
        .progress_chars("=> ");
        bar.set_style(style);

        Ok(Self {
            bar,
            summary: Summary::default(),
        })
    }

    /// Consume every result, then build the final report.
    pub async fn consume(mut self, mut stream: ResultStream) -> Report {
        let started = Instant::now();
        let mut results = Vec::with_capacity(stream.total());

        while let Some(result) = stream.next().await {
            self.summary.count(result.status);
            self.bar.inc(1);
            self.bar.set_message(self.summary.to_string());
            results.push(result);
        }

        self.bar.finish_and_clear();
        debug!("peak concurrency was {}", stream.peak_running());
        Report::new(results, stream.total(), started.elapsed())
    }
}

/// Per-status counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub success: usize,
    pub skipped: usize,
    pub conflict: usize,
    pub failed: usize,

    /// Submitted tasks that never ran because the run was interrupted.
    pub not_run: usize,
}

impl Summary {
    fn count(&mut self, status: Status) {
        self.total += 1;
        match status {
            Status::Success => self.success += 1,
            Status::Skipped => self.skipped += 1,
            Status::Conflict => self.conflict += 1,
            Status::Failed => self.failed += 1,
        }
    }
}

impl Display for Summary {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "{} success, {} skipped, {} conflict, {} failed",
            self.success, self.skipped, self.conflict, self.failed
        )?;

        if self.not_run > 0 {
            write!(fmt, ", {} not run", self.not_run)?;
        }

        Ok(())
    }
}

/// One row of the final report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub key: RepoKey,
    pub path: PathBuf,
    pub status: Status,
    pub action: Option<Action>,
    pub reason: String,
    pub duration_ms: u64,
    pub retries: u32,
}

impl From<SyncResult> for ReportEntry {
    fn from(result: SyncResult) -> Self {
        Self {
            key: result.key,
            path: result.path,
            status: result.status,
            action: result.action,
            reason: result.reason,
            duration_ms: millis(result.duration),
            retries: result.retries,
        }
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    /// Every result, sorted by repository key.
    pub entries: Vec<ReportEntry>,
    pub summary: Summary,
    pub duration_ms: u64,
}

impl Report {
    /// Construct report from results in any order.
    ///
    /// Tasks out of `submitted` that produced no result count as not run.
    pub fn new(
        results: impl IntoIterator<Item = SyncResult>,
        submitted: usize,
        duration: Duration,
    ) -> Self {
        let mut summary = Summary::default();
        let mut entries: Vec<ReportEntry> = results
            .into_iter()
            .inspect(|result| summary.count(result.status))
            .map(ReportEntry::from)
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        summary.not_run = submitted.saturating_sub(summary.total);
        summary.total += summary.not_run;

        Self {
            entries,
            summary,
            duration_ms: millis(duration),
        }
    }

    /// Process exit code for this report.
    ///
    /// - `0` if everything succeeded or got skipped.
    /// - `1` if anything failed, or the run was interrupted before every
    ///   task ran.
    /// - `2` if anything needs manual conflict resolution, and nothing failed.
    pub fn exit_code(&self) -> i32 {
        if self.summary.failed > 0 || self.summary.not_run > 0 {
            1
        } else if self.summary.conflict > 0 {
            2
        } else {
            0
        }
    }

    /// Count entries that ran a given action successfully.
    pub fn performed(&self, action: Action) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.status == Status::Success && entry.action == Some(action))
            .count()
    }

    /// Render report as pretty JSON.
    ///
    /// # Errors
    ///
    /// - Return [`ReportError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Render results as a table.
    pub fn to_table(&self) -> String {
        let rows = self.entries.iter().map(|entry| TableRow {
            key: entry.key.to_string(),
            status: entry.status.to_string(),
            action: entry.action.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
            duration: format!("{:.1}s", entry.duration_ms as f64 / 1000.0),
            retries: entry.retries,
            reason: entry.reason.clone(),
        });

        let mut table = Table::new(rows);
        table.with(Style::rounded());
        table.to_string()
    }
}

impl Display for Report {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        if !self.entries.is_empty() {
            writeln!(fmt, "{}", self.to_table())?;
        }

        writeln!(
            fmt,
            "{} repositories in {:.1}s: {}",
            self.summary.total,
            self.duration_ms as f64 / 1000.0,
            self.summary
        )?;

        let problems: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| matches!(entry.status, Status::Conflict | Status::Failed))
            .collect();
        if !problems.is_empty() {
            writeln!(fmt, "\nneeds attention:")?;
            for entry in problems {
                writeln!(fmt, "  {} [{}]: {}", entry.key, entry.status, entry.reason)?;
            }
        }

        if self.summary.not_run > 0 {
            writeln!(
                fmt,
                "\ninterrupted: {} repositories not run, use --resume to continue",
                self.summary.not_run
            )?;
        }

        Ok(())
    }
}

#[derive(Tabled)]
struct TableRow {
    #[tabled(rename = "repository")]
    key: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "action")]
    action: String,
    #[tabled(rename = "duration")]
    duration: String,
    #[tabled(rename = "retries")]
    retries: u32,
    #[tabled(rename = "reason")]
    reason: String,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Reporting error types.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// Progress bar template is malformed.
    #[error(transparent)]
    Template(#[from] indicatif::style::TemplateError),

    /// Report cannot be serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Friendly result alias :3
type Result<T, E = ReportError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn result(key: &str, status: Status, action: Option<Action>, reason: &str) -> SyncResult {
        SyncResult {
            key: key.into(),
            path: PathBuf::from("/fleet").join(key.replace(':', "/")),
            status,
            action,
            reason: reason.into(),
            duration: Duration::from_millis(1500),
            retries: 0,
        }
    }

    fn sample() -> Report {
        Report::new(
            [
                result("github:acme/web", Status::Conflict, Some(Action::ConflictManualRequired), "2 uncommitted files; resolve manually"),
                result("github:acme/api", Status::Success, Some(Action::Pull), "fast-forwarded"),
                result("github:acme/docs", Status::Skipped, Some(Action::Skip), "skip strategy"),
            ],
            3,
            Duration::from_secs(3),
        )
    }

    #[test]
    fn entries_sorted_and_counted() {
        let report = sample();
        let keys: Vec<_> = report.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, ["github:acme/api", "github:acme/docs", "github:acme/web"]);
        assert_eq!(
            report.summary,
            Summary {
                total: 3,
                success: 1,
                skipped: 1,
                conflict: 1,
                failed: 0,
                not_run: 0,
            }
        );
        assert_eq!(report.performed(Action::Pull), 1);
        assert_eq!(report.duration_ms, 3000);
    }

    #[test_case(&[Status::Success, Status::Skipped], 0; "all good")]
    #[test_case(&[Status::Success, Status::Conflict], 2; "conflict only")]
    #[test_case(&[Status::Conflict, Status::Failed], 1; "failure wins")]
    #[test_case(&[], 0; "empty run")]
    #[test]
    fn exit_codes(statuses: &[Status], expect: i32) {
        use pretty_assertions::assert_eq;

        let report = Report::new(
            statuses
                .iter()
                .enumerate()
                .map(|(index, status)| result(&format!("github:acme/r{index}"), *status, None, "x")),
            statuses.len(),
            Duration::ZERO,
        );
        assert_eq!(report.exit_code(), expect);
    }

    #[test]
    fn interrupted_run_is_not_clean() {
        let report = Report::new(
            [result("github:acme/api", Status::Success, Some(Action::Pull), "fast-forwarded")],
            5,
            Duration::ZERO,
        );
        assert_eq!(report.summary.total, 5);
        assert_eq!(report.summary.not_run, 4);
        assert_eq!(report.exit_code(), 1);

        let text = report.to_string();
        assert!(text.contains("5 repositories in 0.0s: 1 success, 0 skipped, 0 conflict, 0 failed, 4 not run"));
        assert!(text.contains("interrupted: 4 repositories not run, use --resume to continue"));
    }

    #[test]
    fn json_layout() -> anyhow::Result<()> {
        let value: serde_json::Value = serde_json::from_str(&sample().to_json()?)?;
        assert_eq!(value["summary"]["conflict"], 1);
        assert_eq!(value["entries"][0]["key"], "github:acme/api");
        assert_eq!(value["entries"][0]["status"], "success");
        assert_eq!(value["entries"][0]["action"], "pull");
        assert_eq!(value["entries"][0]["duration_ms"], 1500);
        assert_eq!(value["entries"][2]["action"], "conflict-manual-required");
        Ok(())
    }

    #[test]
    fn human_report_lists_problems() {
        let text = sample().to_string();
        assert!(text.contains("repository"));
        assert!(text.contains("github:acme/docs"));
        assert!(text.contains("3 repositories in 3.0s: 1 success, 1 skipped, 1 conflict, 0 failed"));
        assert!(text.contains(
            "needs attention:\n  github:acme/web [conflict]: 2 uncommitted files; resolve manually"
        ));
    }
}
