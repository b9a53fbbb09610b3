// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use fleetsync::{
    config::{RunConfig, Settings},
    filter::{FilterSpec, Inclusion},
    model::SyncStrategy,
    path::default_settings_file,
    Git2Backend, ManifestProvider,
};

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use std::{
    io::{stderr, IsTerminal},
    path::PathBuf,
    process::exit,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "fleetsync [options] --manifest <file> <target>",
    version
)]
struct Cli {
    /// Directory to keep local clones under.
    #[arg(value_name = "target")]
    pub target: Option<PathBuf>,

    /// JSON file listing repositories to synchronize.
    #[arg(short, long, value_name = "file")]
    pub manifest: PathBuf,

    /// Organization to synchronize, repeat for more. Default is all.
    #[arg(short, long = "org", value_name = "org")]
    pub organizations: Vec<String>,

    /// Strategy for repositories that already exist locally.
    #[arg(short, long, value_name = "reset|pull|fetch|rebase|clone|skip")]
    pub strategy: Option<SyncStrategy>,

    /// Number of repositories to work on at the same time.
    #[arg(short, long, value_name = "n")]
    pub parallel: Option<usize>,

    /// Skip repositories settled by an earlier run's checkpoint.
    #[arg(long)]
    pub resume: bool,

    /// Process repositories even if the checkpoint says they are settled.
    #[arg(long)]
    pub force: bool,

    /// Resolve actions but do not run any of them.
    #[arg(long)]
    pub dry_run: bool,

    /// Only include repositories whose name matches regex.
    #[arg(long, value_name = "regex")]
    pub include_pattern: Option<String>,

    /// Exclude repositories whose name matches regex.
    #[arg(long, value_name = "regex")]
    pub exclude_pattern: Option<String>,

    /// Print report as JSON instead of a table.
    #[arg(long)]
    pub json: bool,

    /// Settings file to use instead of the default one.
    #[arg(short, long, value_name = "file")]
    pub config: Option<PathBuf>,

    /// Deadline per repository in seconds, 0 disables it.
    #[arg(long, value_name = "secs")]
    pub timeout: Option<u64>,

    /// Attempts per repository before giving up on transient failures.
    #[arg(long, value_name = "n")]
    pub max_attempts: Option<u32>,

    /// How to treat archived repositories.
    #[arg(long, value_name = "any|exclude|only", default_value_t = Inclusion::Any)]
    pub archived: Inclusion,

    /// How to treat forks.
    #[arg(long, value_name = "any|exclude|only", default_value_t = Inclusion::Any)]
    pub forks: Inclusion,

    /// How to treat private repositories.
    #[arg(long, value_name = "any|exclude|only", default_value_t = Inclusion::Any)]
    pub private: Inclusion,

    #[arg(long, value_name = "n")]
    pub min_stars: Option<u64>,

    #[arg(long, value_name = "n")]
    pub max_stars: Option<u64>,

    /// Minimum repository size in KB.
    #[arg(long, value_name = "kb")]
    pub min_size: Option<u64>,

    /// Maximum repository size in KB.
    #[arg(long, value_name = "kb")]
    pub max_size: Option<u64>,

    /// Only include repositories updated after date, RFC 3339 or YYYY-MM-DD.
    #[arg(long, value_name = "date", value_parser = parse_date)]
    pub updated_after: Option<DateTime<Utc>>,

    /// Only include repositories in language, repeat for more.
    #[arg(long = "language", value_name = "lang")]
    pub languages: Vec<String>,

    /// Only include repositories carrying topic, repeat to require more.
    #[arg(long = "topic", value_name = "topic")]
    pub topics: Vec<String>,
}

impl Cli {
    async fn run(self) -> Result<i32> {
        let json = self.json;
        let manifest = self.manifest.clone();
        let config = self.into_config()?;

        let provider = Arc::new(ManifestProvider::open(&manifest)?);
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, finishing in-flight repositories");
                interrupt.cancel();
            }
        });

        let report = fleetsync::run(config, provider, Arc::new(Git2Backend), cancel).await?;
        if json {
            println!("{}", report.to_json()?);
        } else {
            print!("{report}");
        }

        Ok(report.exit_code())
    }

    fn into_config(self) -> Result<RunConfig> {
        let mut config = RunConfig::default();
        let settings = match &self.config {
            Some(path) => Settings::load(path, true)?,
            None => match default_settings_file() {
                Ok(path) => Settings::load(path, false)?,
                Err(err) => {
                    warn!("{err}, skipping settings file");
                    Settings::default()
                }
            },
        };
        let settings_target = settings.target.is_some();
        config.apply_settings(settings);

        match self.target {
            Some(target) => config.target = target,
            None if settings_target => {}
            None => return Err(anyhow!("no target directory given")),
        }

        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }

        if let Some(parallel) = self.parallel {
            config.parallel = parallel;
        }

        if let Some(secs) = self.timeout {
            config.task_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = max_attempts;
        }

        config.organizations = self.organizations;
        config.resume = self.resume;
        config.force = self.force;
        config.dry_run = self.dry_run;
        config.show_progress = !self.json && stderr().is_terminal();

        let mut filter = FilterSpec {
            archived: self.archived,
            fork: self.forks,
            private: self.private,
            min_stars: self.min_stars,
            max_stars: self.max_stars,
            min_size_kb: self.min_size,
            max_size_kb: self.max_size,
            updated_after: self.updated_after,
            languages: self.languages.into_iter().collect(),
            topics: self.topics.into_iter().collect(),
            ..FilterSpec::default()
        };
        if let Some(pattern) = self.include_pattern {
            filter = filter.with_include_pattern(pattern)?;
        }
        if let Some(pattern) = self.exclude_pattern {
            filter = filter.with_exclude_pattern(pattern)?;
        }
        config.filter = filter;

        Ok(config)
    }
}

fn parse_date(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Ok(date.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|date| date.and_utc())
        .ok_or_else(|| format!("invalid date {value:?}, expected RFC 3339 or YYYY-MM-DD"))
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_writer(stderr);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    match run().await {
        Ok(code) => exit(code),
        Err(error) => {
            error!("{error:?}");
            exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    Cli::parse().run().await
}
