#[macro_use]
extern crate derive_builder;

mod blobs;
mod burndown;
mod couples;
mod errors;
mod file;
mod filediff;
mod identity;
mod languages;
mod pb;
mod pipeline;
mod renames;
mod render;
#[cfg(test)]
mod testutil;
mod ticks;
mod tree;
mod treediff;
mod walking;

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Command, CommandFactory};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use git2::Repository;
use regex::Regex;
use tempfile::TempDir;
use time::OffsetDateTime;

use crate::blobs::BlobCache;
use crate::burndown::{BurndownAnalysis, BurndownOptions, BurndownOptionsBuilder};
use crate::couples::CouplesAnalysis;
use crate::filediff::{FileDiff, FileDiffOptions, FileDiffOptionsBuilder};
use crate::identity::{IdentityDetector, PeopleHandle, PeopleRegistry};
use crate::pipeline::{AnalysisReport, Pipeline, PipelineItem};
use crate::renames::{RenameDetector, RenameOptions};
use crate::render::OutputHeader;
use crate::ticks::TickMapper;
use crate::treediff::{TreeDiff, TreeDiffOptions, TreeDiffOptionsBuilder};
use crate::walking::{parse_time_input, CommitWalk};

/// Computes line burndown statistics over the history of a git repository.
///
/// For every commit on the analysed branch the tool tracks, for every source
/// line ever introduced, the tick in which it was born, and accounts every
/// later deletion or modification against that birth tick. The aggregate is a
/// burndown matrix: how many lines born in band B are still alive at sample S.
///
/// The repository may be a local path or a clone URL; clones of remote
/// repositories land in [CACHE_DIR] when given, in a temporary directory
/// otherwise.
#[derive(Debug, clap::Parser)]
#[clap(version, author)]
struct Cli {
    #[clap(flatten)]
    verbose: Verbosity<InfoLevel>,

    /// Path or URL of the repository to analyse.
    #[clap(value_name = "PATH_OR_URL")]
    repository: String,

    /// Directory holding cached clones of remote repositories.
    #[clap(value_name = "CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Bucket size on the birth axis, in ticks.
    #[clap(help_heading = "ANALYSIS", long, default_value_t = 30, value_name = "INT")]
    granularity: u32,

    /// Bucket size on the observation axis, in ticks.
    #[clap(help_heading = "ANALYSIS", long, default_value_t = 30, value_name = "INT")]
    sampling: u32,

    /// Hours per tick.
    #[clap(help_heading = "ANALYSIS", long, default_value_t = 24, value_name = "INT")]
    tick_size: u32,

    /// Rename similarity threshold, 1-100.
    #[clap(help_heading = "ANALYSIS", short = 'M', long = "M", default_value_t = 80, value_name = "INT")]
    threshold: u32,

    /// Per-commit rename detection budget, in milliseconds.
    #[clap(help_heading = "ANALYSIS", long, default_value_t = 60_000, value_name = "MS")]
    renames_timeout: u64,

    /// Emit per-file matrices.
    #[clap(help_heading = "ANALYSIS", long, action)]
    files: bool,

    /// Emit per-developer matrices.
    #[clap(help_heading = "ANALYSIS", long, action)]
    people: bool,

    /// Emit co-occurrence matrices.
    #[clap(help_heading = "ANALYSIS", long, action)]
    couples: bool,

    /// Developer identity file: one `Name|email|email` line per identity.
    #[clap(help_heading = "ANALYSIS", long, value_name = "PATH")]
    people_dict: Option<PathBuf>,

    /// Explicit commit list, one hash per line, root first.
    #[clap(help_heading = "COMMIT LIMITING", long, value_name = "PATH")]
    commits: Option<PathBuf>,

    /// Follow only the first parent at merge commits.
    #[clap(help_heading = "COMMIT LIMITING", long, action)]
    first_parent: bool,

    /// Analyse only HEAD.
    #[clap(help_heading = "COMMIT LIMITING", long, action)]
    head: bool,

    /// Only process commits created after a specific date.
    ///
    /// Expected to be ISO 8601; may also be a duration such as `1year 6months`.
    #[clap(help_heading = "COMMIT LIMITING", long, value_name = "DATE")]
    since: Option<String>,

    /// Only process commits created before a specific date.
    ///
    /// Expected to be ISO 8601; may also be a duration such as `1year 6months`.
    #[clap(help_heading = "COMMIT LIMITING", long, value_name = "DATE")]
    until: Option<String>,

    /// Emit the framed binary document instead of text.
    #[clap(help_heading = "OUTPUT", long, action)]
    pb: bool,

    /// Apply the default path blacklist (vendor/, node_modules/, lockfiles).
    #[clap(help_heading = "FILTERING", long, action)]
    skip_blacklist: bool,

    /// Additional blacklisted path prefixes.
    #[clap(help_heading = "FILTERING", long, value_name = "LIST", use_value_delimiter = true)]
    blacklisted_prefixes: Vec<String>,

    /// Language allow-list; all languages when empty.
    #[clap(help_heading = "FILTERING", long, value_name = "LIST", use_value_delimiter = true)]
    languages: Vec<String>,

    /// Only analyse files whose path matches this regex.
    #[clap(help_heading = "FILTERING", long, value_name = "REGEX")]
    whitelist: Option<String>,

    /// Fail instead of substituting empty blobs for missing submodules.
    #[clap(help_heading = "FILTERING", long, action)]
    fail_on_missing_submodules: bool,
}

fn validate_time_input(cmd: &mut Command, input: String, argument: &'static str) -> OffsetDateTime {
    match parse_time_input(&input) {
        Some(datetime) => datetime,
        None => {
            let msg = format!(
                "The value ('{}') supplied to '{}' is not an ISO 8601 date or a duration.",
                &input, &argument
            );
            cmd.error(clap::ErrorKind::ValueValidation, msg).exit();
        }
    }
}

/// Open a local repository, or clone a URL into the cache directory (a
/// temporary directory when none is given).
fn open_repository(spec: &str, cache_dir: Option<&Path>) -> Result<(Repository, Option<TempDir>)> {
    let looks_remote = spec.contains("://")
        || (spec.contains('@') && spec.contains(':') && !Path::new(spec).exists());
    if !looks_remote {
        let repo = Repository::discover(spec)
            .context("failed to find a git repository at or above the provided path")?;
        return Ok((repo, None));
    }

    let name = spec
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("repository")
        .trim_end_matches(".git");
    let (target, guard) = match cache_dir {
        Some(dir) => (dir.join(format!("{}.git", name)), None),
        None => {
            let dir = tempfile::tempdir()?;
            (dir.path().join(format!("{}.git", name)), Some(dir))
        }
    };
    if target.exists() {
        log::info!("reusing cached clone at {}", target.display());
        return Ok((Repository::open(&target)?, guard));
    }
    log::info!("cloning {} into {}", spec, target.display());
    let start = Instant::now();
    let repo = git2::build::RepoBuilder::new()
        .bare(true)
        .clone(spec, &target)
        .with_context(|| format!("failed to clone {}", spec))?;
    log::info!("cloned in {}ms", start.elapsed().as_millis());
    Ok((repo, guard))
}

struct AnalysisConfig {
    tick_size_hours: u32,
    burndown: BurndownOptions,
    treediff: TreeDiffOptions,
    renames: RenameOptions,
    filediff: FileDiffOptions,
    couples: bool,
    fail_on_missing_submodules: bool,
    people_dict: Option<PathBuf>,
}

fn build_pipeline_items(
    config: AnalysisConfig,
) -> Result<(Vec<Box<dyn PipelineItem>>, PeopleHandle)> {
    let registry = match &config.people_dict {
        Some(path) => PeopleRegistry::from_dict(path)?,
        None => PeopleRegistry::auto(),
    };
    let registry: PeopleHandle = Rc::new(RefCell::new(registry));

    let mut items: Vec<Box<dyn PipelineItem>> = vec![
        Box::new(TickMapper::new(config.tick_size_hours)),
        Box::new(IdentityDetector::new(registry.clone())),
        Box::new(TreeDiff::new(config.treediff)),
        Box::new(BlobCache::new(config.fail_on_missing_submodules)),
        Box::new(RenameDetector::new(config.renames)),
        Box::new(FileDiff::new(config.filediff)),
        Box::new(BurndownAnalysis::new(config.burndown, registry.clone())),
    ];
    if config.couples {
        items.push(Box::new(CouplesAnalysis::new(registry.clone())));
    }
    Ok((items, registry))
}

fn main() -> Result<()> {
    let cli = <Cli as clap::Parser>::parse();
    env_logger::Builder::new().filter_level(cli.verbose.log_level_filter()).init();

    let mut cmd = Cli::command();
    if !(1..=100).contains(&cli.threshold) {
        cmd.error(clap::ErrorKind::ValueValidation, "-M must lie between 1 and 100").exit();
    }
    if cli.granularity == 0 || cli.sampling == 0 || cli.tick_size == 0 {
        cmd.error(
            clap::ErrorKind::ValueValidation,
            "--granularity, --sampling and --tick-size must be positive",
        )
        .exit();
    }
    let whitelist = cli.whitelist.as_deref().map(|pattern| match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => {
            let msg = format!("The value supplied to '--whitelist' is not a valid regex: {}", err);
            cmd.error(clap::ErrorKind::ValueValidation, msg).exit();
        }
    });
    let since = cli.since.clone().map(|s| validate_time_input(&mut cmd, s, "--since"));
    let until = cli.until.clone().map(|u| validate_time_input(&mut cmd, u, "--until"));

    let (repo, _clone_guard) = open_repository(&cli.repository, cli.cache_dir.as_deref())?;

    let mut walk = CommitWalk::new();
    walk.set_first_parent(cli.first_parent);
    walk.set_head_only(cli.head);
    if let Some(since) = since {
        walk.set_since(since);
    }
    if let Some(until) = until {
        walk.set_until(until);
    }
    if let Some(commits) = cli.commits.clone() {
        walk.set_commit_list(commits);
    }

    let start = Instant::now();
    let commits = walk.walk(&repo)?;
    log::info!("selected {} commits in {}ms", commits.len(), start.elapsed().as_millis());

    let blacklist_enabled = cli.skip_blacklist || !cli.blacklisted_prefixes.is_empty();
    let mut blacklist: Vec<String> = Vec::new();
    if cli.skip_blacklist {
        blacklist.extend(languages::default_blacklist().iter().map(|p| p.to_string()));
    }
    blacklist.extend(cli.blacklisted_prefixes.clone());

    let config = AnalysisConfig {
        tick_size_hours: cli.tick_size,
        burndown: BurndownOptionsBuilder::default()
            .granularity(cli.granularity)
            .sampling(cli.sampling)
            .track_files(cli.files)
            .track_people(cli.people)
            .build()?,
        treediff: TreeDiffOptionsBuilder::default()
            .blacklist_enabled(blacklist_enabled)
            .blacklist(blacklist)
            .languages(if cli.languages.is_empty() { None } else { Some(cli.languages.clone()) })
            .whitelist(whitelist)
            .build()?,
        renames: RenameOptions {
            threshold: cli.threshold,
            timeout: Duration::from_millis(cli.renames_timeout),
        },
        filediff: FileDiffOptionsBuilder::default().build()?,
        couples: cli.couples,
        fail_on_missing_submodules: cli.fail_on_missing_submodules,
        people_dict: cli.people_dict.clone(),
    };

    let (items, _registry) = build_pipeline_items(config)?;
    let pipeline = Pipeline::new(&repo, items)?;
    let reports = pipeline.run(&commits)?;

    let mut times = None;
    let mut burndown = None;
    let mut couples = None;
    for report in reports {
        match report {
            AnalysisReport::Times(t) => times = Some(t),
            AnalysisReport::Burndown(b) => burndown = Some(b),
            AnalysisReport::Couples(c) => couples = Some(c),
        }
    }
    let times = times.context("the tick mapper produced no timeline")?;
    let burndown = burndown.context("the burndown analysis produced no result")?;

    let header = OutputHeader {
        hash: commits.last().map(|oid| oid.to_string()).unwrap_or_default(),
        repository: cli.repository.clone(),
        begin_unix_time: times.begin_unix,
        end_unix_time: times.end_unix,
        commits: commits.len(),
        tick_size_hours: cli.tick_size,
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if cli.pb {
        render::render_binary(&mut out, &header, &burndown, couples.as_ref())?;
    } else {
        render::render_text(&mut out, &header, &burndown, couples.as_ref())?;
    }
    Ok(())
}
