use std::fs::read_to_string;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use git2::{Commit, Oid, Repository, Sort};
use time::format_description::well_known::Iso8601;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::errors::EngineError;

/// Selects the commit sequence to analyse, root first.
#[derive(Debug, Clone, Default)]
pub struct CommitWalk {
    first_parent: bool,
    head_only: bool,
    since: Option<OffsetDateTime>,
    until: Option<OffsetDateTime>,
    commit_list: Option<PathBuf>,
}

impl CommitWalk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_first_parent(&mut self, first_parent: bool) {
        self.first_parent = first_parent;
    }

    pub fn set_head_only(&mut self, head_only: bool) {
        self.head_only = head_only;
    }

    pub fn set_since(&mut self, since: OffsetDateTime) {
        self.since = Some(since);
    }

    pub fn set_until(&mut self, until: OffsetDateTime) {
        self.until = Some(until);
    }

    pub fn set_commit_list(&mut self, path: PathBuf) {
        self.commit_list = Some(path);
    }

    pub fn walk(&self, repo: &Repository) -> Result<Vec<Oid>> {
        if let Some(path) = &self.commit_list {
            return self.from_file(repo, path);
        }
        let head = repo
            .head()
            .context("repository has no HEAD to start from")?
            .peel_to_commit()?
            .id();
        if self.head_only {
            return Ok(vec![head]);
        }

        let mut revwalk = repo.revwalk()?;
        revwalk.push(head)?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME | Sort::REVERSE)?;
        if self.first_parent {
            revwalk.simplify_first_parent()?;
        }

        let mut oids = Vec::new();
        for oid in revwalk {
            let oid = oid?;
            if self.since.is_some() || self.until.is_some() {
                let commit = repo.find_commit(oid)?;
                let when = time_of(&commit)?;
                if self.since.map(|s| when < s).unwrap_or(false) {
                    continue;
                }
                if self.until.map(|u| when > u).unwrap_or(false) {
                    continue;
                }
            }
            oids.push(oid);
        }
        Ok(oids)
    }

    /// One hash per line, root first; the whole analysis follows the file.
    fn from_file(&self, repo: &Repository, path: &Path) -> Result<Vec<Oid>> {
        let text = read_to_string(path)
            .with_context(|| format!("reading commit list {}", path.display()))?;
        let mut oids = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let oid = Oid::from_str(line).map_err(|_| {
                EngineError::CorruptInput(format!(
                    "commit list {}:{} holds '{}' which is not a hash",
                    path.display(),
                    lineno + 1,
                    line
                ))
            })?;
            let commit = repo.find_commit(oid).map_err(|_| EngineError::MissingObject {
                oid: oid.to_string(),
                path: path.display().to_string(),
            })?;
            if let Some(&previous) = oids.last() {
                if !commit.parent_ids().any(|p| p == previous) {
                    return Err(EngineError::CorruptInput(format!(
                        "commit list {} is not a chain: {} does not follow {}",
                        path.display(),
                        oid,
                        previous
                    ))
                    .into());
                }
            }
            oids.push(oid);
        }
        Ok(oids)
    }
}

pub fn time_of(commit: &Commit) -> Result<OffsetDateTime> {
    let commit_time = commit.time();
    let datetime = OffsetDateTime::from_unix_timestamp(commit_time.seconds())?;
    let offset = UtcOffset::from_whole_seconds(commit_time.offset_minutes() * 60)?;
    Ok(datetime.replace_offset(offset))
}

/// ISO 8601 date or datetime, or a humantime duration counted back from now.
pub fn parse_time_input<S: AsRef<str>>(text: S) -> Option<OffsetDateTime> {
    if let Ok(datetime) = OffsetDateTime::parse(text.as_ref(), &Iso8601::PARSING) {
        return Some(datetime);
    }

    if let Ok(date) = Date::parse(text.as_ref(), &Iso8601::PARSING) {
        return Some(PrimitiveDateTime::new(date, Time::MIDNIGHT).assume_utc());
    }

    if let Ok(duration) = humantime::parse_duration(text.as_ref()) {
        return Some(OffsetDateTime::now_utc() - duration);
    }

    None
}
