use anyhow::Result;
use git2::{Delta, DiffFile, DiffOptions, ObjectType, Oid, TreeWalkMode, TreeWalkResult};
use regex::Regex;

use crate::errors::EngineError;
use crate::languages;
use crate::pipeline::{dep, CommitContext, Deps, PipelineItem};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeStatus {
    Added,
    #[default]
    Modified,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEntry {
    pub path: String,
    pub oid: Oid,
    pub submodule: bool,
}

/// One file-level edit in a commit: `{old, new}` blob entries. Renames show
/// up as `Modified` with differing paths after the rename detector ran.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeChange {
    pub status: ChangeStatus,
    pub old: Option<ChangeEntry>,
    pub new: Option<ChangeEntry>,
}

impl TreeChange {
    /// The path the change is filed under: the new side if it exists.
    pub fn path(&self) -> &str {
        match (&self.new, &self.old) {
            (Some(entry), _) | (None, Some(entry)) => &entry.path,
            (None, None) => "",
        }
    }
}

#[derive(Builder, Clone, Debug, Default)]
#[builder(default)]
pub struct TreeDiffOptions {
    /// Apply the default path blacklist plus any custom prefixes.
    pub blacklist_enabled: bool,
    pub blacklist: Vec<String>,
    /// Allow-list of language names; `None` admits everything.
    pub languages: Option<Vec<String>>,
    pub whitelist: Option<Regex>,
}

/// Produces the `{old, new}` blob pairs between each commit and its branch
/// parent. The first commit of a branch walk is synthesized as an all-insert
/// diff of its tree.
pub struct TreeDiff {
    opts: TreeDiffOptions,
    previous: Option<Oid>,
}

impl TreeDiff {
    pub fn new(opts: TreeDiffOptions) -> Self {
        Self { opts, previous: None }
    }

    fn entry(file: &DiffFile) -> Option<ChangeEntry> {
        if file.id().is_zero() {
            return None;
        }
        let path = file.path()?.to_string_lossy().to_string();
        Some(ChangeEntry {
            path,
            oid: file.id(),
            submodule: file.mode() == git2::FileMode::Commit,
        })
    }

    fn passes(&self, ctx: &CommitContext, change: &TreeChange) -> bool {
        let path = change.path();
        if self.opts.blacklist_enabled && is_blacklisted(path, &self.opts.blacklist) {
            return false;
        }
        if let Some(whitelist) = &self.opts.whitelist {
            if !whitelist.is_match(path) {
                return false;
            }
        }
        if let Some(allowed) = &self.opts.languages {
            let entry = change.new.as_ref().or(change.old.as_ref());
            let language = entry.and_then(|e| {
                let blob = ctx.repo.find_blob(e.oid).ok()?;
                let head = &blob.content()[..blob.content().len().min(1024)];
                languages::detect(path, head)
            });
            match language {
                Some(lang) if allowed.iter().any(|a| a.eq_ignore_ascii_case(lang)) => {}
                _ => return false,
            }
        }
        true
    }
}

fn is_blacklisted(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| {
        path.starts_with(prefix.as_str())
            || (prefix.ends_with('/') && path.contains(&format!("/{}", prefix)))
    })
}

impl PipelineItem for TreeDiff {
    fn name(&self) -> &'static str {
        "TreeDiff"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[dep::TREE_CHANGES]
    }

    fn consume(&mut self, ctx: &CommitContext, deps: &mut Deps) -> Result<()> {
        let mut changes: Vec<TreeChange> = Vec::new();
        match ctx.parent {
            None => {
                // Synthesize an all-insert diff for the first commit.
                let tree = ctx.commit.tree()?;
                tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
                    if entry.kind() != Some(ObjectType::Blob) {
                        return TreeWalkResult::Ok;
                    }
                    let name = match entry.name() {
                        Some(name) => name,
                        None => return TreeWalkResult::Ok,
                    };
                    changes.push(TreeChange {
                        status: ChangeStatus::Added,
                        old: None,
                        new: Some(ChangeEntry {
                            path: format!("{}{}", dir, name),
                            oid: entry.id(),
                            submodule: false,
                        }),
                    });
                    TreeWalkResult::Ok
                })?;
            }
            Some(parent) => {
                if let Some(previous) = self.previous {
                    if previous != parent {
                        return Err(EngineError::CorruptInput(format!(
                            "commit chain broken: {} does not follow {}",
                            ctx.commit.id(),
                            previous
                        ))
                        .into());
                    }
                }
                let old_tree = ctx.repo.find_commit(parent)?.tree()?;
                let new_tree = ctx.commit.tree()?;
                let mut opts = DiffOptions::new();
                opts.ignore_filemode(true);
                opts.include_typechange(true);
                opts.context_lines(0);
                let diff = ctx.repo.diff_tree_to_tree(
                    Some(&old_tree),
                    Some(&new_tree),
                    Some(&mut opts),
                )?;
                for delta in diff.deltas() {
                    let status = match delta.status() {
                        Delta::Added => ChangeStatus::Added,
                        Delta::Deleted => ChangeStatus::Deleted,
                        Delta::Modified | Delta::Typechange => ChangeStatus::Modified,
                        other => {
                            log::warn!("skipping unsupported diff status {:?}", other);
                            continue;
                        }
                    };
                    let old = Self::entry(&delta.old_file());
                    let new = Self::entry(&delta.new_file());
                    if old.is_none() && new.is_none() {
                        continue;
                    }
                    changes.push(TreeChange { status, old, new });
                }
            }
        }
        self.previous = Some(ctx.commit.id());

        let mut kept: Vec<TreeChange> =
            changes.into_iter().filter(|c| self.passes(ctx, c)).collect();
        kept.sort_by(|a, b| a.path().cmp(b.path()));
        deps.provide(dep::TREE_CHANGES, kept);
        Ok(())
    }

    fn fork(&mut self) -> Box<dyn PipelineItem> {
        Box::new(Self { opts: self.opts.clone(), previous: self.previous })
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_prefix_matching() {
        let prefixes: Vec<String> =
            languages::default_blacklist().iter().map(|p| p.to_string()).collect();
        assert!(is_blacklisted("vendor/lib.go", &prefixes));
        assert!(is_blacklisted("web/node_modules/x/index.js", &prefixes));
        assert!(is_blacklisted("package-lock.json", &prefixes));
        assert!(!is_blacklisted("src/vendored.rs", &prefixes));
    }

    #[test]
    fn options_builder_defaults_admit_everything() {
        let opts = TreeDiffOptionsBuilder::default().build().unwrap();
        assert!(!opts.blacklist_enabled);
        assert!(opts.languages.is_none());
        assert!(opts.whitelist.is_none());
    }
}
