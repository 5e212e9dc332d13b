use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use derive_new::new;
use similar::{Algorithm, DiffOp, TextDiff};

use crate::blobs::{BlobMap, CachedBlob};
use crate::pipeline::{dep, CommitContext, Deps, PipelineItem};
use crate::treediff::{ChangeStatus, TreeChange};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditKind {
    Equal,
    Insert,
    Delete,
}

#[derive(new, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edit {
    pub kind: EditKind,
    pub lines: u32,
}

/// Line-level edit script of one modified file.
#[derive(Clone, Debug, Default)]
pub struct FileDiffData {
    pub old_lines: u32,
    pub new_lines: u32,
    pub edits: Vec<Edit>,
}

pub type FileDiffs = HashMap<String, FileDiffData>;

#[derive(Builder, Clone, Debug)]
#[builder(default)]
pub struct FileDiffOptions {
    pub ignore_whitespace: bool,
    /// Per-commit ceiling; an expired diff degrades to a coarser but still
    /// well-formed script.
    pub timeout: Duration,
}

impl Default for FileDiffOptions {
    fn default() -> Self {
        Self { ignore_whitespace: false, timeout: Duration::from_secs(10) }
    }
}

/// Computes Myers line diffs for every modified file of a commit.
pub struct FileDiff {
    opts: FileDiffOptions,
}

impl FileDiff {
    pub fn new(opts: FileDiffOptions) -> Self {
        Self { opts }
    }

    fn normalize(&self, text: &str) -> String {
        if !self.opts.ignore_whitespace {
            return text.to_string();
        }
        let lines: Vec<String> = text
            .split_inclusive('\n')
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" ") + "\n")
            .collect();
        lines.concat()
    }

    /// The edit script between two texts, in line counts.
    pub fn diff_texts(&self, old: &str, new: &str, deadline: Instant) -> Vec<Edit> {
        let diff = TextDiff::configure()
            .algorithm(Algorithm::Myers)
            .deadline(deadline)
            .diff_lines(old, new);
        let mut edits = Vec::new();
        for op in diff.ops() {
            match *op {
                DiffOp::Equal { len, .. } => {
                    edits.push(Edit::new(EditKind::Equal, len as u32));
                }
                DiffOp::Delete { old_len, .. } => {
                    edits.push(Edit::new(EditKind::Delete, old_len as u32));
                }
                DiffOp::Insert { new_len, .. } => {
                    edits.push(Edit::new(EditKind::Insert, new_len as u32));
                }
                DiffOp::Replace { old_len, new_len, .. } => {
                    edits.push(Edit::new(EditKind::Delete, old_len as u32));
                    edits.push(Edit::new(EditKind::Insert, new_len as u32));
                }
            }
        }
        edits
    }

    fn diff_pair(&self, old: &CachedBlob, new: &CachedBlob, deadline: Instant) -> FileDiffData {
        let old_text = if old.is_binary() { String::new() } else { self.normalize(&old.text()) };
        let new_text = if new.is_binary() { String::new() } else { self.normalize(&new.text()) };
        FileDiffData {
            old_lines: old.line_count(),
            new_lines: new.line_count(),
            edits: self.diff_texts(&old_text, &new_text, deadline),
        }
    }
}

impl PipelineItem for FileDiff {
    fn name(&self) -> &'static str {
        "FileDiff"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[dep::FILE_DIFFS]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[dep::CHANGES, dep::BLOB_CACHE]
    }

    fn consume(&mut self, _ctx: &CommitContext, deps: &mut Deps) -> Result<()> {
        let changes = deps.get::<Vec<TreeChange>>(dep::CHANGES)?;
        let blobs = deps.get::<BlobMap>(dep::BLOB_CACHE)?;
        let deadline = Instant::now() + self.opts.timeout;

        let mut jobs: Vec<(String, Arc<CachedBlob>, Arc<CachedBlob>)> = Vec::new();
        for change in changes.iter() {
            if change.status != ChangeStatus::Modified {
                continue;
            }
            let (old, new) = match (&change.old, &change.new) {
                (Some(old), Some(new)) => (old, new),
                _ => continue,
            };
            if old.oid == new.oid {
                // pure rename, no content change to replay
                continue;
            }
            if let (Some(old_blob), Some(new_blob)) = (blobs.get(&old.oid), blobs.get(&new.oid)) {
                jobs.push((new.path.clone(), old_blob.clone(), new_blob.clone()));
            }
        }

        // CPU-bound; fan the commit's files over a bounded pool.
        let mut diffs: FileDiffs = HashMap::new();
        if jobs.len() <= 1 {
            for (path, old, new) in &jobs {
                diffs.insert(path.clone(), self.diff_pair(old, new, deadline));
            }
        } else {
            let this: &FileDiff = self;
            let workers = num_cpus::get().max(1).min(jobs.len());
            let chunk_size = (jobs.len() + workers - 1) / workers;
            let partials = thread::scope(|s| {
                let handles: Vec<_> = jobs
                    .chunks(chunk_size)
                    .map(|chunk| {
                        s.spawn(move || {
                            chunk
                                .iter()
                                .map(|(path, old, new)| {
                                    (path.clone(), this.diff_pair(old, new, deadline))
                                })
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join()).collect::<Vec<_>>()
            });
            for partial in partials {
                match partial {
                    Ok(part) => diffs.extend(part),
                    Err(_) => bail!("a file diff worker panicked"),
                }
            }
        }
        deps.provide(dep::FILE_DIFFS, diffs);
        Ok(())
    }

    fn fork(&mut self) -> Box<dyn PipelineItem> {
        Box::new(Self { opts: self.opts.clone() })
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn edit_script_for_a_replacement() {
        let differ = FileDiff::new(FileDiffOptions::default());
        let edits = differ.diff_texts("a\nb\nc\n", "a\nx\ny\nc\n", far_deadline());
        assert_eq!(
            edits,
            vec![
                Edit { kind: EditKind::Equal, lines: 1 },
                Edit { kind: EditKind::Delete, lines: 1 },
                Edit { kind: EditKind::Insert, lines: 2 },
                Edit { kind: EditKind::Equal, lines: 1 },
            ]
        );
    }

    #[test]
    fn whitespace_mode_hides_reindents() {
        let opts = FileDiffOptionsBuilder::default().ignore_whitespace(true).build().unwrap();
        let differ = FileDiff::new(opts);
        let old = differ.normalize("fn main() {\n    body();\n}\n");
        let new = differ.normalize("fn main() {\n\tbody();\n}\n");
        let edits = differ.diff_texts(&old, &new, far_deadline());
        assert_eq!(edits, vec![Edit { kind: EditKind::Equal, lines: 3 }]);
    }

    #[test]
    fn line_counts_are_preserved_by_normalization() {
        let opts = FileDiffOptionsBuilder::default().ignore_whitespace(true).build().unwrap();
        let differ = FileDiff::new(opts);
        assert_eq!(differ.normalize("a  b\nc\n").matches('\n').count(), 2);
    }
}
