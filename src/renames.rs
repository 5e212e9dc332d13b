use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use git2::Oid;
use similar::{capture_diff_slices_deadline, Algorithm, DiffOp, TextDiff};

use crate::blobs::{BlobMap, CachedBlob};
use crate::errors::EngineError;
use crate::pipeline::{dep, CommitContext, Deps, PipelineItem};
use crate::treediff::{ChangeStatus, TreeChange};

/// Blobs below this size carry too little signal for content similarity and
/// stay unmatched.
const MIN_BLOB_SIZE: u64 = 32;

/// Content comparison is skipped outright above this size.
const MAX_COMPARE_SIZE: u64 = 1 << 20;

/// Shortlist length per pivot, and its collapsed value for huge commits.
const MAX_CANDIDATES: usize = 50;
const HUGE_COMMIT: usize = 1000;

#[derive(Clone, Debug)]
pub struct RenameOptions {
    /// Similarity percentage two blobs must reach to count as a rename.
    pub threshold: u32,
    /// Per-commit budget; on expiry the partial pairing is used as-is.
    pub timeout: Duration,
}

impl Default for RenameOptions {
    fn default() -> Self {
        Self { threshold: 80, timeout: Duration::from_secs(60) }
    }
}

/// Pairs deleted and added blobs across one commit so that file moves keep
/// their line ages. Exact hash matches first; the rest is content similarity.
pub struct RenameDetector {
    opts: RenameOptions,
}

struct Candidate {
    /// Index into the original additions or deletions vector.
    slot: usize,
    oid: Oid,
    size: u64,
    base: String,
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn sizes_close(a: u64, b: u64, threshold: u32) -> bool {
    let max = a.max(b);
    let delta = a.abs_diff(b);
    delta * 10_000 <= (100 - threshold as u64) * 100 * max
}

fn char_counts_per_line(text: &str) -> Vec<u64> {
    text.split_inclusive('\n').map(|line| line.chars().count() as u64).collect()
}

/// Content similarity: the share of common runes in the larger blob for
/// text, the share of common bytes for binary.
fn blobs_close(a: &CachedBlob, b: &CachedBlob, threshold: u32, deadline: Instant) -> bool {
    let max_size = a.size().max(b.size());
    if max_size == 0 {
        return true;
    }
    if max_size > MAX_COMPARE_SIZE {
        return false;
    }

    if a.is_binary() || b.is_binary() {
        let ops = capture_diff_slices_deadline(Algorithm::Myers, &a.data, &b.data, Some(deadline));
        let common: u64 = ops
            .iter()
            .map(|op| match op {
                DiffOp::Equal { len, .. } => *len as u64,
                _ => 0,
            })
            .sum();
        return common * 100 >= threshold as u64 * max_size;
    }

    let text_a = a.text();
    let text_b = b.text();
    let lines_a = char_counts_per_line(&text_a);
    let runes_a: u64 = lines_a.iter().sum();
    let runes_b: u64 = char_counts_per_line(&text_b).iter().sum();
    let max_runes = runes_a.max(runes_b);
    if max_runes == 0 {
        return true;
    }
    // The common-rune count can never beat the smaller side; bail before
    // diffing when even that upper bound misses the threshold.
    if runes_a.min(runes_b) * 100 < threshold as u64 * max_runes {
        return false;
    }

    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .deadline(deadline)
        .diff_lines(text_a.as_ref(), text_b.as_ref());
    let common: u64 = diff
        .ops()
        .iter()
        .map(|op| match op {
            DiffOp::Equal { old_index, len, .. } => {
                lines_a[*old_index..old_index + len].iter().sum()
            }
            _ => 0,
        })
        .sum();
    common * 100 >= threshold as u64 * max_runes
}

/// One directional pass: for every pivot, shortlist the size-window of the
/// other side, order it by basename distance, and accept the first blob that
/// clears the similarity bar. Returns None when the opposite pass won the
/// race; checks the shared flag at every candidate boundary.
#[allow(clippy::too_many_arguments)]
fn scan(
    pivots: &[Candidate],
    others: &[Candidate],
    blobs: &BlobMap,
    threshold: u32,
    deadline: Instant,
    done: &AtomicBool,
    pivots_are_deletions: bool,
    cap: usize,
) -> Option<Vec<(usize, usize)>> {
    let mut pairs = Vec::new();
    let mut taken: HashSet<usize> = HashSet::new();
    for pivot in pivots {
        if done.load(Ordering::Relaxed) {
            return None;
        }
        if Instant::now() >= deadline {
            break;
        }
        // `others` is sorted by size; [size*t/100, size*100/t] brackets every
        // blob the exact window test can accept.
        let lo = pivot.size * threshold as u64 / 100;
        let hi = pivot.size.saturating_mul(100) / threshold as u64;
        let start = others.partition_point(|c| c.size < lo);
        let mut shortlist: Vec<&Candidate> = others[start..]
            .iter()
            .take_while(|c| c.size <= hi)
            .filter(|c| !taken.contains(&c.slot) && sizes_close(pivot.size, c.size, threshold))
            .collect();
        shortlist.sort_by_key(|c| strsim::levenshtein(&c.base, &pivot.base));
        shortlist.truncate(cap);
        for candidate in shortlist {
            if done.load(Ordering::Relaxed) {
                return None;
            }
            let (pb, cb) = match (blobs.get(&pivot.oid), blobs.get(&candidate.oid)) {
                (Some(pb), Some(cb)) => (pb, cb),
                _ => continue,
            };
            if blobs_close(pb, cb, threshold, deadline) {
                if pivots_are_deletions {
                    pairs.push((pivot.slot, candidate.slot));
                } else {
                    pairs.push((candidate.slot, pivot.slot));
                }
                taken.insert(candidate.slot);
                break;
            }
        }
    }
    if done.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
        Some(pairs)
    } else {
        None
    }
}

impl RenameDetector {
    pub fn new(opts: RenameOptions) -> Self {
        Self { opts }
    }

    fn candidates(changes: &[Option<TreeChange>], blobs: &BlobMap, added: bool) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = changes
            .iter()
            .enumerate()
            .filter_map(|(slot, change)| {
                let change = change.as_ref()?;
                let entry = if added { change.new.as_ref()? } else { change.old.as_ref()? };
                let size = blobs.get(&entry.oid).map(|b| b.size()).unwrap_or(0);
                if size < MIN_BLOB_SIZE {
                    return None;
                }
                Some(Candidate { slot, oid: entry.oid, size, base: basename(&entry.path) })
            })
            .collect();
        out.sort_by_key(|c| c.size);
        out
    }
}

impl PipelineItem for RenameDetector {
    fn name(&self) -> &'static str {
        "RenameDetector"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[dep::CHANGES]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[dep::TREE_CHANGES, dep::BLOB_CACHE]
    }

    fn consume(&mut self, _ctx: &CommitContext, deps: &mut Deps) -> Result<()> {
        let raw = deps.get::<Vec<TreeChange>>(dep::TREE_CHANGES)?;
        let blobs = deps.get::<BlobMap>(dep::BLOB_CACHE)?;

        let mut resolved: Vec<TreeChange> = Vec::new();
        let mut added: Vec<Option<TreeChange>> = Vec::new();
        let mut deleted: Vec<Option<TreeChange>> = Vec::new();
        for change in raw.iter() {
            match change.status {
                ChangeStatus::Modified => resolved.push(change.clone()),
                ChangeStatus::Added => added.push(Some(change.clone())),
                ChangeStatus::Deleted => deleted.push(Some(change.clone())),
            }
        }

        // Stage one: identical blobs are renames, no questions asked.
        let mut by_hash: HashMap<Oid, Vec<usize>> = HashMap::new();
        for (slot, change) in deleted.iter().enumerate() {
            if let Some(entry) = change.as_ref().and_then(|c| c.old.as_ref()) {
                by_hash.entry(entry.oid).or_default().push(slot);
            }
        }
        for add_slot in 0..added.len() {
            let oid = match added[add_slot].as_ref().and_then(|c| c.new.as_ref()) {
                Some(entry) => entry.oid,
                None => continue,
            };
            if let Some(del_slot) = by_hash.get_mut(&oid).and_then(|slots| slots.pop()) {
                let add = added[add_slot].take();
                let del = deleted[del_slot].take();
                if let (Some(add), Some(del)) = (add, del) {
                    resolved.push(TreeChange {
                        status: ChangeStatus::Modified,
                        old: del.old,
                        new: add.new,
                    });
                }
            }
        }

        // Stage two: similarity. Two symmetric passes race each other and the
        // first finisher's pairing wins; the loser aborts at the next
        // candidate boundary.
        let add_candidates = Self::candidates(&added, &blobs, true);
        let del_candidates = Self::candidates(&deleted, &blobs, false);
        if !add_candidates.is_empty() && !del_candidates.is_empty() {
            let total = add_candidates.len() + del_candidates.len();
            let cap = if total > HUGE_COMMIT { 1 } else { MAX_CANDIDATES };
            let deadline = Instant::now() + self.opts.timeout;
            let threshold = self.opts.threshold;
            let done = AtomicBool::new(false);
            let blob_map: &BlobMap = &blobs;

            let (forward, backward) = thread::scope(|s| {
                let forward = s.spawn(|| {
                    scan(&del_candidates, &add_candidates, blob_map, threshold, deadline, &done,
                        true, cap)
                });
                let backward = s.spawn(|| {
                    scan(&add_candidates, &del_candidates, blob_map, threshold, deadline, &done,
                        false, cap)
                });
                (forward.join(), backward.join())
            });
            let pairs = match (forward, backward) {
                (Ok(Some(pairs)), _) | (_, Ok(Some(pairs))) => pairs,
                _ => {
                    log::warn!("both rename scans failed; keeping additions and deletions");
                    Vec::new()
                }
            };
            if Instant::now() >= deadline {
                // partial results are fine, but the expiry is worth a trace
                log::warn!("{}", EngineError::BudgetExceeded(self.opts.timeout));
            }
            for (del_slot, add_slot) in pairs {
                let add = added[add_slot].take();
                let del = deleted[del_slot].take();
                if let (Some(add), Some(del)) = (add, del) {
                    resolved.push(TreeChange {
                        status: ChangeStatus::Modified,
                        old: del.old,
                        new: add.new,
                    });
                }
            }
        }

        // Stage three: whatever is left stays an insertion or a deletion.
        resolved.extend(added.into_iter().flatten());
        resolved.extend(deleted.into_iter().flatten());
        resolved.sort_by(|a, b| a.path().cmp(b.path()).then(a.status.cmp(&b.status)));
        deps.provide(dep::CHANGES, resolved);
        Ok(())
    }

    fn fork(&mut self) -> Box<dyn PipelineItem> {
        Box::new(Self { opts: self.opts.clone() })
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}
