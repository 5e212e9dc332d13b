use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};

use crate::blobs::BlobMap;
use crate::file::{File, Updater};
use crate::filediff::{EditKind, FileDiffData, FileDiffs};
use crate::identity::{PeopleHandle, AUTHOR_MISSING};
use crate::pipeline::{dep, AnalysisReport, CommitContext, Deps, PipelineItem};
use crate::tree::{new_allocator, AllocHandle, TICK_MERGE_MARK};
use crate::treediff::{ChangeStatus, TreeChange};

/// Developer ids ride in the tree value above the tick bits.
const PERSON_SHIFT: u32 = 14;

fn pack(person: u32, tick: u32) -> u32 {
    (person << PERSON_SHIFT) | tick
}

fn unpack_tick(value: u32) -> u32 {
    value & TICK_MERGE_MARK
}

fn unpack_person(value: u32) -> u32 {
    value >> PERSON_SHIFT
}

/// Rows indexed by sampling band, each row a sparse map from granularity band
/// to a signed live-line count. New rows start as a copy of the previous one
/// (carry-forward), so a row is always a complete snapshot.
#[derive(Clone, Debug, Default)]
pub struct SparseHistory {
    rows: Vec<HashMap<u32, i64>>,
}

impl SparseHistory {
    fn ensure_row(&mut self, sample: u32) {
        while self.rows.len() <= sample as usize {
            let carried = self.rows.last().cloned().unwrap_or_default();
            self.rows.push(carried);
        }
    }

    fn add(&mut self, sample: u32, band: u32, delta: i64) {
        self.ensure_row(sample);
        *self.rows[sample as usize].entry(band).or_insert(0) += delta;
    }

    /// Dense `(rows, cols)` matrix; trailing samples repeat the last row.
    fn to_dense(&self, rows: u32, cols: u32) -> Vec<Vec<i64>> {
        let mut out = vec![vec![0i64; cols as usize]; rows as usize];
        if self.rows.is_empty() {
            return out;
        }
        for (r, row) in out.iter_mut().enumerate() {
            let src = &self.rows[r.min(self.rows.len() - 1)];
            for (&band, &count) in src {
                if band < cols {
                    row[band as usize] = count;
                }
            }
        }
        out
    }
}

type FileHistory = Rc<RefCell<SparseHistory>>;

#[derive(Default)]
struct BurndownState {
    global: SparseHistory,
    files: HashMap<String, FileHistory>,
    people: HashMap<u32, SparseHistory>,
    /// (victim, editor) -> lines of victim removed by editor; the diagonal
    /// holds self-insertions.
    interaction: HashMap<(u32, u32), i64>,
    max_tick: u32,
}

#[derive(Builder, Clone, Debug)]
#[builder(default)]
pub struct BurndownOptions {
    /// Bucket size on the birth axis, in ticks.
    pub granularity: u32,
    /// Bucket size on the observation axis, in ticks.
    pub sampling: u32,
    pub track_files: bool,
    pub track_people: bool,
}

impl Default for BurndownOptions {
    fn default() -> Self {
        Self { granularity: 30, sampling: 30, track_files: false, track_people: false }
    }
}

/// Dense matrices produced at finalization. Cells are signed verbatim; any
/// clamping is the text renderer's business.
pub struct BurndownResult {
    pub granularity: u32,
    pub sampling: u32,
    pub project: Vec<Vec<i64>>,
    pub files: BTreeMap<String, Vec<Vec<i64>>>,
    pub people: Vec<(String, Vec<Vec<i64>>)>,
    /// `(n+1) x (n+1)`; the extra slot collects unmatched authors.
    pub people_interaction: Vec<Vec<i64>>,
}

/// The burndown accumulator. Owns the per-branch interval trees and feeds
/// their events into sparse 2-D histories; forks share the histories and
/// deep-copy the arena.
pub struct BurndownAnalysis {
    opts: BurndownOptions,
    registry: PeopleHandle,
    state: Rc<RefCell<BurndownState>>,
    alloc: AllocHandle,
    files: HashMap<String, File>,
    tick: u32,
    author: u32,
    merge_touched: HashSet<String>,
    merge_deleted: HashSet<String>,
}

impl BurndownAnalysis {
    pub fn new(opts: BurndownOptions, registry: PeopleHandle) -> Self {
        Self {
            opts,
            registry,
            state: Rc::new(RefCell::new(BurndownState::default())),
            alloc: new_allocator(),
            files: HashMap::new(),
            tick: 0,
            author: 0,
            merge_touched: HashSet::new(),
            merge_deleted: HashSet::new(),
        }
    }

    fn person(&self) -> Result<u32> {
        if !self.opts.track_people {
            return Ok(0);
        }
        if self.author > AUTHOR_MISSING {
            bail!("developer id {} exceeds the supported identity range", self.author);
        }
        Ok(self.author)
    }

    fn build_updaters(&self, path: &str) -> Vec<Updater> {
        let granularity = self.opts.granularity;
        let sampling = self.opts.sampling;
        let mut updaters: Vec<Updater> = Vec::new();

        let state = self.state.clone();
        updaters.push(Rc::new(move |current, previous, delta| {
            let mut state = state.borrow_mut();
            let tick = unpack_tick(current);
            state.max_tick = state.max_tick.max(tick);
            state.global.add(tick / sampling, unpack_tick(previous) / granularity, delta);
        }));

        if self.opts.track_files {
            let history: FileHistory = Rc::new(RefCell::new(SparseHistory::default()));
            self.state.borrow_mut().files.insert(path.to_string(), history.clone());
            updaters.push(Rc::new(move |current, previous, delta| {
                history.borrow_mut().add(
                    unpack_tick(current) / sampling,
                    unpack_tick(previous) / granularity,
                    delta,
                );
            }));
        }

        if self.opts.track_people {
            let state = self.state.clone();
            updaters.push(Rc::new(move |current, previous, delta| {
                let victim = unpack_person(previous);
                if victim != AUTHOR_MISSING {
                    let mut state = state.borrow_mut();
                    let row = unpack_tick(current) / sampling;
                    let column = unpack_tick(previous) / granularity;
                    state.people.entry(victim).or_default().add(row, column, delta);
                }
            }));

            let state = self.state.clone();
            updaters.push(Rc::new(move |current, previous, delta| {
                let editor = unpack_person(current);
                let victim = unpack_person(previous);
                let mut state = state.borrow_mut();
                if delta > 0 {
                    *state.interaction.entry((editor, editor)).or_insert(0) += delta;
                } else if victim != editor {
                    *state.interaction.entry((victim, editor)).or_insert(0) -= delta;
                }
            }));
        }
        updaters
    }

    fn handle_insertion(&mut self, value: u32, change: &TreeChange, blobs: &BlobMap) -> Result<()> {
        let entry = match &change.new {
            Some(entry) => entry,
            None => return Ok(()),
        };
        if self.files.contains_key(&entry.path) {
            bail!("file {} is already tracked", entry.path);
        }
        let lines = blobs.get(&entry.oid).map(|b| b.line_count()).unwrap_or(0);
        let updaters = self.build_updaters(&entry.path);
        let file = File::new(self.alloc.clone(), value, lines, updaters);
        self.files.insert(entry.path.clone(), file);
        Ok(())
    }

    fn handle_deletion(&mut self, value: u32, path: &str) -> Result<()> {
        let mut file = self
            .files
            .remove(path)
            .ok_or_else(|| anyhow!("deletion of untracked file {}", path))?;
        let length = file.len();
        file.update(value, 0, 0, length)?;
        file.dispose();
        if self.opts.track_files {
            self.state.borrow_mut().files.remove(path);
        }
        Ok(())
    }

    fn handle_modification(
        &mut self,
        value: u32,
        change: &TreeChange,
        diffs: &FileDiffs,
    ) -> Result<()> {
        let (old, new) = match (&change.old, &change.new) {
            (Some(old), Some(new)) => (old, new),
            _ => return Ok(()),
        };
        if old.path != new.path {
            let file = self
                .files
                .remove(&old.path)
                .ok_or_else(|| anyhow!("rename of untracked file {}", old.path))?;
            self.files.insert(new.path.clone(), file);
            if self.opts.track_files {
                let mut state = self.state.borrow_mut();
                if let Some(history) = state.files.remove(&old.path) {
                    state.files.insert(new.path.clone(), history);
                }
            }
        }
        if old.oid == new.oid {
            return Ok(());
        }
        let diff = match diffs.get(&new.path) {
            Some(diff) => diff,
            None => {
                log::warn!("no diff available for {}; content change skipped", new.path);
                return Ok(());
            }
        };
        let file = self
            .files
            .get_mut(&new.path)
            .ok_or_else(|| anyhow!("modification of untracked file {}", new.path))?;
        if file.len() != diff.old_lines {
            bail!(
                "file {} is {} lines but its diff starts from {}",
                new.path,
                file.len(),
                diff.old_lines
            );
        }
        apply_edits(file, value, diff)?;
        debug_assert_eq!(file.len(), diff.new_lines);
        Ok(())
    }
}

/// Replay an edit script onto the interval tree, pairing each deletion with
/// the insertion that replaces it so both land in a single update.
fn apply_edits(file: &mut File, value: u32, diff: &FileDiffData) -> Result<()> {
    let mut position = 0u32;
    let mut pending_deletion = 0u32;
    for edit in &diff.edits {
        match edit.kind {
            EditKind::Equal => {
                if pending_deletion > 0 {
                    file.update(value, position, 0, pending_deletion)?;
                    pending_deletion = 0;
                }
                position += edit.lines;
            }
            EditKind::Delete => {
                pending_deletion += edit.lines;
            }
            EditKind::Insert => {
                file.update(value, position, edit.lines, pending_deletion)?;
                pending_deletion = 0;
                position += edit.lines;
            }
        }
    }
    if pending_deletion > 0 {
        file.update(value, position, 0, pending_deletion)?;
    }
    Ok(())
}

impl PipelineItem for BurndownAnalysis {
    fn name(&self) -> &'static str {
        "BurndownAnalysis"
    }

    fn requires(&self) -> &'static [&'static str] {
        &[dep::TICK, dep::AUTHOR, dep::CHANGES, dep::FILE_DIFFS, dep::BLOB_CACHE]
    }

    fn consume(&mut self, ctx: &CommitContext, deps: &mut Deps) -> Result<()> {
        self.tick = *deps.get::<u32>(dep::TICK)?;
        self.author = *deps.get::<u32>(dep::AUTHOR)?;
        let changes = deps.get::<Vec<TreeChange>>(dep::CHANGES)?;
        let diffs = deps.get::<FileDiffs>(dep::FILE_DIFFS)?;
        let blobs = deps.get::<BlobMap>(dep::BLOB_CACHE)?;

        let person = self.person()?;
        let value = if ctx.is_merge {
            pack(person, TICK_MERGE_MARK)
        } else {
            pack(person, self.tick)
        };
        {
            let mut state = self.state.borrow_mut();
            state.max_tick = state.max_tick.max(self.tick);
            let sample = self.tick / self.opts.sampling;
            state.global.ensure_row(sample);
        }

        for change in changes.iter() {
            match change.status {
                ChangeStatus::Added => {
                    self.handle_insertion(value, change, &blobs)?;
                    if ctx.is_merge {
                        self.merge_touched.insert(change.path().to_string());
                    }
                }
                ChangeStatus::Deleted => {
                    let path = change.path().to_string();
                    if ctx.is_merge {
                        // replayed with the real tick once the branches merge
                        self.merge_deleted.insert(path);
                    } else {
                        self.handle_deletion(value, &path)?;
                    }
                }
                ChangeStatus::Modified => {
                    self.handle_modification(value, change, &diffs)?;
                    if ctx.is_merge {
                        self.merge_touched.insert(change.path().to_string());
                    }
                }
            }
        }
        Ok(())
    }

    fn fork(&mut self) -> Box<dyn PipelineItem> {
        let alloc = Rc::new(RefCell::new(self.alloc.borrow().clone()));
        let files = self
            .files
            .iter()
            .map(|(path, file)| (path.clone(), file.clone_shallow(alloc.clone())))
            .collect();
        Box::new(Self {
            opts: self.opts.clone(),
            registry: self.registry.clone(),
            state: self.state.clone(),
            alloc,
            files,
            tick: self.tick,
            author: self.author,
            merge_touched: self.merge_touched.clone(),
            merge_deleted: self.merge_deleted.clone(),
        })
    }

    fn merge(&mut self, others: Vec<Box<dyn PipelineItem>>) -> Result<()> {
        let mut siblings: Vec<BurndownAnalysis> = Vec::new();
        for other in others {
            match other.into_any().downcast::<Self>() {
                Ok(other) => siblings.push(*other),
                Err(_) => bail!("burndown merged with a different item kind"),
            }
        }

        let person = self.person()?;
        let value = pack(person, self.tick);

        let mut touched = std::mem::take(&mut self.merge_touched);
        let mut deleted = std::mem::take(&mut self.merge_deleted);
        for sibling in &mut siblings {
            touched.extend(std::mem::take(&mut sibling.merge_touched));
            deleted.extend(std::mem::take(&mut sibling.merge_deleted));
        }

        for path in &touched {
            if deleted.contains(path) {
                continue;
            }
            if !self.files.contains_key(path) {
                // created on a sibling branch only; adopt its copy first
                if let Some(theirs) = siblings.iter().find_map(|s| s.files.get(path)) {
                    let adopted = theirs.clone_deep(self.alloc.clone());
                    self.files.insert(path.clone(), adopted);
                } else {
                    continue;
                }
            }
            let counterparts: Vec<&File> =
                siblings.iter().filter_map(|s| s.files.get(path)).collect();
            if let Some(file) = self.files.get_mut(path) {
                file.merge(value, &counterparts)?;
            }
        }
        for path in &deleted {
            if self.files.contains_key(path) {
                self.handle_deletion(value, path)?;
            }
        }
        // siblings drop here, taking their arenas with them
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Option<AnalysisReport> {
        let state = self.state.borrow();
        let rows = state.max_tick / self.opts.sampling + 1;
        let cols = state.max_tick / self.opts.granularity + 1;

        let project = state.global.to_dense(rows, cols);
        let mut files = BTreeMap::new();
        if self.opts.track_files {
            for (path, history) in &state.files {
                files.insert(path.clone(), history.borrow().to_dense(rows, cols));
            }
        }

        let mut people = Vec::new();
        let mut people_interaction = Vec::new();
        if self.opts.track_people {
            let names = self.registry.borrow().names();
            for (id, name) in names.iter().enumerate() {
                let matrix = state
                    .people
                    .get(&(id as u32))
                    .map(|h| h.to_dense(rows, cols))
                    .unwrap_or_else(|| vec![vec![0; cols as usize]; rows as usize]);
                people.push((name.clone(), matrix));
            }
            let side = names.len() + 1;
            people_interaction = vec![vec![0i64; side]; side];
            for (&(victim, editor), &count) in &state.interaction {
                let v = (victim as usize).min(side - 1);
                let e = (editor as usize).min(side - 1);
                people_interaction[v][e] += count;
            }
        }

        Some(AnalysisReport::Burndown(BurndownResult {
            granularity: self.opts.granularity,
            sampling: self.opts.sampling,
            project,
            files,
            people,
            people_interaction,
        }))
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}
