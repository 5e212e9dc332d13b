use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use anyhow::Result;

use crate::identity::{PeopleHandle, AUTHOR_MISSING};
use crate::pipeline::{dep, AnalysisReport, CommitContext, Deps, PipelineItem};
use crate::treediff::{ChangeStatus, TreeChange};

#[derive(Default)]
struct CouplesState {
    /// path -> path -> number of commits touching both. The diagonal counts
    /// the commits touching the file at all.
    files: HashMap<String, HashMap<String, i64>>,
    /// person -> path -> touches.
    people_files: HashMap<u32, HashMap<String, i64>>,
    people_commits: HashMap<u32, i64>,
    alive: HashSet<String>,
}

/// Final co-occurrence matrices, trimmed to files alive at HEAD.
pub struct CouplesResult {
    pub file_index: Vec<String>,
    pub file_matrix: Vec<HashMap<usize, i64>>,
    pub people: Vec<String>,
    pub people_matrix: Vec<HashMap<usize, i64>>,
    pub people_commits: Vec<i64>,
}

/// Counts files edited in the same commit and developers touching the same
/// files. Shares one state across branches, so merge commits are only
/// counted on their primary pass.
pub struct CouplesAnalysis {
    state: Rc<RefCell<CouplesState>>,
    registry: PeopleHandle,
}

impl CouplesAnalysis {
    pub fn new(registry: PeopleHandle) -> Self {
        Self { state: Rc::new(RefCell::new(CouplesState::default())), registry }
    }
}

impl PipelineItem for CouplesAnalysis {
    fn name(&self) -> &'static str {
        "CouplesAnalysis"
    }

    fn requires(&self) -> &'static [&'static str] {
        &[dep::AUTHOR, dep::CHANGES]
    }

    fn consume(&mut self, ctx: &CommitContext, deps: &mut Deps) -> Result<()> {
        if !ctx.is_primary {
            return Ok(());
        }
        let author = *deps.get::<u32>(dep::AUTHOR)?;
        let changes = deps.get::<Vec<TreeChange>>(dep::CHANGES)?;
        let mut state = self.state.borrow_mut();

        let mut touched: Vec<String> = Vec::new();
        for change in changes.iter() {
            match change.status {
                ChangeStatus::Deleted => {
                    state.alive.remove(change.path());
                }
                ChangeStatus::Added => {
                    state.alive.insert(change.path().to_string());
                    touched.push(change.path().to_string());
                }
                ChangeStatus::Modified => {
                    let new_path = change.path().to_string();
                    if let Some(old) = &change.old {
                        if old.path != new_path {
                            // a rename drags the accumulated history along
                            state.alive.remove(&old.path);
                            state.alive.insert(new_path.clone());
                            migrate(&mut state, &old.path, &new_path);
                        }
                    }
                    touched.push(new_path);
                }
            }
        }

        for left in &touched {
            let row = state.files.entry(left.clone()).or_default();
            for right in &touched {
                *row.entry(right.clone()).or_insert(0) += 1;
            }
        }
        *state.people_commits.entry(author).or_insert(0) += 1;
        let person_row = state.people_files.entry(author).or_default();
        for path in &touched {
            *person_row.entry(path.clone()).or_insert(0) += 1;
        }
        Ok(())
    }

    fn fork(&mut self) -> Box<dyn PipelineItem> {
        Box::new(Self { state: self.state.clone(), registry: self.registry.clone() })
    }

    fn finalize(self: Box<Self>) -> Option<AnalysisReport> {
        let state = self.state.borrow();
        let mut file_index: Vec<String> = state.alive.iter().cloned().collect();
        file_index.sort();
        let slot: HashMap<&String, usize> =
            file_index.iter().enumerate().map(|(i, p)| (p, i)).collect();

        let mut file_matrix: Vec<HashMap<usize, i64>> = vec![HashMap::new(); file_index.len()];
        for (left, row) in &state.files {
            let li = match slot.get(left) {
                Some(&li) => li,
                None => continue,
            };
            for (right, &count) in row {
                if let Some(&ri) = slot.get(right) {
                    *file_matrix[li].entry(ri).or_insert(0) += count;
                }
            }
        }

        let people = self.registry.borrow().names();
        let mut people_matrix: Vec<HashMap<usize, i64>> = vec![HashMap::new(); people.len()];
        let mut people_commits = vec![0i64; people.len()];
        for (&person, row) in &state.people_files {
            if person == AUTHOR_MISSING || person as usize >= people.len() {
                continue;
            }
            for (path, &count) in row {
                if let Some(&fi) = slot.get(path) {
                    *people_matrix[person as usize].entry(fi).or_insert(0) += count;
                }
            }
        }
        for (&person, &count) in &state.people_commits {
            if person != AUTHOR_MISSING && (person as usize) < people_commits.len() {
                people_commits[person as usize] = count;
            }
        }

        Some(AnalysisReport::Couples(CouplesResult {
            file_index,
            file_matrix,
            people,
            people_matrix,
            people_commits,
        }))
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

fn migrate(state: &mut CouplesState, from: &str, to: &str) {
    if let Some(row) = state.files.remove(from) {
        let target = state.files.entry(to.to_string()).or_default();
        for (path, count) in row {
            *target.entry(path).or_insert(0) += count;
        }
    }
    for row in state.files.values_mut() {
        if let Some(count) = row.remove(from) {
            *row.entry(to.to_string()).or_insert(0) += count;
        }
    }
    let people: Vec<u32> = state.people_files.keys().copied().collect();
    for person in people {
        if let Some(row) = state.people_files.get_mut(&person) {
            if let Some(count) = row.remove(from) {
                *row.entry(to.to_string()).or_insert(0) += count;
            }
        }
    }
}
