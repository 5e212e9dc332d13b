use std::rc::Rc;

use crate::errors::EngineError;
use crate::tree::{is_marked, AllocHandle, Tree};

/// Receives `(current, previous, delta)` whenever the line accounting of a
/// file changes. Updaters are shared by reference so that forked file handles
/// keep feeding the same accumulators.
pub type Updater = Rc<dyn Fn(u32, u32, i64)>;

/// A tracked file: an interval tree plus the updaters interested in it.
pub struct File {
    tree: Tree,
    updaters: Vec<Updater>,
}

fn emit_to(updaters: &[Updater], current: u32, previous: u32, delta: i64) {
    if delta == 0 || is_marked(current) || is_marked(previous) {
        return;
    }
    for updater in updaters {
        updater(current, previous, delta);
    }
}

impl File {
    /// A new file of `length` lines born at `value`. The birth is announced
    /// to the updaters as a single `+length` event.
    pub fn new(alloc: AllocHandle, value: u32, length: u32, updaters: Vec<Updater>) -> Self {
        let file = File { tree: Tree::new(alloc, value, length), updaters };
        emit_to(&file.updaters, value, value, length as i64);
        file
    }

    pub fn len(&self) -> u32 {
        self.tree.len()
    }

    pub fn update(&mut self, value: u32, pos: u32, ins: u32, del: u32) -> Result<(), EngineError> {
        let File { tree, updaters } = self;
        tree.update(value, pos, ins, del, &mut |c, p, d| emit_to(updaters, c, p, d))
    }

    /// Reconcile this file with its copies from other branches; lines still
    /// carrying the merge mark afterwards are attributed to `value`.
    pub fn merge(&mut self, value: u32, others: &[&File]) -> Result<(), EngineError> {
        let File { tree, updaters } = self;
        let trees: Vec<&Tree> = others.iter().map(|f| &f.tree).collect();
        tree.merge(value, &trees, &mut |c, p, d| emit_to(updaters, c, p, d))
    }

    pub fn clone_shallow(&self, alloc: AllocHandle) -> Self {
        File { tree: self.tree.clone_shallow(alloc), updaters: self.updaters.clone() }
    }

    pub fn clone_deep(&self, alloc: AllocHandle) -> Self {
        File { tree: self.tree.clone_deep(alloc), updaters: self.updaters.clone() }
    }

    /// Release the tree nodes. Called when the file is deleted from the
    /// repository or its branch is discarded.
    pub fn dispose(&mut self) {
        self.tree.dispose();
    }

    #[allow(dead_code)]
    pub fn dump(&self) -> String {
        self.tree.dump()
    }

    #[allow(dead_code)]
    pub fn validate(&self) -> Result<(), String> {
        self.tree.validate()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use super::*;
    use crate::tree::{new_allocator, TICK_MERGE_MARK};

    type Status = Rc<RefCell<HashMap<u32, i64>>>;

    // Keyed by the previous (birth) tick, the way the burndown accumulator
    // consumes these events.
    fn fixture(tick: u32, length: u32) -> (File, Status) {
        let status: Status = Rc::new(RefCell::new(HashMap::new()));
        let recorder = status.clone();
        let updater: Updater = Rc::new(move |_current, previous, delta| {
            *recorder.borrow_mut().entry(previous).or_insert(0) += delta;
        });
        let file = File::new(new_allocator(), tick, length, vec![updater]);
        (file, status)
    }

    fn status_of(status: &Status, tick: u32) -> i64 {
        status.borrow().get(&tick).copied().unwrap_or(0)
    }

    #[test]
    fn pure_insert() {
        let (mut file, status) = fixture(0, 100);
        file.update(1, 10, 10, 0).unwrap();
        assert_eq!(file.dump(), "0 0\n10 1\n20 0\n110 -1\n");
        assert_eq!(status_of(&status, 0), 100);
        assert_eq!(status_of(&status, 1), 10);
        file.validate().unwrap();
    }

    #[test]
    fn overlap_delete() {
        let (mut file, status) = fixture(0, 100);
        file.update(1, 10, 10, 0).unwrap();
        file.update(2, 15, 0, 10).unwrap();
        assert_eq!(file.dump(), "0 0\n10 1\n15 0\n100 -1\n");
        assert_eq!(status_of(&status, 0), 95);
        assert_eq!(status_of(&status, 1), 5);
        file.validate().unwrap();
    }

    #[test]
    fn torture_sequence() {
        let (mut file, status) = fixture(0, 100);
        file.update(1, 20, 30, 0).unwrap();
        file.update(2, 20, 0, 5).unwrap();
        file.update(3, 20, 0, 5).unwrap();
        file.update(4, 20, 10, 0).unwrap();
        file.update(5, 45, 0, 10).unwrap();
        file.update(6, 45, 5, 0).unwrap();
        file.update(7, 10, 0, 50).unwrap();
        file.update(8, 0, 10, 10).unwrap();
        assert_eq!(file.dump(), "0 8\n10 0\n75 -1\n");
        assert_eq!(status_of(&status, 0), 65);
        assert_eq!(status_of(&status, 8), 10);
        for tick in 1..8 {
            assert_eq!(status_of(&status, tick), 0, "tick {}", tick);
        }
        file.validate().unwrap();
    }

    #[test]
    fn accounting_matches_length() {
        let (mut file, status) = fixture(0, 100);
        file.update(1, 20, 30, 0).unwrap();
        file.update(2, 50, 5, 40).unwrap();
        file.update(3, 0, 0, 10).unwrap();
        let total: i64 = status.borrow().values().sum();
        assert_eq!(total, file.len() as i64);
    }

    #[test]
    fn zero_update_touches_nothing() {
        let (mut file, status) = fixture(0, 100);
        file.update(5, 30, 0, 0).unwrap();
        assert_eq!(file.dump(), "0 0\n100 -1\n");
        assert_eq!(status.borrow().len(), 1);
    }

    #[test]
    fn merge_mark_is_invisible_to_updaters() {
        let (mut file, status) = fixture(0, 100);
        file.update(1, 20, 30, 0).unwrap();
        file.update(2, 20, 0, 5).unwrap();
        file.update(3, 20, 0, 5).unwrap();
        file.update(4, 20, 10, 0).unwrap();
        file.update(TICK_MERGE_MARK, 60, 20, 20).unwrap();
        assert_eq!(file.dump(), "0 0\n20 4\n30 1\n50 0\n60 16383\n80 0\n130 -1\n");
        assert!(!status.borrow().contains_key(&TICK_MERGE_MARK));
    }

    #[test]
    fn two_branch_merge() {
        let (mut file1, status) = fixture(0, 100);
        file1.update(1, 20, 30, 0).unwrap();
        file1.update(2, 20, 0, 5).unwrap();
        file1.update(3, 20, 0, 5).unwrap();
        file1.update(4, 20, 10, 0).unwrap();
        // fork, then apply the merge commit's edit on both sides: one branch
        // keeps it pending, the other resolves it to a real tick
        let mut file2 = file1.clone_deep(new_allocator());
        file1.update(TICK_MERGE_MARK, 60, 30, 30).unwrap();
        file2.update(TICK_MERGE_MARK, 60, 30, 30).unwrap();
        file2.update(5, 60, 20, 20).unwrap();
        file1.merge(7, &[&file2]).unwrap();
        assert_eq!(file1.dump(), "0 0\n20 4\n30 1\n50 0\n60 5\n80 7\n90 0\n130 -1\n");
        assert_eq!(status_of(&status, 7), 10);
        file1.validate().unwrap();
    }

    #[test]
    fn merge_is_commutative() {
        let build = |first: u32, second: u32| {
            let (mut a, _) = fixture(0, 60);
            let mut b = a.clone_deep(new_allocator());
            let mut c = a.clone_deep(new_allocator());
            a.update(TICK_MERGE_MARK, 0, 10, 10).unwrap();
            b.update(TICK_MERGE_MARK, 0, 10, 10).unwrap();
            c.update(TICK_MERGE_MARK, 0, 10, 10).unwrap();
            b.update(first, 0, 10, 10).unwrap();
            c.update(second, 0, 10, 10).unwrap();
            (a, b, c)
        };
        let (mut a1, b1, c1) = build(3, 5);
        a1.merge(9, &[&b1, &c1]).unwrap();
        let (mut a2, b2, c2) = build(3, 5);
        a2.merge(9, &[&c2, &b2]).unwrap();
        assert_eq!(a1.dump(), a2.dump());
        assert_eq!(a1.dump(), "0 3\n10 0\n60 -1\n");
    }

    #[test]
    fn shallow_fork_diverges_cleanly() {
        let alloc = new_allocator();
        let mut file1 = File::new(alloc.clone(), 0, 100, Vec::new());
        file1.update(1, 10, 10, 0).unwrap();
        // fork against a cloned arena the way the pipeline does it
        let forked = Rc::new(RefCell::new(alloc.borrow().clone()));
        let snapshot = file1.clone_shallow(forked);
        file1.update(2, 0, 50, 110).unwrap();
        assert_eq!(snapshot.dump(), "0 0\n10 1\n20 0\n110 -1\n");
        assert_eq!(file1.dump(), "0 2\n50 -1\n");
        snapshot.validate().unwrap();
    }
}
