use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::EngineError;

/// Sentinel value of the highest node in every tree: "past the end of the
/// file". The key of that node is the file length.
pub const TICK_END: u32 = u32::MAX;

/// Sentinel for "this line was born inside a merge which has not been
/// attributed yet". Real birth ticks must stay strictly below this value,
/// which also caps the tick portion of a person-packed value at 14 bits.
pub const TICK_MERGE_MARK: u32 = (1 << 14) - 1;

/// Merge marks are detected by mask so that person-packed values are caught
/// as well as raw ticks.
pub fn is_marked(value: u32) -> bool {
    value & TICK_MERGE_MARK == TICK_MERGE_MARK
}

/// Callback fed with `(current, previous, delta)` line accounting events.
pub type Emit<'a> = &'a mut dyn FnMut(u32, u32, i64);

const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
struct Node {
    key: u32,
    value: u32,
    left: u32,
    right: u32,
    parent: u32,
    height: u8,
}

impl Node {
    fn new(key: u32, value: u32) -> Self {
        Self { key, value, left: NIL, right: NIL, parent: NIL, height: 1 }
    }
}

/// Arena that owns every tree node of one branch. Nodes address each other by
/// index, so a tree handle stays valid in any bitwise copy of the arena. That
/// is what makes shallow clones O(1): copy the arena once per fork, then every
/// file tree is cloned by copying its root index.
#[derive(Clone, Debug, Default)]
pub struct Allocator {
    nodes: Vec<Node>,
    free: Vec<u32>,
}

pub type AllocHandle = Rc<RefCell<Allocator>>;

pub fn new_allocator() -> AllocHandle {
    Rc::new(RefCell::new(Allocator::default()))
}

impl Allocator {
    fn alloc(&mut self, key: u32, value: u32) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = Node::new(key, value);
                idx
            }
            None => {
                self.nodes.push(Node::new(key, value));
                (self.nodes.len() - 1) as u32
            }
        }
    }

    fn dealloc(&mut self, idx: u32) {
        self.free.push(idx);
    }

    /// Number of live nodes across all trees sharing this arena.
    #[allow(dead_code)]
    pub fn used(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

fn height(a: &Allocator, i: u32) -> i32 {
    if i == NIL {
        0
    } else {
        a.nodes[i as usize].height as i32
    }
}

fn fix_height(a: &mut Allocator, i: u32) {
    let h = 1 + height(a, a.nodes[i as usize].left).max(height(a, a.nodes[i as usize].right));
    a.nodes[i as usize].height = h as u8;
}

fn replace_child(a: &mut Allocator, parent: u32, old: u32, new: u32) {
    if parent == NIL {
        return;
    }
    let p = &mut a.nodes[parent as usize];
    if p.left == old {
        p.left = new;
    } else {
        p.right = new;
    }
}

fn rotate_left(a: &mut Allocator, x: u32) -> u32 {
    let y = a.nodes[x as usize].right;
    let t = a.nodes[y as usize].left;
    let p = a.nodes[x as usize].parent;
    a.nodes[x as usize].right = t;
    if t != NIL {
        a.nodes[t as usize].parent = x;
    }
    a.nodes[y as usize].left = x;
    a.nodes[x as usize].parent = y;
    a.nodes[y as usize].parent = p;
    replace_child(a, p, x, y);
    fix_height(a, x);
    fix_height(a, y);
    y
}

fn rotate_right(a: &mut Allocator, x: u32) -> u32 {
    let y = a.nodes[x as usize].left;
    let t = a.nodes[y as usize].right;
    let p = a.nodes[x as usize].parent;
    a.nodes[x as usize].left = t;
    if t != NIL {
        a.nodes[t as usize].parent = x;
    }
    a.nodes[y as usize].right = x;
    a.nodes[x as usize].parent = y;
    a.nodes[y as usize].parent = p;
    replace_child(a, p, x, y);
    fix_height(a, x);
    fix_height(a, y);
    y
}

fn rebalance(a: &mut Allocator, i: u32) -> u32 {
    fix_height(a, i);
    let (left, right) = (a.nodes[i as usize].left, a.nodes[i as usize].right);
    let balance = height(a, left) - height(a, right);
    if balance > 1 {
        let l = a.nodes[i as usize].left;
        if height(a, a.nodes[l as usize].left) < height(a, a.nodes[l as usize].right) {
            rotate_left(a, l);
        }
        return rotate_right(a, i);
    }
    if balance < -1 {
        let r = a.nodes[i as usize].right;
        if height(a, a.nodes[r as usize].right) < height(a, a.nodes[r as usize].left) {
            rotate_right(a, r);
        }
        return rotate_left(a, i);
    }
    i
}

/// Retrace from `i` up to the root, rebalancing, and return the new root.
fn retrace(a: &mut Allocator, start: u32, fallback_root: u32) -> u32 {
    let mut i = start;
    let mut root = fallback_root;
    while i != NIL {
        let ni = rebalance(a, i);
        let p = a.nodes[ni as usize].parent;
        if p == NIL {
            root = ni;
        }
        i = p;
    }
    root
}

fn insert(a: &mut Allocator, root: u32, key: u32, value: u32) -> (u32, u32) {
    let node = a.alloc(key, value);
    if root == NIL {
        return (node, node);
    }
    let mut cur = root;
    loop {
        let ck = a.nodes[cur as usize].key;
        debug_assert_ne!(ck, key, "duplicate key {} inserted", key);
        if key < ck {
            let l = a.nodes[cur as usize].left;
            if l == NIL {
                a.nodes[cur as usize].left = node;
                a.nodes[node as usize].parent = cur;
                break;
            }
            cur = l;
        } else {
            let r = a.nodes[cur as usize].right;
            if r == NIL {
                a.nodes[cur as usize].right = node;
                a.nodes[node as usize].parent = cur;
                break;
            }
            cur = r;
        }
    }
    (retrace(a, cur, root), node)
}

fn min_node(a: &Allocator, mut i: u32) -> u32 {
    if i == NIL {
        return NIL;
    }
    while a.nodes[i as usize].left != NIL {
        i = a.nodes[i as usize].left;
    }
    i
}

fn max_node(a: &Allocator, mut i: u32) -> u32 {
    if i == NIL {
        return NIL;
    }
    while a.nodes[i as usize].right != NIL {
        i = a.nodes[i as usize].right;
    }
    i
}

fn successor(a: &Allocator, i: u32) -> u32 {
    let r = a.nodes[i as usize].right;
    if r != NIL {
        return min_node(a, r);
    }
    let mut cur = i;
    let mut p = a.nodes[cur as usize].parent;
    while p != NIL && a.nodes[p as usize].right == cur {
        cur = p;
        p = a.nodes[cur as usize].parent;
    }
    p
}

fn predecessor(a: &Allocator, i: u32) -> u32 {
    let l = a.nodes[i as usize].left;
    if l != NIL {
        return max_node(a, l);
    }
    let mut cur = i;
    let mut p = a.nodes[cur as usize].parent;
    while p != NIL && a.nodes[p as usize].left == cur {
        cur = p;
        p = a.nodes[cur as usize].parent;
    }
    p
}

/// Largest key <= `key`, or NIL.
fn find_le(a: &Allocator, root: u32, key: u32) -> u32 {
    let mut res = NIL;
    let mut cur = root;
    while cur != NIL {
        if a.nodes[cur as usize].key <= key {
            res = cur;
            cur = a.nodes[cur as usize].right;
        } else {
            cur = a.nodes[cur as usize].left;
        }
    }
    res
}

/// Smallest key >= `key`, or NIL.
fn find_ge(a: &Allocator, root: u32, key: u32) -> u32 {
    let mut res = NIL;
    let mut cur = root;
    while cur != NIL {
        if a.nodes[cur as usize].key >= key {
            res = cur;
            cur = a.nodes[cur as usize].left;
        } else {
            cur = a.nodes[cur as usize].right;
        }
    }
    res
}

fn find_exact(a: &Allocator, root: u32, key: u32) -> u32 {
    let i = find_le(a, root, key);
    if i != NIL && a.nodes[i as usize].key == key {
        i
    } else {
        NIL
    }
}

fn delete(a: &mut Allocator, root: u32, idx: u32) -> u32 {
    let mut target = idx;
    // Two children: move the successor's payload here, unlink the successor.
    if a.nodes[target as usize].left != NIL && a.nodes[target as usize].right != NIL {
        let s = successor(a, target);
        let (sk, sv) = (a.nodes[s as usize].key, a.nodes[s as usize].value);
        a.nodes[target as usize].key = sk;
        a.nodes[target as usize].value = sv;
        target = s;
    }
    let left = a.nodes[target as usize].left;
    let child = if left != NIL { left } else { a.nodes[target as usize].right };
    let p = a.nodes[target as usize].parent;
    if child != NIL {
        a.nodes[child as usize].parent = p;
    }
    replace_child(a, p, target, child);
    a.dealloc(target);
    if p == NIL {
        if child == NIL {
            return NIL;
        }
        return retrace(a, child, child);
    }
    retrace(a, p, root)
}

fn delete_key(a: &mut Allocator, root: u32, key: u32) -> u32 {
    let idx = find_exact(a, root, key);
    debug_assert_ne!(idx, NIL, "key {} not present", key);
    delete(a, root, idx)
}

/// Remove the node at `key` when its predecessor carries the same value;
/// consecutive nodes must never agree.
fn coalesce_at(a: &mut Allocator, root: u32, key: u32) -> u32 {
    let idx = find_exact(a, root, key);
    if idx == NIL {
        return root;
    }
    let prev = predecessor(a, idx);
    if prev != NIL && a.nodes[prev as usize].value == a.nodes[idx as usize].value {
        return delete(a, root, idx);
    }
    root
}

/// Build a balanced tree from strictly increasing `(key, value)` pairs.
fn build_sorted(a: &mut Allocator, pairs: &[(u32, u32)], parent: u32) -> u32 {
    if pairs.is_empty() {
        return NIL;
    }
    let mid = pairs.len() / 2;
    let (key, value) = pairs[mid];
    let node = a.alloc(key, value);
    a.nodes[node as usize].parent = parent;
    let left = build_sorted(a, &pairs[..mid], node);
    let right = build_sorted(a, &pairs[mid + 1..], node);
    a.nodes[node as usize].left = left;
    a.nodes[node as usize].right = right;
    fix_height(a, node);
    node
}

/// Ordered map from line index to the birth value of the interval starting
/// there. Line `k` belongs to the node with the largest key <= `k`.
#[derive(Debug)]
pub struct Tree {
    alloc: AllocHandle,
    root: u32,
}

impl Tree {
    /// A file of `length` lines all born at `tick`.
    pub fn new(alloc: AllocHandle, tick: u32, length: u32) -> Self {
        let mut tree = Tree { alloc, root: NIL };
        {
            let mut guard = tree.alloc.borrow_mut();
            let a = &mut *guard;
            let (root, _) = insert(a, NIL, length, TICK_END);
            tree.root = root;
            if length > 0 {
                let (root, _) = insert(a, tree.root, 0, tick);
                tree.root = root;
            }
        }
        tree
    }

    /// Key of the maximum node, i.e. the number of lines.
    pub fn len(&self) -> u32 {
        if self.root == NIL {
            return 0;
        }
        let a = self.alloc.borrow();
        let m = max_node(&a, self.root);
        a.nodes[m as usize].key
    }

    /// O(1) handle copy into `alloc`, which must be a clone of this tree's
    /// arena (node indices carry over verbatim).
    pub fn clone_shallow(&self, alloc: AllocHandle) -> Self {
        Tree { alloc, root: self.root }
    }

    /// Full copy of the nodes into `alloc`.
    pub fn clone_deep(&self, alloc: AllocHandle) -> Self {
        let pairs = self.pairs();
        let mut tree = Tree { alloc, root: NIL };
        {
            let mut guard = tree.alloc.borrow_mut();
            tree.root = build_sorted(&mut guard, &pairs, NIL);
        }
        tree
    }

    /// Release every node back to the arena. The tree is unusable afterwards.
    pub fn dispose(&mut self) {
        let mut stack = vec![self.root];
        let mut guard = self.alloc.borrow_mut();
        let a = &mut *guard;
        while let Some(i) = stack.pop() {
            if i == NIL {
                continue;
            }
            stack.push(a.nodes[i as usize].left);
            stack.push(a.nodes[i as usize].right);
            a.dealloc(i);
        }
        self.root = NIL;
    }

    fn pairs(&self) -> Vec<(u32, u32)> {
        let a = self.alloc.borrow();
        let mut out = Vec::new();
        let mut i = min_node(&a, self.root);
        while i != NIL {
            out.push((a.nodes[i as usize].key, a.nodes[i as usize].value));
            i = successor(&a, i);
        }
        out
    }

    /// One value per line; the END node contributes nothing.
    pub fn flatten(&self) -> Vec<u32> {
        let pairs = self.pairs();
        let mut out = Vec::with_capacity(self.len() as usize);
        for w in pairs.windows(2) {
            let (k, v) = w[0];
            let next = w[1].0;
            out.extend(std::iter::repeat(v).take((next - k) as usize));
        }
        out
    }

    /// `key value` per line with the end sentinel printed as -1; the format
    /// the invariant-violation panics dump for post-mortems.
    #[allow(dead_code)]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (k, v) in self.pairs() {
            out.push_str(&format!("{} {}\n", k, v as i32));
        }
        out
    }

    /// Apply an edit replacing `del` lines at `pos` with `ins` lines born at
    /// `current`. Accounting events go to `emit` in the order: the insertion
    /// event first, then deletions in increasing key order.
    pub fn update(
        &mut self,
        current: u32,
        pos: u32,
        ins: u32,
        del: u32,
        emit: Emit,
    ) -> Result<(), EngineError> {
        let len = self.len();
        if pos > len || pos as u64 + del as u64 > len as u64 {
            return Err(EngineError::InvalidRange { pos, del, len });
        }
        if ins == 0 && del == 0 {
            return Ok(());
        }
        if ins > 0 {
            emit(current, current, ins as i64);
        }

        let mut guard = self.alloc.borrow_mut();
        let a = &mut *guard;
        let origin = find_le(a, self.root, pos);
        let (okey, oval) = (a.nodes[origin as usize].key, a.nodes[origin as usize].value);
        let value_before = if pos == 0 {
            None
        } else if okey < pos {
            Some(oval)
        } else {
            Some(a.nodes[predecessor(a, origin) as usize].value)
        };

        if del == 0 {
            // Insertion fast path: every key at or right of pos moves by
            // +ins, except an origin that already carries the new value (the
            // interval simply grows).
            let mut i = if okey < pos || oval == current { successor(a, origin) } else { origin };
            while i != NIL {
                a.nodes[i as usize].key += ins;
                i = successor(a, i);
            }
            if oval != current && value_before != Some(current) {
                let (root, _) = insert(a, self.root, pos, current);
                self.root = root;
                if okey < pos {
                    let (root, _) = insert(a, self.root, pos + ins, oval);
                    self.root = root;
                }
            }
            return Ok(());
        }

        // Deletion sweep: visit every interval overlapping [pos, pos+del),
        // account the overlap, and remember the value that continues past the
        // deleted range (if the last overlapped interval straddles its end).
        let end = pos + del;
        let mut straddle: Option<u32> = None;
        let mut doomed: Vec<u32> = Vec::new();
        let mut i = origin;
        loop {
            let k = a.nodes[i as usize].key;
            if k >= end {
                break;
            }
            let v = a.nodes[i as usize].value;
            let next = successor(a, i);
            if next == NIL {
                return Err(EngineError::InvalidRange { pos, del, len });
            }
            let nk = a.nodes[next as usize].key;
            let delta = nk.min(end) as i64 - k.max(pos) as i64;
            if delta > 0 {
                emit(current, v, -delta);
            }
            if k >= pos {
                doomed.push(k);
            }
            if nk > end {
                straddle = Some(v);
            }
            i = next;
        }
        for key in doomed {
            self.root = delete_key(a, self.root, key);
        }

        let shift = ins as i64 - del as i64;
        if shift != 0 {
            let mut i = find_ge(a, self.root, end);
            while i != NIL {
                let nk = (a.nodes[i as usize].key as i64 + shift) as u32;
                a.nodes[i as usize].key = nk;
                i = successor(a, i);
            }
        }

        if ins > 0 && value_before != Some(current) {
            let (root, _) = insert(a, self.root, pos, current);
            self.root = root;
        }
        match straddle {
            Some(tail) => {
                let anchor = pos + ins;
                let keep = if ins > 0 { current } else { value_before.unwrap_or(tail) };
                if tail != keep || (ins == 0 && value_before.is_none()) {
                    let (root, _) = insert(a, self.root, anchor, tail);
                    self.root = root;
                }
            }
            None => {
                // A survivor landed exactly on pos+ins; it may now repeat its
                // new neighbour.
                self.root = coalesce_at(a, self.root, pos + ins);
            }
        }
        self.root = coalesce_at(a, self.root, pos);
        Ok(())
    }

    /// N-way merge. Flattens every participant, resolves position by
    /// position (older value wins, merge marks lose to anything real), turns
    /// lingering marks into `day` with a +1 event each, and rebuilds.
    pub fn merge(&mut self, day: u32, others: &[&Tree], emit: Emit) -> Result<(), EngineError> {
        let mut lines = self.flatten();
        for other in others {
            let theirs = other.flatten();
            if theirs.len() != lines.len() {
                return Err(EngineError::InvalidMerge {
                    left: lines.len() as u32,
                    right: theirs.len() as u32,
                });
            }
            for (mine, their) in lines.iter_mut().zip(theirs) {
                if is_marked(*mine) {
                    *mine = their;
                } else if !is_marked(their) && their < *mine {
                    *mine = their;
                }
            }
        }
        for value in lines.iter_mut() {
            if is_marked(*value) {
                *value = day;
                emit(day, day, 1);
            }
        }
        self.rebuild(&lines);
        Ok(())
    }

    fn rebuild(&mut self, lines: &[u32]) {
        let mut pairs: Vec<(u32, u32)> = Vec::new();
        for (i, &v) in lines.iter().enumerate() {
            if pairs.last().map(|&(_, pv)| pv) != Some(v) {
                pairs.push((i as u32, v));
            }
        }
        pairs.push((lines.len() as u32, TICK_END));
        self.dispose();
        let mut guard = self.alloc.borrow_mut();
        self.root = build_sorted(&mut guard, &pairs, NIL);
    }

    /// Check the structural invariants. Intended for tests and post-mortems.
    #[allow(dead_code)]
    pub fn validate(&self) -> Result<(), String> {
        let pairs = self.pairs();
        let last = match pairs.last() {
            Some(&last) => last,
            None => return Err("empty tree".to_string()),
        };
        if pairs[0].0 != 0 {
            return Err(format!("minimum key is {}, not 0", pairs[0].0));
        }
        if last.1 != TICK_END {
            return Err(format!("maximum node carries {} instead of the end sentinel", last.1));
        }
        for w in pairs.windows(2) {
            if w[0].0 >= w[1].0 {
                return Err(format!("keys {} and {} out of order", w[0].0, w[1].0));
            }
            if w[0].1 == w[1].1 {
                return Err(format!("consecutive nodes {} and {} share a value", w[0].0, w[1].0));
            }
        }
        for &(key, value) in &pairs[..pairs.len() - 1] {
            if is_marked(value) {
                return Err(format!("merge mark left at key {}", key));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_emit() -> impl FnMut(u32, u32, i64) {
        |_, _, _| {}
    }

    #[test]
    fn new_tree_has_anchor_and_end() {
        let tree = Tree::new(new_allocator(), 0, 100);
        assert_eq!(tree.dump(), "0 0\n100 -1\n");
        assert_eq!(tree.len(), 100);
        tree.validate().unwrap();
    }

    #[test]
    fn empty_file_is_a_single_end_node() {
        let tree = Tree::new(new_allocator(), 7, 0);
        assert_eq!(tree.dump(), "0 -1\n");
        assert_eq!(tree.len(), 0);
        tree.validate().unwrap();
    }

    #[test]
    fn insert_into_empty_file() {
        let mut tree = Tree::new(new_allocator(), 0, 0);
        tree.update(3, 0, 10, 0, &mut no_emit()).unwrap();
        assert_eq!(tree.dump(), "0 3\n10 -1\n");
        tree.validate().unwrap();
    }

    #[test]
    fn update_out_of_range_is_rejected() {
        let mut tree = Tree::new(new_allocator(), 0, 10);
        assert!(matches!(
            tree.update(1, 11, 1, 0, &mut no_emit()),
            Err(EngineError::InvalidRange { .. })
        ));
        assert!(matches!(
            tree.update(1, 5, 0, 6, &mut no_emit()),
            Err(EngineError::InvalidRange { .. })
        ));
        // the failed calls must leave the tree untouched
        assert_eq!(tree.dump(), "0 0\n10 -1\n");
    }

    #[test]
    fn zero_update_is_a_noop() {
        let mut tree = Tree::new(new_allocator(), 0, 10);
        let mut events = 0;
        tree.update(5, 3, 0, 0, &mut |_, _, _| events += 1).unwrap();
        assert_eq!(events, 0);
        assert_eq!(tree.dump(), "0 0\n10 -1\n");
    }

    #[test]
    fn insert_at_start_of_same_tick_interval_grows_it() {
        let mut tree = Tree::new(new_allocator(), 0, 100);
        tree.update(1, 10, 10, 0, &mut no_emit()).unwrap();
        tree.update(1, 10, 5, 0, &mut no_emit()).unwrap();
        assert_eq!(tree.dump(), "0 0\n10 1\n25 0\n115 -1\n");
        tree.validate().unwrap();
    }

    #[test]
    fn append_with_predecessor_tick_does_not_split() {
        let mut tree = Tree::new(new_allocator(), 5, 10);
        tree.update(5, 10, 3, 0, &mut no_emit()).unwrap();
        assert_eq!(tree.dump(), "0 5\n13 -1\n");
        tree.validate().unwrap();
    }

    #[test]
    fn delete_whole_file_leaves_the_end_node() {
        let mut tree = Tree::new(new_allocator(), 4, 20);
        tree.update(9, 0, 0, 20, &mut no_emit()).unwrap();
        assert_eq!(tree.dump(), "0 -1\n");
        assert_eq!(tree.len(), 0);
        tree.validate().unwrap();
    }

    #[test]
    fn replace_whole_file() {
        let mut tree = Tree::new(new_allocator(), 4, 20);
        tree.update(9, 0, 5, 20, &mut no_emit()).unwrap();
        assert_eq!(tree.dump(), "0 9\n5 -1\n");
        tree.validate().unwrap();
    }

    #[test]
    fn deletion_bridging_equal_values_coalesces() {
        let mut tree = Tree::new(new_allocator(), 0, 100);
        tree.update(1, 10, 10, 0, &mut no_emit()).unwrap();
        // removing the whole foreign interval joins the 0-intervals around it
        tree.update(2, 10, 0, 10, &mut no_emit()).unwrap();
        assert_eq!(tree.dump(), "0 0\n100 -1\n");
        tree.validate().unwrap();
    }

    #[test]
    fn shallow_clone_shares_indices_deep_clone_copies() {
        let alloc = new_allocator();
        let mut tree = Tree::new(alloc.clone(), 0, 100);
        tree.update(1, 10, 10, 0, &mut no_emit()).unwrap();

        let forked = Rc::new(RefCell::new(alloc.borrow().clone()));
        let shallow = tree.clone_shallow(forked);
        assert_eq!(shallow.dump(), tree.dump());

        let deep = tree.clone_deep(new_allocator());
        assert_eq!(deep.dump(), tree.dump());

        // divergence after the fork must not leak across arenas
        tree.update(2, 0, 0, 50, &mut no_emit()).unwrap();
        assert_eq!(shallow.dump(), "0 0\n10 1\n20 0\n110 -1\n");
        assert_eq!(deep.dump(), "0 0\n10 1\n20 0\n110 -1\n");
    }

    #[test]
    fn dispose_recycles_nodes() {
        let alloc = new_allocator();
        let mut tree = Tree::new(alloc.clone(), 0, 100);
        tree.update(1, 10, 10, 0, &mut no_emit()).unwrap();
        let used = alloc.borrow().used();
        tree.dispose();
        assert_eq!(alloc.borrow().used(), used - 4);

        let other = Tree::new(alloc.clone(), 3, 7);
        assert_eq!(other.dump(), "0 3\n7 -1\n");
        assert!(alloc.borrow().used() <= used);
    }

    #[test]
    fn merge_prefers_the_older_value() {
        let mut left = Tree::new(new_allocator(), 3, 10);
        let right = Tree::new(new_allocator(), 1, 10);
        left.merge(5, &[&right], &mut no_emit()).unwrap();
        assert_eq!(left.dump(), "0 1\n10 -1\n");
    }

    #[test]
    fn merge_of_unequal_lengths_is_rejected() {
        let mut left = Tree::new(new_allocator(), 0, 10);
        let right = Tree::new(new_allocator(), 0, 11);
        assert!(matches!(
            left.merge(5, &[&right], &mut no_emit()),
            Err(EngineError::InvalidMerge { .. })
        ));
    }

    #[test]
    fn merge_resolves_marks_against_the_other_side() {
        let mut left = Tree::new(new_allocator(), 0, 30);
        let mut right = left.clone_deep(new_allocator());
        left.update(TICK_MERGE_MARK, 10, 10, 10, &mut no_emit()).unwrap();
        right.update(2, 10, 10, 10, &mut no_emit()).unwrap();
        let mut added = 0i64;
        left.merge(6, &[&right], &mut |_, _, d| added += d).unwrap();
        assert_eq!(left.dump(), "0 0\n10 2\n20 0\n30 -1\n");
        assert_eq!(added, 0);
        left.validate().unwrap();
    }

    #[test]
    fn lingering_marks_become_the_merge_day() {
        let mut left = Tree::new(new_allocator(), 0, 20);
        let mut right = left.clone_deep(new_allocator());
        left.update(TICK_MERGE_MARK, 5, 10, 0, &mut no_emit()).unwrap();
        right.update(TICK_MERGE_MARK, 5, 10, 0, &mut no_emit()).unwrap();
        let mut added = 0i64;
        left.merge(6, &[&right], &mut |c, p, d| {
            assert_eq!((c, p), (6, 6));
            added += d;
        })
        .unwrap();
        assert_eq!(added, 10);
        assert_eq!(left.dump(), "0 0\n5 6\n15 0\n30 -1\n");
        left.validate().unwrap();
    }

    // Reference model: one vector entry per line, edits by splice. The tree
    // must agree with it after any valid update sequence.
    #[derive(Clone)]
    struct NaiveFile {
        lines: Vec<u32>,
    }

    impl NaiveFile {
        fn new(tick: u32, length: u32) -> Self {
            Self { lines: vec![tick; length as usize] }
        }

        fn update(&mut self, current: u32, pos: u32, ins: u32, del: u32) {
            let pos = pos as usize;
            self.lines.drain(pos..pos + del as usize);
            self.lines.splice(pos..pos, std::iter::repeat(current).take(ins as usize));
        }
    }

    proptest! {
        #[test]
        fn updates_match_the_naive_model(
            initial_len in 0u32..200,
            ops in proptest::collection::vec((0u32..1000, 0u32..200, 0u32..8, 0u32..8), 0..60)
        ) {
            let mut tree = Tree::new(new_allocator(), 0, initial_len);
            let mut naive = NaiveFile::new(0, initial_len);
            let mut balance = initial_len as i64;

            for (tick, pos_seed, ins, del_seed) in ops {
                let len = tree.len();
                let pos = if len == 0 { 0 } else { pos_seed % (len + 1) };
                let del = del_seed.min(len - pos);
                tree.update(tick, pos, ins, del, &mut |_, _, d| balance += d).unwrap();
                naive.update(tick, pos, ins, del);

                prop_assert_eq!(tree.len() as usize, naive.lines.len());
                prop_assert_eq!(tree.flatten(), naive.lines.clone());
                prop_assert_eq!(balance, naive.lines.len() as i64);
                prop_assert!(tree.validate().is_ok(), "{}", tree.dump());
            }
        }
    }
}
