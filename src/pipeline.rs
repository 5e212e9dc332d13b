use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use git2::{Commit, Oid, Repository};

use crate::burndown::BurndownResult;
use crate::couples::CouplesResult;
use crate::errors::EngineError;

/// Dependency tags exchanged between pipeline items.
pub mod dep {
    /// `u32` tick of the commit being consumed.
    pub const TICK: &str = "tick";
    /// `u32` canonical developer id of the commit author.
    pub const AUTHOR: &str = "author";
    /// `Vec<TreeChange>` raw tree diff against the branch parent.
    pub const TREE_CHANGES: &str = "tree_changes";
    /// `BlobMap` with the blobs of both sides of every change.
    pub const BLOB_CACHE: &str = "blob_cache";
    /// `Vec<TreeChange>` after rename detection.
    pub const CHANGES: &str = "changes";
    /// `HashMap<String, FileDiffData>` line-level edit scripts.
    pub const FILE_DIFFS: &str = "file_diffs";
}

/// Per-commit blackboard the items publish their results on. Values are
/// type-erased; `get` downcasts back to the concrete type.
#[derive(Default)]
pub struct Deps {
    map: HashMap<&'static str, Rc<dyn Any>>,
}

impl Deps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide<T: Any>(&mut self, tag: &'static str, value: T) {
        self.map.insert(tag, Rc::new(value));
    }

    pub fn get<T: Any>(&self, tag: &'static str) -> Result<Rc<T>> {
        let value = self
            .map
            .get(tag)
            .ok_or_else(|| anyhow!("dependency '{}' was not provided", tag))?;
        value
            .clone()
            .downcast::<T>()
            .map_err(|_| anyhow!("dependency '{}' carries an unexpected type", tag))
    }
}

/// Everything an item may look at while consuming one commit on one branch.
pub struct CommitContext<'a> {
    pub repo: &'a Repository,
    pub commit: &'a Commit<'a>,
    /// The parent this branch diffs against; `None` for the first commit.
    pub parent: Option<Oid>,
    /// True while a merge commit is applied per parent branch; tree updates
    /// then carry the merge mark instead of a real tick.
    pub is_merge: bool,
    /// Exactly one of the per-parent passes over a merge commit is primary;
    /// once-per-commit bookkeeping (couples, commit counts) keys off it.
    pub is_primary: bool,
}

/// Final product of an analyzer, handed to the renderer.
pub enum AnalysisReport {
    Times(crate::ticks::TimeSpan),
    Burndown(BurndownResult),
    Couples(CouplesResult),
}

impl std::fmt::Debug for dyn PipelineItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An analyzer or helper stage registered into the DAG. Items declare what
/// they publish and what they read; the pipeline orders them topologically
/// and clones them around branch forks.
pub trait PipelineItem {
    fn name(&self) -> &'static str;

    fn provides(&self) -> &'static [&'static str] {
        &[]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    fn initialize(&mut self, _repo: &Repository) -> Result<()> {
        Ok(())
    }

    fn consume(&mut self, ctx: &CommitContext, deps: &mut Deps) -> Result<()>;

    /// Clone this item for a new branch. State is shared or copied per item:
    /// interval trees go shallow against a cloned arena, registries are
    /// shared handles.
    fn fork(&mut self) -> Box<dyn PipelineItem>;

    /// Reconcile with the same item from sibling branches at a merge commit.
    fn merge(&mut self, _others: Vec<Box<dyn PipelineItem>>) -> Result<()> {
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Option<AnalysisReport> {
        None
    }

    /// Escape hatch for `merge`, which receives its siblings type-erased.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

type Branch = Vec<Box<dyn PipelineItem>>;

/// Order items so that every `requires` tag is published by an earlier item.
/// Kahn's algorithm over the provider graph; a leftover set means a cycle.
pub fn resolve_order(items: Branch) -> Result<Branch> {
    let mut provider: HashMap<&'static str, usize> = HashMap::new();
    for (i, item) in items.iter().enumerate() {
        for tag in item.provides() {
            if provider.insert(tag, i).is_some() {
                bail!("two pipeline items provide '{}'", tag);
            }
        }
    }

    let n = items.len();
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for (i, item) in items.iter().enumerate() {
        for tag in item.requires() {
            let p = *provider
                .get(tag)
                .ok_or_else(|| anyhow!("no item provides '{}' required by {}", tag, item.name()))?;
            edges[p].push(i);
            indegree[i] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(&i) = ready.iter().next() {
        ready.remove(&i);
        order.push(i);
        for &next in &edges[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert(next);
            }
        }
    }
    if order.len() != n {
        let stuck = items
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] > 0)
            .map(|(_, item)| item.name().to_string())
            .collect();
        return Err(EngineError::Cycle(stuck).into());
    }

    let mut slots: Vec<Option<Box<dyn PipelineItem>>> = items.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

fn fork_branch(branch: &mut Branch) -> Branch {
    branch.iter_mut().map(|item| item.fork()).collect()
}

fn consume_branch(branch: &mut Branch, ctx: &CommitContext) -> Result<()> {
    let mut deps = Deps::new();
    for item in branch.iter_mut() {
        item.consume(ctx, &mut deps)
            .with_context(|| format!("{} failed at commit {}", item.name(), ctx.commit.id()))?;
    }
    Ok(())
}

/// Walks the commit sequence, forking the item set where the branch DAG
/// diverges and merging it back at merge commits. One commit is fully
/// processed before the next begins.
pub struct Pipeline<'r> {
    repo: &'r Repository,
    items: Branch,
}

impl<'r> Pipeline<'r> {
    pub fn new(repo: &'r Repository, items: Branch) -> Result<Self> {
        let mut items = resolve_order(items)?;
        for item in items.iter_mut() {
            let name = item.name();
            item.initialize(repo).with_context(|| format!("initializing {}", name))?;
        }
        Ok(Self { repo, items })
    }

    pub fn run(self, commits: &[Oid]) -> Result<Vec<AnalysisReport>> {
        let Pipeline { repo, mut items } = self;
        if commits.is_empty() {
            bail!("no commits selected for analysis");
        }

        let position: HashMap<Oid, usize> =
            commits.iter().enumerate().map(|(i, &oid)| (oid, i)).collect();
        let mut parents_of: Vec<Vec<Oid>> = Vec::with_capacity(commits.len());
        let mut uses: HashMap<Oid, usize> = HashMap::new();
        for (i, &oid) in commits.iter().enumerate() {
            let commit = repo.find_commit(oid)?;
            let parents: Vec<Oid> =
                commit.parent_ids().filter(|p| position.contains_key(p)).collect();
            for parent in &parents {
                if position[parent] >= i {
                    return Err(EngineError::CorruptInput(format!(
                        "commit list is not topologically ordered: {} precedes its parent {}",
                        oid, parent
                    ))
                    .into());
                }
                *uses.entry(*parent).or_insert(0) += 1;
            }
            parents_of.push(parents);
        }

        // Extra root commits (orphan branches) need pristine item sets, so
        // fork those off before anything is consumed.
        let root_count = parents_of.iter().filter(|p| p.is_empty()).count();
        let mut spares: Vec<Branch> = (1..root_count).map(|_| fork_branch(&mut items)).collect();
        let mut pristine = Some(items);

        let started = Instant::now();
        let mut branches: HashMap<Oid, (Branch, usize)> = HashMap::new();
        for (index, &oid) in commits.iter().enumerate() {
            let commit = repo.find_commit(oid)?;
            let parents = &parents_of[index];
            let branch = match parents.len() {
                0 => match pristine.take() {
                    Some(branch) => branch,
                    None => spares
                        .pop()
                        .ok_or_else(|| anyhow!("ran out of root branches at {}", oid))?,
                },
                1 => Self::claim(&mut branches, parents[0])?,
                _ => {
                    let mut parts: Vec<Branch> = parents
                        .iter()
                        .map(|p| Self::claim(&mut branches, *p))
                        .collect::<Result<_>>()?;
                    for (i, (part, parent)) in parts.iter_mut().zip(parents).enumerate() {
                        let ctx = CommitContext {
                            repo,
                            commit: &commit,
                            parent: Some(*parent),
                            is_merge: true,
                            is_primary: i == 0,
                        };
                        consume_branch(part, &ctx)?;
                    }
                    let mut main = parts.remove(0);
                    let mut slots: Vec<Branch> = (0..main.len()).map(|_| Vec::new()).collect();
                    for part in parts {
                        for (i, item) in part.into_iter().enumerate() {
                            slots[i].push(item);
                        }
                    }
                    for (item, others) in main.iter_mut().zip(slots) {
                        item.merge(others).with_context(|| {
                            format!("{} failed to merge at commit {}", item.name(), oid)
                        })?;
                    }
                    branches.insert(oid, (main, uses.get(&oid).copied().unwrap_or(0)));
                    continue;
                }
            };

            let mut branch = branch;
            let ctx = CommitContext {
                repo,
                commit: &commit,
                parent: parents.first().copied(),
                is_merge: false,
                is_primary: true,
            };
            consume_branch(&mut branch, &ctx)?;
            branches.insert(oid, (branch, uses.get(&oid).copied().unwrap_or(0)));

            if (index + 1) % 1000 == 0 {
                log::info!("processed {}/{} commits", index + 1, commits.len());
            }
        }
        log::info!(
            "processed {} commits in {}ms",
            commits.len(),
            started.elapsed().as_millis()
        );

        let head = commits[commits.len() - 1];
        let (final_branch, _) = branches
            .remove(&head)
            .ok_or_else(|| anyhow!("no branch state left for head commit {}", head))?;
        Ok(final_branch.into_iter().filter_map(|item| item.finalize()).collect())
    }

    fn claim(branches: &mut HashMap<Oid, (Branch, usize)>, parent: Oid) -> Result<Branch> {
        match branches.remove(&parent) {
            Some((branch, remaining)) if remaining <= 1 => Ok(branch),
            Some((mut branch, remaining)) => {
                let fork = fork_branch(&mut branch);
                branches.insert(parent, (branch, remaining - 1));
                Ok(fork)
            }
            None => bail!("branch state missing for parent {}", parent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        name: &'static str,
        provides: &'static [&'static str],
        requires: &'static [&'static str],
    }

    impl PipelineItem for Fake {
        fn name(&self) -> &'static str {
            self.name
        }

        fn provides(&self) -> &'static [&'static str] {
            self.provides
        }

        fn requires(&self) -> &'static [&'static str] {
            self.requires
        }

        fn consume(&mut self, _ctx: &CommitContext, _deps: &mut Deps) -> Result<()> {
            Ok(())
        }

        fn fork(&mut self) -> Box<dyn PipelineItem> {
            Box::new(Fake { name: self.name, provides: self.provides, requires: self.requires })
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    fn fake(
        name: &'static str,
        provides: &'static [&'static str],
        requires: &'static [&'static str],
    ) -> Box<dyn PipelineItem> {
        Box::new(Fake { name, provides, requires })
    }

    #[test]
    fn orders_by_dependencies() {
        let items = vec![
            fake("sink", &[], &["b", "a"]),
            fake("b", &["b"], &["a"]),
            fake("a", &["a"], &[]),
        ];
        let ordered = resolve_order(items).unwrap();
        let names: Vec<_> = ordered.iter().map(|i| i.name()).collect();
        assert_eq!(names, vec!["a", "b", "sink"]);
    }

    #[test]
    fn missing_provider_is_an_error() {
        let items = vec![fake("sink", &[], &["nope"])];
        let err = resolve_order(items).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn cycle_is_fatal() {
        let items = vec![fake("x", &["x"], &["y"]), fake("y", &["y"], &["x"])];
        let err = resolve_order(items).unwrap_err();
        let engine = err.downcast_ref::<EngineError>();
        assert!(matches!(engine, Some(EngineError::Cycle(_))));
    }

    #[test]
    fn deps_roundtrip_and_type_check() {
        let mut deps = Deps::new();
        deps.provide(dep::TICK, 41u32);
        assert_eq!(*deps.get::<u32>(dep::TICK).unwrap(), 41);
        assert!(deps.get::<String>(dep::TICK).is_err());
        assert!(deps.get::<u32>(dep::AUTHOR).is_err());
    }
}
