use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use derive_new::new;
use git2::Oid;

use crate::errors::EngineError;
use crate::languages;
use crate::pipeline::{dep, CommitContext, Deps, PipelineItem};
use crate::treediff::TreeChange;

/// Blob bytes pinned in memory for the duration of one commit.
#[derive(new, Clone, Debug)]
pub struct CachedBlob {
    pub data: Vec<u8>,
}

impl CachedBlob {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_binary(&self) -> bool {
        languages::is_binary(&self.data)
    }

    pub fn text(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Number of lines as the line differ counts them; binary blobs are
    /// treated as empty.
    pub fn line_count(&self) -> u32 {
        if self.is_binary() {
            return 0;
        }
        self.data.split_inclusive(|&b| b == b'\n').count() as u32
    }
}

pub type BlobMap = HashMap<Oid, Arc<CachedBlob>>;

/// Loads both sides of every change into a map rebuilt from scratch each
/// commit, so memory stays bounded by the largest single diff. Blobs that
/// cannot be read (most commonly submodule pointers) become synthetic empty
/// blobs unless the fail switch is set.
pub struct BlobCache {
    fail_on_missing_submodules: bool,
}

impl BlobCache {
    pub fn new(fail_on_missing_submodules: bool) -> Self {
        Self { fail_on_missing_submodules }
    }
}

impl PipelineItem for BlobCache {
    fn name(&self) -> &'static str {
        "BlobCache"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[dep::BLOB_CACHE]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[dep::TREE_CHANGES]
    }

    fn consume(&mut self, ctx: &CommitContext, deps: &mut Deps) -> Result<()> {
        let changes = deps.get::<Vec<TreeChange>>(dep::TREE_CHANGES)?;
        let mut map: BlobMap = HashMap::new();
        for change in changes.iter() {
            for entry in change.old.iter().chain(change.new.iter()) {
                if map.contains_key(&entry.oid) {
                    continue;
                }
                let blob = match ctx.repo.find_blob(entry.oid) {
                    Ok(blob) => CachedBlob::new(blob.content().to_vec()),
                    Err(_) if !self.fail_on_missing_submodules => {
                        let kind = if entry.submodule { "submodule" } else { "object" };
                        log::warn!(
                            "substituting an empty blob for missing {} {} at {}",
                            kind,
                            entry.oid,
                            entry.path
                        );
                        CachedBlob::new(Vec::new())
                    }
                    Err(_) => {
                        return Err(EngineError::MissingObject {
                            oid: entry.oid.to_string(),
                            path: entry.path.clone(),
                        }
                        .into());
                    }
                };
                map.insert(entry.oid, Arc::new(blob));
            }
        }
        deps.provide(dep::BLOB_CACHE, map);
        Ok(())
    }

    fn fork(&mut self) -> Box<dyn PipelineItem> {
        Box::new(Self { fail_on_missing_submodules: self.fail_on_missing_submodules })
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{commit, temp_repo, T0};
    use crate::treediff::{ChangeEntry, ChangeStatus};

    fn missing_submodule_change() -> TreeChange {
        TreeChange {
            status: ChangeStatus::Added,
            old: None,
            new: Some(ChangeEntry {
                path: "lib/dependency".to_string(),
                oid: Oid::from_str("0123456789abcdef0123456789abcdef01234567").unwrap(),
                submodule: true,
            }),
        }
    }

    #[test]
    fn missing_submodule_is_fatal_when_the_switch_is_set() {
        let (_dir, repo) = temp_repo();
        let head = commit(&repo, &[], &[("f.txt", b"one\n")], T0, "Ada");
        let head = repo.find_commit(head).unwrap();
        let ctx = CommitContext {
            repo: &repo,
            commit: &head,
            parent: None,
            is_merge: false,
            is_primary: true,
        };
        let mut deps = Deps::new();
        deps.provide(dep::TREE_CHANGES, vec![missing_submodule_change()]);
        let err = BlobCache::new(true).consume(&ctx, &mut deps).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::MissingObject { .. })
        ));
    }

    #[test]
    fn missing_submodule_is_substituted_when_the_switch_is_off() {
        let (_dir, repo) = temp_repo();
        let head = commit(&repo, &[], &[("f.txt", b"one\n")], T0, "Ada");
        let head = repo.find_commit(head).unwrap();
        let ctx = CommitContext {
            repo: &repo,
            commit: &head,
            parent: None,
            is_merge: false,
            is_primary: true,
        };
        let mut deps = Deps::new();
        let change = missing_submodule_change();
        let oid = change.new.as_ref().unwrap().oid;
        deps.provide(dep::TREE_CHANGES, vec![change]);
        BlobCache::new(false).consume(&ctx, &mut deps).unwrap();
        let map = deps.get::<BlobMap>(dep::BLOB_CACHE).unwrap();
        assert_eq!(map[&oid].size(), 0);
    }

    #[test]
    fn line_counting() {
        let blob = CachedBlob { data: b"a\nb\nc\n".to_vec() };
        assert_eq!(blob.line_count(), 3);
        let unterminated = CachedBlob { data: b"a\nb".to_vec() };
        assert_eq!(unterminated.line_count(), 2);
        let empty = CachedBlob::new(Vec::new());
        assert_eq!(empty.line_count(), 0);
        let binary = CachedBlob { data: b"\x00\x01\x02".to_vec() };
        assert_eq!(binary.line_count(), 0);
    }
}
