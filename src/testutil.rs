use git2::{Commit, Oid, Repository, Signature, Time};
use tempfile::TempDir;

pub fn temp_repo() -> (TempDir, Repository) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    (dir, repo)
}

/// Commit a full snapshot of flat file names. Returns the new commit id;
/// point HEAD at the last one with [`set_head`].
pub fn commit(
    repo: &Repository,
    parents: &[Oid],
    files: &[(&str, &[u8])],
    when: i64,
    author: &str,
) -> Oid {
    let mut builder = repo.treebuilder(None).unwrap();
    for (path, data) in files {
        let blob = repo.blob(data).unwrap();
        builder.insert(*path, blob, 0o100644).unwrap();
    }
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();
    let email = format!("{}@example.com", author.to_lowercase());
    let signature = Signature::new(author, &email, &Time::new(when, 0)).unwrap();
    let parent_commits: Vec<Commit> =
        parents.iter().map(|oid| repo.find_commit(*oid).unwrap()).collect();
    let parent_refs: Vec<&Commit> = parent_commits.iter().collect();
    repo.commit(None, &signature, &signature, "snapshot", &tree, &parent_refs).unwrap()
}

pub fn set_head(repo: &Repository, oid: Oid) {
    repo.reference("refs/heads/master", oid, true, "test").unwrap();
    repo.set_head("refs/heads/master").unwrap();
}

pub const DAY: i64 = 24 * 3600;
pub const T0: i64 = 1_600_000_000;
