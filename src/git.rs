use std::path::{Path, PathBuf};

use git2::{Oid, Repository};

use crate::error::{MempackError, Result};

/// What the version-control probe learned about a path. `root` is always
/// set; the remaining fields are empty strings outside a repository.
#[derive(Debug, Clone, Default)]
pub struct RepoInfo {
    pub root: PathBuf,
    pub head: String,
    pub branch: String,
    pub origin: String,
    pub first_commit: String,
    pub is_vcs: bool,
}

/// Probe `start` for a git repository. Never fails on a plain directory:
/// outside version control the result carries only the canonicalized path.
pub fn detect(start: &Path) -> RepoInfo {
    let canonical = crate::identity::canonical_path(start);
    let Ok(repo) = Repository::discover(&canonical) else {
        return RepoInfo {
            root: canonical,
            ..RepoInfo::default()
        };
    };

    let root = repo
        .workdir()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| canonical.clone());

    let (head, branch) = match repo.head() {
        Ok(head_ref) => {
            let branch = if head_ref.is_branch() {
                head_ref.shorthand().unwrap_or_default().to_string()
            } else {
                String::new()
            };
            let sha = head_ref
                .peel_to_commit()
                .map(|c| c.id().to_string())
                .unwrap_or_default();
            (sha, branch)
        }
        Err(_) => (String::new(), String::new()),
    };

    let origin = repo
        .find_remote("origin")
        .ok()
        .and_then(|r| r.url().map(String::from))
        .unwrap_or_default();

    let first_commit = first_commit_sha(&repo).unwrap_or_default();

    RepoInfo {
        root: crate::identity::canonical_path(&root),
        head,
        branch,
        origin,
        first_commit,
        is_vcs: true,
    }
}

/// Oldest commit reachable from HEAD, used as a stable fallback identity
/// for repositories without an origin remote.
fn first_commit_sha(repo: &Repository) -> Option<String> {
    let mut revwalk = repo.revwalk().ok()?;
    revwalk.push_head().ok()?;
    revwalk
        .set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::REVERSE)
        .ok()?;
    let oid = revwalk.next()?.ok()?;
    Some(oid.to_string())
}

/// True when `ancestor` equals `descendant` or is reachable backwards from
/// it through the commit graph. Unknown commits resolve to `false`; any
/// other repository failure surfaces.
pub fn is_ancestor(root: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
    if ancestor == descendant {
        return Ok(true);
    }
    let repo = Repository::discover(root)?;
    let (anc, desc) = match (Oid::from_str(ancestor), Oid::from_str(descendant)) {
        (Ok(a), Ok(d)) => (a, d),
        _ => return Ok(false),
    };
    match repo.graph_descendant_of(desc, anc) {
        Ok(v) => Ok(v),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
        Err(e) => Err(MempackError::Vcs(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::fs;

    fn commit_all(repo: &Repository, message: &str) -> Oid {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@example.com").unwrap();
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap()
    }

    #[test]
    fn detect_outside_vcs_is_path_only() {
        let dir = tempfile::tempdir().unwrap();
        let info = detect(dir.path());
        assert!(!info.is_vcs);
        assert!(info.head.is_empty());
        assert!(info.origin.is_empty());
    }

    #[test]
    fn detect_reports_head_branch_and_first_commit() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        let first = commit_all(&repo, "first");
        fs::write(dir.path().join("b.txt"), "two").unwrap();
        let second = commit_all(&repo, "second");

        let info = detect(dir.path());
        assert!(info.is_vcs);
        assert_eq!(info.head, second.to_string());
        assert_eq!(info.first_commit, first.to_string());
        assert!(!info.branch.is_empty());
    }

    #[test]
    fn ancestry_follows_the_commit_graph() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        let first = commit_all(&repo, "first");
        fs::write(dir.path().join("b.txt"), "two").unwrap();
        let second = commit_all(&repo, "second");

        let root = dir.path();
        assert!(is_ancestor(root, &first.to_string(), &second.to_string()).unwrap());
        assert!(!is_ancestor(root, &second.to_string(), &first.to_string()).unwrap());
        assert!(is_ancestor(root, &first.to_string(), &first.to_string()).unwrap());
        // Unknown sha resolves to false rather than an error.
        assert!(!is_ancestor(root, &"0".repeat(40), &second.to_string()).unwrap());
    }
}
