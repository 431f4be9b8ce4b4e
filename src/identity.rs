use std::path::{Component, Path, PathBuf};

use crate::git::RepoInfo;
use crate::hash::short_hash;

const ID_HEX_LEN: usize = 8;

/// Where a repository id came from. Reported by the health surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    Origin,
    RootFirstCommit,
    PathOnly,
}

impl IdSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Origin => "origin",
            Self::RootFirstCommit => "root+first_commit",
            Self::PathOnly => "path",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepoIdentity {
    pub repo_id: String,
    pub source: IdSource,
}

/// Derive the stable repository id.
///
/// Preference order: origin URL, then `(root, first_commit)`, then the
/// canonical path alone. Version-controlled repos get an `r_` prefix,
/// plain directories `p_`.
pub fn repo_id(info: &RepoInfo) -> RepoIdentity {
    if !info.origin.is_empty() {
        return RepoIdentity {
            repo_id: format!("r_{}", short_hash(&info.origin, ID_HEX_LEN)),
            source: IdSource::Origin,
        };
    }
    if info.is_vcs && !info.first_commit.is_empty() {
        let key = format!("{}:{}", info.root.display(), info.first_commit);
        return RepoIdentity {
            repo_id: format!("r_{}", short_hash(&key, ID_HEX_LEN)),
            source: IdSource::RootFirstCommit,
        };
    }
    let canonical = canonical_path(&info.root);
    RepoIdentity {
        repo_id: format!("p_{}", short_hash(&canonical.to_string_lossy(), ID_HEX_LEN)),
        source: IdSource::PathOnly,
    }
}

/// Best-effort symlink-resolving absolute form of `path`.
///
/// If the full path exists it is fully resolved. Otherwise the deepest
/// existing ancestor is resolved and the unresolved tail re-joined. Never
/// fails; the cleaned input comes back when nothing resolves.
pub fn canonical_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    if let Ok(resolved) = absolute.canonicalize() {
        return resolved;
    }

    // Walk up to the deepest existing ancestor, then re-join the tail.
    let mut prefix = absolute.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !prefix.exists() {
        let Some(name) = prefix.file_name() else {
            return clean_path(&absolute);
        };
        tail.push(name.to_os_string());
        if !prefix.pop() {
            return clean_path(&absolute);
        }
    }

    let mut resolved = prefix.canonicalize().unwrap_or(prefix);
    for part in tail.iter().rev() {
        resolved.push(part);
    }
    resolved
}

/// Lexical cleanup: strip `.` components and fold `..` where possible.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vcs_info(origin: &str, root: &str, first: &str) -> RepoInfo {
        RepoInfo {
            root: PathBuf::from(root),
            head: "deadbeef".into(),
            branch: "main".into(),
            origin: origin.into(),
            first_commit: first.into(),
            is_vcs: true,
        }
    }

    #[test]
    fn origin_wins_over_root_and_commit() {
        let a = repo_id(&vcs_info("git@host:a/b.git", "/x", "c1"));
        let b = repo_id(&vcs_info("git@host:a/b.git", "/y", "c2"));
        assert_eq!(a.repo_id, b.repo_id);
        assert_eq!(a.source, IdSource::Origin);
        assert!(a.repo_id.starts_with("r_"));
        assert_eq!(a.repo_id.len(), 2 + ID_HEX_LEN);
    }

    #[test]
    fn no_origin_uses_root_and_first_commit() {
        let a = repo_id(&vcs_info("", "/x", "c1"));
        let b = repo_id(&vcs_info("", "/x", "c1"));
        let c = repo_id(&vcs_info("", "/x", "c2"));
        assert_eq!(a.repo_id, b.repo_id);
        assert_ne!(a.repo_id, c.repo_id);
        assert_eq!(a.source, IdSource::RootFirstCommit);
        assert!(a.repo_id.starts_with("r_"));
    }

    #[test]
    fn plain_directory_gets_path_prefix() {
        let info = RepoInfo {
            root: PathBuf::from("/some/where"),
            ..RepoInfo::default()
        };
        let id = repo_id(&info);
        assert!(id.repo_id.starts_with("p_"));
        assert_eq!(id.source, IdSource::PathOnly);
    }

    #[test]
    fn identity_is_byte_stable_across_runs() {
        let info = vcs_info("https://example.com/r.git", "/x", "c1");
        assert_eq!(repo_id(&info).repo_id, repo_id(&info).repo_id);
    }

    #[test]
    fn canonical_resolves_existing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = canonical_path(dir.path());
        assert!(resolved.is_absolute());
        assert_eq!(resolved, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn canonical_rejoins_missing_tail() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not").join("yet");
        let resolved = canonical_path(&missing);
        assert!(resolved.ends_with("not/yet"));
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn canonical_never_fails_on_garbage() {
        let p = canonical_path(Path::new("/nonexistent-root-xyz/./a/../b"));
        assert!(p.is_absolute());
    }
}
