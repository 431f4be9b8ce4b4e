use rusqlite::params;

use super::{Store, parse_dt, values_from_json};
use crate::error::Result;
use crate::ids::now_timestamp;
use crate::model::{RepoRecord, ThreadRecord, normalize_workspace};

/// Fields carried into the repos row. Empty strings on conflict preserve
/// what is already stored.
#[derive(Debug, Clone, Default)]
pub struct RepoUpsert {
    pub repo_id: String,
    pub git_root: String,
    pub origin_hash: String,
    pub last_head: String,
    pub last_branch: String,
}

impl Store {
    /// Upsert the repos row. Non-empty incoming fields overwrite, empty
    /// fields preserve; `last_seen_at` always advances.
    pub fn ensure_repo(&self, upsert: &RepoUpsert) -> Result<RepoRecord> {
        let now = now_timestamp();
        self.conn.execute(
            "INSERT INTO repos (repo_id, git_root, origin_hash, last_head, last_branch, created_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(repo_id) DO UPDATE SET
                 git_root = CASE WHEN excluded.git_root != '' THEN excluded.git_root ELSE git_root END,
                 origin_hash = CASE WHEN excluded.origin_hash != '' THEN excluded.origin_hash ELSE origin_hash END,
                 last_head = CASE WHEN excluded.last_head != '' THEN excluded.last_head ELSE last_head END,
                 last_branch = CASE WHEN excluded.last_branch != '' THEN excluded.last_branch ELSE last_branch END,
                 last_seen_at = excluded.last_seen_at",
            params![
                upsert.repo_id,
                upsert.git_root,
                upsert.origin_hash,
                upsert.last_head,
                upsert.last_branch,
                now,
            ],
        )?;
        self.get_repo(&upsert.repo_id)
    }

    pub fn get_repo(&self, repo_id: &str) -> Result<RepoRecord> {
        let mut stmt = self.conn.prepare(
            "SELECT repo_id, git_root, origin_hash, last_head, last_branch, created_at, last_seen_at
             FROM repos WHERE repo_id = ?1",
        )?;
        stmt.query_row(params![repo_id], |row| {
            Ok(RepoRecord {
                repo_id: row.get(0)?,
                git_root: row.get(1)?,
                origin_hash: row.get(2)?,
                last_head: row.get(3)?,
                last_branch: row.get(4)?,
                created_at: parse_dt(&row.get::<_, String>(5)?),
                last_seen_at: parse_dt(&row.get::<_, String>(6)?),
            })
        })
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                crate::error::MempackError::RepoNotFound(repo_id.to_string())
            }
            other => other.into(),
        })
    }

    /// Create the thread row if it does not exist yet. Threads are created
    /// implicitly by the first memory that references them.
    pub fn ensure_thread(&self, repo_id: &str, workspace: &str, thread_id: &str) -> Result<()> {
        let workspace = normalize_workspace(workspace);
        self.conn.execute(
            "INSERT OR IGNORE INTO threads (thread_id, repo_id, workspace, title, tags_json, created_at)
             VALUES (?1, ?2, ?3, '', '[]', ?4)",
            params![thread_id, repo_id, workspace, now_timestamp()],
        )?;
        Ok(())
    }

    /// List threads in scope; `memory_count` recomputes from live memories.
    pub fn list_threads(&self, repo_id: &str, workspace: &str) -> Result<Vec<ThreadRecord>> {
        let workspace = normalize_workspace(workspace);
        let mut stmt = self.conn.prepare(
            "SELECT t.thread_id, t.repo_id, t.workspace, t.title, t.tags_json, t.created_at,
                    (SELECT COUNT(*) FROM memories m
                     WHERE m.thread_id = t.thread_id AND m.repo_id = t.repo_id
                       AND m.workspace = t.workspace AND m.deleted_at IS NULL)
             FROM threads t
             WHERE t.repo_id = ?1 AND t.workspace = ?2
             ORDER BY t.created_at",
        )?;
        let rows = stmt.query_map(params![repo_id, workspace], |row| {
            Ok(ThreadRecord {
                thread_id: row.get(0)?,
                repo_id: row.get(1)?,
                workspace: row.get(2)?,
                title: row.get(3)?,
                tags: values_from_json(&row.get::<_, String>(4)?),
                created_at: parse_dt(&row.get::<_, String>(5)?),
                memory_count: row.get(6)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_repo_preserves_nonempty_fields_on_conflict() {
        let store = Store::open_memory().unwrap();
        let first = store
            .ensure_repo(&RepoUpsert {
                repo_id: "r_1".into(),
                git_root: "/work/repo".into(),
                origin_hash: "abcd".into(),
                last_head: "sha1".into(),
                last_branch: "main".into(),
            })
            .unwrap();
        assert_eq!(first.git_root, "/work/repo");

        // Empty fields preserve, non-empty overwrite.
        let second = store
            .ensure_repo(&RepoUpsert {
                repo_id: "r_1".into(),
                last_head: "sha2".into(),
                ..RepoUpsert::default()
            })
            .unwrap();
        assert_eq!(second.git_root, "/work/repo");
        assert_eq!(second.origin_hash, "abcd");
        assert_eq!(second.last_head, "sha2");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.last_seen_at >= first.last_seen_at);
    }

    #[test]
    fn get_repo_missing_is_not_found() {
        let store = Store::open_memory().unwrap();
        let err = store.get_repo("r_missing").unwrap_err();
        assert_eq!(err.code(), "repo_not_found");
    }

    #[test]
    fn ensure_thread_is_idempotent() {
        let store = Store::open_memory().unwrap();
        store.ensure_thread("r_1", "", "T-alpha").unwrap();
        store.ensure_thread("r_1", "default", "T-alpha").unwrap();
        let threads = store.list_threads("r_1", "default").unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].thread_id, "T-alpha");
        assert_eq!(threads[0].memory_count, 0);
    }

    #[test]
    fn thread_counts_recompute_from_live_memories() {
        let store = Store::open_memory().unwrap();
        let mem = store
            .add_memory(
                "r_1",
                &crate::model::NewMemory {
                    workspace: "default".into(),
                    thread_id: Some("T-alpha".into()),
                    title: "t".into(),
                    summary: "s".into(),
                    summary_tokens: 1,
                    ..Default::default()
                },
            )
            .unwrap();

        let threads = store.list_threads("r_1", "default").unwrap();
        assert_eq!(threads[0].memory_count, 1);

        store.forget_memory("r_1", "default", &mem.id).unwrap();
        let threads = store.list_threads("r_1", "default").unwrap();
        assert_eq!(threads[0].memory_count, 0);
    }
}
