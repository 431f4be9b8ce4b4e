use rusqlite::params;

use super::{Store, parse_dt, parse_dt_opt, values_from_json, values_to_json};
use crate::error::{MempackError, Result};
use crate::ids::{self, IdPrefix, now_timestamp};
use crate::model::{
    MemoryPatch, MemoryRecord, NewMemory, join_text, merge_values, normalize_values,
    normalize_workspace,
};

pub(crate) const MEMORY_COLUMNS: &str = "id, repo_id, workspace, thread_id, title, summary, summary_tokens,
     tags_json, entities_json, anchor_commit, superseded_by, deleted_at, created_at";

pub(crate) fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    Ok(MemoryRecord {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        workspace: row.get(2)?,
        thread_id: row.get(3)?,
        title: row.get(4)?,
        summary: row.get(5)?,
        summary_tokens: row.get(6)?,
        tags: values_from_json(&row.get::<_, String>(7)?),
        entities: values_from_json(&row.get::<_, String>(8)?),
        anchor_commit: row.get(9)?,
        superseded_by: row.get(10)?,
        deleted_at: parse_dt_opt(row.get(11)?),
        created_at: parse_dt(&row.get::<_, String>(12)?),
    })
}

impl Store {
    /// Create a memory, implicitly creating its thread. Tags and entities
    /// are normalized; the `*_text` mirrors feed the full-text index.
    pub fn add_memory(&self, repo_id: &str, input: &NewMemory) -> Result<MemoryRecord> {
        if repo_id.is_empty() {
            return Err(MempackError::MissingIdentifier("repo_id"));
        }
        if input.title.trim().is_empty() && input.summary.trim().is_empty() {
            return Err(MempackError::InvalidQuery(
                "a memory needs a title or a summary".into(),
            ));
        }
        let workspace = normalize_workspace(&input.workspace);
        let tags = normalize_values(&input.tags);
        let entities = normalize_values(&input.entities);
        let id = ids::generate(IdPrefix::Memory)?;
        let now = now_timestamp();

        let tx = self.conn.unchecked_transaction()?;
        if let Some(thread_id) = input.thread_id.as_deref().filter(|t| !t.is_empty()) {
            tx.execute(
                "INSERT OR IGNORE INTO threads (thread_id, repo_id, workspace, title, tags_json, created_at)
                 VALUES (?1, ?2, ?3, '', '[]', ?4)",
                params![thread_id, repo_id, workspace, now],
            )?;
        }
        tx.execute(
            "INSERT INTO memories (id, repo_id, workspace, thread_id, title, summary, summary_tokens,
                                   tags_json, tags_text, entities_json, entities_text,
                                   anchor_commit, superseded_by, deleted_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, NULL, ?13)",
            params![
                id,
                repo_id,
                workspace,
                input.thread_id.as_deref().filter(|t| !t.is_empty()),
                input.title.trim(),
                input.summary,
                input.summary_tokens,
                values_to_json(&tags),
                join_text(&tags),
                values_to_json(&entities),
                join_text(&entities),
                input.anchor_commit.as_deref().filter(|c| !c.is_empty()),
                now,
            ],
        )?;
        tx.commit()?;

        self.get_memory(repo_id, &workspace, &id)
    }

    pub fn get_memory(&self, repo_id: &str, workspace: &str, id: &str) -> Result<MemoryRecord> {
        let workspace = normalize_workspace(workspace);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE id = ?1 AND repo_id = ?2 AND workspace = ?3"
        ))?;
        stmt.query_row(params![id, repo_id, workspace], row_to_memory)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => MempackError::MemoryNotFound(id.to_string()),
                other => other.into(),
            })
    }

    /// Apply a field patch. Fails on soft-deleted rows; a summary change
    /// without a token count is rejected. Returns `(record, changed)`;
    /// when nothing changed no write happens.
    pub fn update_memory(
        &self,
        repo_id: &str,
        workspace: &str,
        id: &str,
        patch: &MemoryPatch,
    ) -> Result<(MemoryRecord, bool)> {
        let workspace = normalize_workspace(workspace);
        let current = self.get_memory(repo_id, &workspace, id)?;
        if current.deleted_at.is_some() {
            return Err(MempackError::MemoryDeleted(id.to_string()));
        }
        if patch.summary.is_some() && patch.summary_tokens.is_none() {
            return Err(MempackError::MissingSummaryTokens);
        }

        let title = patch.title.clone().unwrap_or_else(|| current.title.clone());
        let summary = patch
            .summary
            .clone()
            .unwrap_or_else(|| current.summary.clone());
        let summary_tokens = patch.summary_tokens.unwrap_or(current.summary_tokens);
        let thread_id = match &patch.thread_id {
            Some(t) if !t.is_empty() => Some(t.clone()),
            Some(_) => None,
            None => current.thread_id.clone(),
        };
        let anchor_commit = match &patch.anchor_commit {
            Some(c) if !c.is_empty() => Some(c.clone()),
            Some(_) => None,
            None => current.anchor_commit.clone(),
        };
        let tags = merge_values(
            &current.tags,
            patch.tags_set.as_ref(),
            &patch.tags_add,
            &patch.tags_remove,
        );
        let entities = merge_values(
            &current.entities,
            patch.entities_set.as_ref(),
            &patch.entities_add,
            &patch.entities_remove,
        );

        let changed = title != current.title
            || summary != current.summary
            || summary_tokens != current.summary_tokens
            || thread_id != current.thread_id
            || anchor_commit != current.anchor_commit
            || tags != current.tags
            || entities != current.entities;
        if !changed {
            return Ok((current, false));
        }

        let tx = self.conn.unchecked_transaction()?;
        if let Some(t) = thread_id.as_deref() {
            tx.execute(
                "INSERT OR IGNORE INTO threads (thread_id, repo_id, workspace, title, tags_json, created_at)
                 VALUES (?1, ?2, ?3, '', '[]', ?4)",
                params![t, repo_id, workspace, now_timestamp()],
            )?;
        }
        tx.execute(
            "UPDATE memories SET thread_id = ?1, title = ?2, summary = ?3, summary_tokens = ?4,
                 tags_json = ?5, tags_text = ?6, entities_json = ?7, entities_text = ?8,
                 anchor_commit = ?9
             WHERE id = ?10 AND repo_id = ?11 AND workspace = ?12",
            params![
                thread_id,
                title,
                summary,
                summary_tokens,
                values_to_json(&tags),
                join_text(&tags),
                values_to_json(&entities),
                join_text(&entities),
                anchor_commit,
                id,
                repo_id,
                workspace,
            ],
        )?;
        tx.commit()?;

        Ok((self.get_memory(repo_id, &workspace, id)?, true))
    }

    /// Mark a memory as replaced by another. The superseded row stays
    /// readable but drops out of "active" filters.
    pub fn supersede_memory(
        &self,
        repo_id: &str,
        workspace: &str,
        old_id: &str,
        new_id: &str,
    ) -> Result<()> {
        let workspace = normalize_workspace(workspace);
        // Both ends must exist; the new one must not be deleted.
        self.get_memory(repo_id, &workspace, old_id)?;
        let new = self.get_memory(repo_id, &workspace, new_id)?;
        if new.deleted_at.is_some() {
            return Err(MempackError::MemoryDeleted(new_id.to_string()));
        }
        self.conn.execute(
            "UPDATE memories SET superseded_by = ?1
             WHERE id = ?2 AND repo_id = ?3 AND workspace = ?4",
            params![new_id, old_id, repo_id, workspace],
        )?;
        Ok(())
    }

    /// Soft-delete. Idempotent; returns whether a live row was affected.
    /// Links touching the memory are removed either way.
    pub fn forget_memory(&self, repo_id: &str, workspace: &str, id: &str) -> Result<bool> {
        let workspace = normalize_workspace(workspace);
        let tx = self.conn.unchecked_transaction()?;
        let affected = tx.execute(
            "UPDATE memories SET deleted_at = ?1
             WHERE id = ?2 AND repo_id = ?3 AND workspace = ?4 AND deleted_at IS NULL",
            params![now_timestamp(), id, repo_id, workspace],
        )?;
        tx.execute(
            "DELETE FROM links WHERE from_id = ?1 OR to_id = ?1",
            params![id],
        )?;
        tx.commit()?;
        Ok(affected > 0)
    }

    /// Hard-delete the row plus its links, embeddings and queue entries.
    pub fn purge_memory(&self, repo_id: &str, workspace: &str, id: &str) -> Result<bool> {
        let workspace = normalize_workspace(workspace);
        let tx = self.conn.unchecked_transaction()?;
        let affected = tx.execute(
            "DELETE FROM memories WHERE id = ?1 AND repo_id = ?2 AND workspace = ?3",
            params![id, repo_id, workspace],
        )?;
        tx.execute(
            "DELETE FROM links WHERE from_id = ?1 OR to_id = ?1",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM embeddings WHERE repo_id = ?1 AND workspace = ?2 AND kind = 'memory' AND item_id = ?3",
            params![repo_id, workspace, id],
        )?;
        tx.execute(
            "DELETE FROM embedding_queue WHERE repo_id = ?1 AND workspace = ?2 AND kind = 'memory' AND item_id = ?3",
            params![repo_id, workspace, id],
        )?;
        tx.commit()?;
        Ok(affected > 0)
    }

    /// Most recent live memories in scope.
    pub fn list_recent_memories(
        &self,
        repo_id: &str,
        workspace: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let workspace = normalize_workspace(workspace);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE repo_id = ?1 AND workspace = ?2 AND deleted_at IS NULL
             ORDER BY created_at DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![repo_id, workspace, limit as i64], row_to_memory)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Live memories referencing a thread, newest first. The order matters
    /// downstream: seeded candidates enter ranking with no lexical score,
    /// and the stable sort keeps this order for exact ties, so newer
    /// `created_at` wins.
    pub fn list_thread_memories(
        &self,
        repo_id: &str,
        workspace: &str,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let workspace = normalize_workspace(workspace);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE repo_id = ?1 AND workspace = ?2 AND thread_id = ?3 AND deleted_at IS NULL
             ORDER BY created_at DESC LIMIT ?4"
        ))?;
        let rows = stmt.query_map(
            params![repo_id, workspace, thread_id, limit as i64],
            row_to_memory,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}
