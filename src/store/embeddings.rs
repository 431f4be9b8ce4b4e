use rusqlite::params;

use super::{Store, parse_dt};
use crate::error::{MempackError, Result};
use crate::ids::now_timestamp;
use crate::model::{
    EmbeddingKind, QueueEntry, chunk_embedding_text, embedding_content_hash,
    memory_embedding_text, normalize_workspace,
};

/// A fresh embedding usable for ranking.
#[derive(Debug, Clone)]
pub struct SearchEmbedding {
    pub item_id: String,
    pub vector: Vec<f32>,
}

/// Fresh embeddings plus the count of stale rows that were skipped.
#[derive(Debug, Clone)]
pub struct EmbeddingListing {
    pub fresh: Vec<SearchEmbedding>,
    pub stale_count: usize,
}

impl Store {
    /// Recompute the deterministic embedding text for an item as it exists
    /// now. Returns `None` for unknown or deleted items.
    pub fn embedding_text(
        &self,
        repo_id: &str,
        workspace: &str,
        kind: EmbeddingKind,
        item_id: &str,
    ) -> Result<Option<String>> {
        let workspace = normalize_workspace(workspace);
        match kind {
            EmbeddingKind::Memory => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT title, summary, tags_text, entities_text FROM memories
                     WHERE id = ?1 AND repo_id = ?2 AND workspace = ?3 AND deleted_at IS NULL",
                )?;
                let mut rows = stmt.query_map(params![item_id, repo_id, workspace], |row| {
                    Ok(memory_embedding_text(
                        &row.get::<_, String>(0)?,
                        &row.get::<_, String>(1)?,
                        &row.get::<_, String>(2)?,
                        &row.get::<_, String>(3)?,
                    ))
                })?;
                match rows.next() {
                    Some(text) => Ok(Some(text?)),
                    None => Ok(None),
                }
            }
            EmbeddingKind::Chunk => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT locator, text, tags_text FROM chunks
                     WHERE chunk_id = ?1 AND repo_id = ?2 AND workspace = ?3 AND deleted_at IS NULL",
                )?;
                let mut rows = stmt.query_map(params![item_id, repo_id, workspace], |row| {
                    Ok(chunk_embedding_text(
                        &row.get::<_, String>(0)?,
                        &row.get::<_, String>(1)?,
                        &row.get::<_, String>(2)?,
                    ))
                })?;
                match rows.next() {
                    Some(text) => Ok(Some(text?)),
                    None => Ok(None),
                }
            }
        }
    }

    /// Write or refresh a vector for `(scope, kind, item, model)`.
    pub fn upsert_embedding(
        &self,
        repo_id: &str,
        workspace: &str,
        kind: EmbeddingKind,
        item_id: &str,
        model: &str,
        content_hash: &str,
        vector: &[f32],
    ) -> Result<()> {
        if item_id.is_empty() {
            return Err(MempackError::MissingIdentifier("item_id"));
        }
        let workspace = normalize_workspace(workspace);
        let now = now_timestamp();
        self.conn.execute(
            "INSERT INTO embeddings
                 (repo_id, workspace, kind, item_id, model, content_hash, vector_json, vector_dim,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(repo_id, workspace, kind, item_id, model) DO UPDATE SET
                 content_hash = excluded.content_hash,
                 vector_json = excluded.vector_json,
                 vector_dim = excluded.vector_dim,
                 updated_at = excluded.updated_at",
            params![
                repo_id,
                workspace,
                kind.as_str(),
                item_id,
                model,
                content_hash,
                serde_json::to_string(vector)?,
                vector.len() as i64,
                now,
            ],
        )?;
        Ok(())
    }

    /// Embeddings whose stored content hash still matches the item's
    /// current embedding text. Stale rows are counted and skipped, acting
    /// as cache misses.
    pub fn list_embeddings_for_search(
        &self,
        repo_id: &str,
        workspace: &str,
        kind: EmbeddingKind,
        model: &str,
    ) -> Result<EmbeddingListing> {
        let workspace = normalize_workspace(workspace);
        let stored: Vec<(String, String, String)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT item_id, content_hash, vector_json FROM embeddings
                 WHERE repo_id = ?1 AND workspace = ?2 AND kind = ?3 AND model = ?4",
            )?;
            stmt.query_map(params![repo_id, workspace, kind.as_str(), model], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut fresh = Vec::new();
        let mut stale_count = 0usize;
        for (item_id, stored_hash, vector_json) in stored {
            let current = self
                .embedding_text(repo_id, &workspace, kind, &item_id)?
                .map(|text| embedding_content_hash(&text));
            match current {
                Some(hash) if !hash.is_empty() && hash == stored_hash => {
                    match serde_json::from_str::<Vec<f32>>(&vector_json) {
                        Ok(vector) if !vector.is_empty() => {
                            fresh.push(SearchEmbedding { item_id, vector });
                        }
                        _ => stale_count += 1,
                    }
                }
                _ => stale_count += 1,
            }
        }
        Ok(EmbeddingListing { fresh, stale_count })
    }

    /// Idempotent enqueue for the out-of-band embedding worker.
    pub fn enqueue_embedding(
        &self,
        repo_id: &str,
        workspace: &str,
        kind: &str,
        item_id: &str,
        model: &str,
    ) -> Result<bool> {
        if EmbeddingKind::parse(kind).is_none() {
            return Err(MempackError::UnknownEmbeddingKind(kind.to_string()));
        }
        let workspace = normalize_workspace(workspace);
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO embedding_queue (repo_id, workspace, kind, item_id, model, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![repo_id, workspace, kind, item_id, model, now_timestamp()],
        )?;
        Ok(inserted > 0)
    }

    /// Oldest queue entries, up to `limit`.
    pub fn peek_embedding_queue(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT queue_id, repo_id, workspace, kind, item_id, model, enqueued_at
             FROM embedding_queue ORDER BY queue_id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(QueueEntry {
                queue_id: row.get(0)?,
                repo_id: row.get(1)?,
                workspace: row.get(2)?,
                kind: row.get(3)?,
                item_id: row.get(4)?,
                model: row.get(5)?,
                enqueued_at: parse_dt(&row.get::<_, String>(6)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Batch-delete processed queue entries.
    pub fn remove_queue_entries(&self, queue_ids: &[i64]) -> Result<usize> {
        let mut removed = 0usize;
        for id in queue_ids {
            removed += self
                .conn
                .execute("DELETE FROM embedding_queue WHERE queue_id = ?1", params![id])?;
        }
        Ok(removed)
    }

    /// Queue every live memory and chunk in scope whose embedding is
    /// missing or stale for `model`. Returns the number enqueued.
    pub fn enqueue_stale_items(&self, repo_id: &str, workspace: &str, model: &str) -> Result<usize> {
        let workspace = normalize_workspace(workspace);
        let mut enqueued = 0usize;

        let memory_ids: Vec<String> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT id FROM memories
                 WHERE repo_id = ?1 AND workspace = ?2 AND deleted_at IS NULL",
            )?;
            stmt.query_map(params![repo_id, workspace], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        for id in memory_ids {
            if self.embedding_is_stale(repo_id, &workspace, EmbeddingKind::Memory, &id, model)?
                && self.enqueue_embedding(repo_id, &workspace, "memory", &id, model)?
            {
                enqueued += 1;
            }
        }

        let chunk_ids: Vec<String> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT chunk_id FROM chunks
                 WHERE repo_id = ?1 AND workspace = ?2 AND deleted_at IS NULL",
            )?;
            stmt.query_map(params![repo_id, workspace], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        for id in chunk_ids {
            if self.embedding_is_stale(repo_id, &workspace, EmbeddingKind::Chunk, &id, model)?
                && self.enqueue_embedding(repo_id, &workspace, "chunk", &id, model)?
            {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// True when the stored hash no longer matches the item's current
    /// embedding text (or no embedding exists). Items with empty embedding
    /// text are never considered stale: there is nothing to embed.
    pub fn embedding_is_stale(
        &self,
        repo_id: &str,
        workspace: &str,
        kind: EmbeddingKind,
        item_id: &str,
        model: &str,
    ) -> Result<bool> {
        let Some(text) = self.embedding_text(repo_id, workspace, kind, item_id)? else {
            return Ok(false);
        };
        let current = embedding_content_hash(&text);
        if current.is_empty() {
            return Ok(false);
        }
        let stored: Option<String> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT content_hash FROM embeddings
                 WHERE repo_id = ?1 AND workspace = ?2 AND kind = ?3 AND item_id = ?4 AND model = ?5",
            )?;
            let mut rows = stmt.query_map(
                params![repo_id, normalize_workspace(workspace), kind.as_str(), item_id, model],
                |row| row.get(0),
            )?;
            match rows.next() {
                Some(v) => Some(v?),
                None => None,
            }
        };
        Ok(stored.as_deref() != Some(current.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MemoryPatch, NewMemory};

    fn add_memory(store: &Store, title: &str) -> String {
        store
            .add_memory(
                "r_1",
                &NewMemory {
                    workspace: "default".into(),
                    thread_id: None,
                    title: title.into(),
                    summary: "body".into(),
                    summary_tokens: 1,
                    tags: vec!["t1".into()],
                    entities: vec!["e1".into()],
                    ..Default::default()
                },
            )
            .unwrap()
            .id
    }

    fn current_hash(store: &Store, id: &str) -> String {
        let text = store
            .embedding_text("r_1", "default", EmbeddingKind::Memory, id)
            .unwrap()
            .unwrap();
        embedding_content_hash(&text)
    }

    #[test]
    fn embedding_text_matches_card_shape() {
        let store = Store::open_memory().unwrap();
        let id = add_memory(&store, "Title");
        let text = store
            .embedding_text("r_1", "default", EmbeddingKind::Memory, &id)
            .unwrap()
            .unwrap();
        assert_eq!(text, "Title\nbody\nTags: t1\nEntities: e1");
    }

    #[test]
    fn fresh_embedding_is_listed() {
        let store = Store::open_memory().unwrap();
        let id = add_memory(&store, "Title");
        store
            .upsert_embedding(
                "r_1",
                "default",
                EmbeddingKind::Memory,
                &id,
                "m",
                &current_hash(&store, &id),
                &[0.1, 0.2],
            )
            .unwrap();

        let listing = store
            .list_embeddings_for_search("r_1", "default", EmbeddingKind::Memory, "m")
            .unwrap();
        assert_eq!(listing.fresh.len(), 1);
        assert_eq!(listing.stale_count, 0);
        assert_eq!(listing.fresh[0].vector, vec![0.1, 0.2]);
    }

    #[test]
    fn content_change_makes_embedding_stale() {
        let store = Store::open_memory().unwrap();
        let id = add_memory(&store, "Title");
        store
            .upsert_embedding(
                "r_1",
                "default",
                EmbeddingKind::Memory,
                &id,
                "m",
                &current_hash(&store, &id),
                &[0.5],
            )
            .unwrap();
        assert!(!store
            .embedding_is_stale("r_1", "default", EmbeddingKind::Memory, &id, "m")
            .unwrap());

        store
            .update_memory(
                "r_1",
                "default",
                &id,
                &MemoryPatch {
                    title: Some("Changed".into()),
                    ..MemoryPatch::default()
                },
            )
            .unwrap();

        assert!(store
            .embedding_is_stale("r_1", "default", EmbeddingKind::Memory, &id, "m")
            .unwrap());
        let listing = store
            .list_embeddings_for_search("r_1", "default", EmbeddingKind::Memory, "m")
            .unwrap();
        assert!(listing.fresh.is_empty());
        assert_eq!(listing.stale_count, 1);
    }

    #[test]
    fn upsert_refreshes_on_hash_mismatch() {
        let store = Store::open_memory().unwrap();
        let id = add_memory(&store, "Title");
        store
            .upsert_embedding("r_1", "default", EmbeddingKind::Memory, &id, "m", "old", &[0.1])
            .unwrap();
        store
            .upsert_embedding(
                "r_1",
                "default",
                EmbeddingKind::Memory,
                &id,
                "m",
                &current_hash(&store, &id),
                &[0.9, 0.8],
            )
            .unwrap();

        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let dim: i64 = store
            .conn()
            .query_row("SELECT vector_dim FROM embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(dim, 2);
    }

    #[test]
    fn enqueue_is_idempotent_and_validates_kind() {
        let store = Store::open_memory().unwrap();
        assert!(store
            .enqueue_embedding("r_1", "default", "memory", "M-1", "m")
            .unwrap());
        assert!(!store
            .enqueue_embedding("r_1", "default", "memory", "M-1", "m")
            .unwrap());
        let err = store
            .enqueue_embedding("r_1", "default", "vector", "M-1", "m")
            .unwrap_err();
        assert_eq!(err.code(), "unknown_embedding_kind");
    }

    #[test]
    fn queue_drains_in_order() {
        let store = Store::open_memory().unwrap();
        store.enqueue_embedding("r_1", "default", "memory", "M-1", "m").unwrap();
        store.enqueue_embedding("r_1", "default", "chunk", "C-1", "m").unwrap();

        let entries = store.peek_embedding_queue(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].item_id, "M-1");

        let ids: Vec<i64> = entries.iter().map(|e| e.queue_id).collect();
        assert_eq!(store.remove_queue_entries(&ids).unwrap(), 2);
        assert!(store.peek_embedding_queue(10).unwrap().is_empty());
    }

    #[test]
    fn enqueue_stale_items_covers_missing_embeddings() {
        let store = Store::open_memory().unwrap();
        let id = add_memory(&store, "Title");
        let enqueued = store.enqueue_stale_items("r_1", "default", "m").unwrap();
        assert_eq!(enqueued, 1);

        // Fresh embedding: a second sweep enqueues nothing.
        store
            .upsert_embedding(
                "r_1",
                "default",
                EmbeddingKind::Memory,
                &id,
                "m",
                &current_hash(&store, &id),
                &[0.1],
            )
            .unwrap();
        store
            .remove_queue_entries(
                &store
                    .peek_embedding_queue(10)
                    .unwrap()
                    .iter()
                    .map(|e| e.queue_id)
                    .collect::<Vec<_>>(),
            )
            .unwrap();
        assert_eq!(store.enqueue_stale_items("r_1", "default", "m").unwrap(), 0);
    }
}
