use rusqlite::params;

use super::{Store, parse_dt, parse_dt_opt, values_from_json, values_to_json};
use crate::error::{MempackError, Result};
use crate::hash::sha256_hex;
use crate::ids::{self, IdPrefix, now_timestamp};
use crate::model::{
    ArtifactRecord, ChunkRecord, NewArtifact, NewChunk, join_text, normalize_values,
    normalize_workspace,
};

pub(crate) const CHUNK_COLUMNS: &str = "chunk_id, repo_id, workspace, artifact_id, thread_id, locator, text,
     text_hash, text_tokens, tags_json, chunk_type, symbol_name, symbol_kind, created_at, deleted_at";

pub(crate) fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    Ok(ChunkRecord {
        chunk_id: row.get(0)?,
        repo_id: row.get(1)?,
        workspace: row.get(2)?,
        artifact_id: row.get(3)?,
        thread_id: row.get(4)?,
        locator: row.get(5)?,
        text: row.get(6)?,
        text_hash: row.get(7)?,
        text_tokens: row.get(8)?,
        tags: values_from_json(&row.get::<_, String>(9)?),
        chunk_type: row.get(10)?,
        symbol_name: row.get(11)?,
        symbol_kind: row.get(12)?,
        created_at: parse_dt(&row.get::<_, String>(13)?),
        deleted_at: parse_dt_opt(row.get(14)?),
    })
}

/// Outcome of a batched ingest.
#[derive(Debug, Clone)]
pub struct IngestResult {
    pub artifact: ArtifactRecord,
    pub inserted_count: usize,
    pub inserted_ids: Vec<String>,
    pub skipped_duplicates: usize,
}

impl Store {
    /// Insert an artifact and its chunks in one transaction. Duplicate
    /// chunks (same scope, locator, text hash and thread) are silently
    /// skipped via the unique index.
    pub fn add_artifact_with_chunks(
        &self,
        repo_id: &str,
        artifact: &NewArtifact,
        chunks: &[NewChunk],
    ) -> Result<IngestResult> {
        if repo_id.is_empty() {
            return Err(MempackError::MissingIdentifier("repo_id"));
        }
        let workspace = normalize_workspace(&artifact.workspace);
        let artifact_id = ids::generate(IdPrefix::Artifact)?;
        let now = now_timestamp();

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO artifacts (artifact_id, repo_id, workspace, kind, source, content_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                artifact_id,
                repo_id,
                workspace,
                artifact.kind,
                artifact.source,
                artifact.content_hash,
                now,
            ],
        )?;

        let mut inserted_ids = Vec::new();
        let mut skipped = 0usize;
        for chunk in chunks {
            let chunk_id = ids::generate(IdPrefix::Chunk)?;
            let text_hash = if chunk.text_hash.is_empty() {
                sha256_hex(&chunk.text)
            } else {
                chunk.text_hash.clone()
            };
            let chunk_type = if chunk.chunk_type.is_empty() {
                "line"
            } else {
                chunk.chunk_type.as_str()
            };
            let tags = normalize_values(&chunk.tags);
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO chunks
                     (chunk_id, repo_id, workspace, artifact_id, thread_id, locator, text, text_hash,
                      text_tokens, tags_json, tags_text, chunk_type, symbol_name, symbol_kind,
                      created_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, NULL)",
                params![
                    chunk_id,
                    repo_id,
                    workspace,
                    artifact_id,
                    chunk.thread_id.as_deref().filter(|t| !t.is_empty()),
                    chunk.locator,
                    chunk.text,
                    text_hash,
                    chunk.text_tokens,
                    values_to_json(&tags),
                    join_text(&tags),
                    chunk_type,
                    chunk.symbol_name,
                    chunk.symbol_kind,
                    now,
                ],
            )?;
            if inserted > 0 {
                inserted_ids.push(chunk_id);
            } else {
                skipped += 1;
            }
        }
        tx.commit()?;

        Ok(IngestResult {
            artifact: ArtifactRecord {
                artifact_id,
                repo_id: repo_id.to_string(),
                workspace,
                kind: artifact.kind.clone(),
                source: artifact.source.clone(),
                content_hash: artifact.content_hash.clone(),
                created_at: parse_dt(&now),
            },
            inserted_count: inserted_ids.len(),
            inserted_ids,
            skipped_duplicates: skipped,
        })
    }

    pub fn get_chunk(&self, repo_id: &str, workspace: &str, chunk_id: &str) -> Result<ChunkRecord> {
        let workspace = normalize_workspace(workspace);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE chunk_id = ?1 AND repo_id = ?2 AND workspace = ?3"
        ))?;
        stmt.query_row(params![chunk_id, repo_id, workspace], row_to_chunk)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    MempackError::ChunkNotFound(chunk_id.to_string())
                }
                other => other.into(),
            })
    }

    /// Soft-delete one chunk. Idempotent.
    pub fn forget_chunk(&self, repo_id: &str, workspace: &str, chunk_id: &str) -> Result<bool> {
        let workspace = normalize_workspace(workspace);
        let affected = self.conn.execute(
            "UPDATE chunks SET deleted_at = ?1
             WHERE chunk_id = ?2 AND repo_id = ?3 AND workspace = ?4 AND deleted_at IS NULL",
            params![now_timestamp(), chunk_id, repo_id, workspace],
        )?;
        Ok(affected > 0)
    }

    /// Soft-delete every live chunk whose artifact came from `source`.
    /// Returns the number of chunks affected.
    pub fn delete_chunks_by_source(
        &self,
        repo_id: &str,
        workspace: &str,
        source: &str,
    ) -> Result<usize> {
        let workspace = normalize_workspace(workspace);
        let affected = self.conn.execute(
            "UPDATE chunks SET deleted_at = ?1
             WHERE repo_id = ?2 AND workspace = ?3 AND deleted_at IS NULL
               AND artifact_id IN (
                   SELECT artifact_id FROM artifacts
                   WHERE repo_id = ?2 AND workspace = ?3 AND source = ?4
               )",
            params![now_timestamp(), repo_id, workspace, source],
        )?;
        Ok(affected)
    }
}
