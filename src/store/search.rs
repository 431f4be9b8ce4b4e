use rusqlite::params;

use super::{Store, memories, chunks};
use crate::error::Result;
use crate::model::{ChunkRecord, MemoryRecord, normalize_workspace};
use crate::query::{self, Rewrite};

/// Floor for the candidate pass so BM25 sees enough rows to rank before
/// the caller's limit truncates.
const CANDIDATE_FLOOR: usize = 200;

/// BM25 column weights. Changing these is an interface change.
const MEMORY_BM25: &str = "bm25(memories_fts, 5.0, 3.0, 2.0, 2.0, 0.0, 0.0, 0.0)";
const CHUNK_BM25: &str = "bm25(chunks_fts, 1.0, 3.0, 2.0, 0.0, 0.0, 0.0, 0.0)";

#[derive(Debug, Clone)]
pub struct SearchHit<T> {
    pub item: T,
    /// Lexical relevance, positive-better (negated SQLite BM25).
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome<T> {
    pub hits: Vec<SearchHit<T>>,
    pub rewritten: bool,
    pub rewrites_applied: Vec<Rewrite>,
    /// True when the baseline found nothing and the expanded pass did.
    pub rewrite_matched: bool,
}

impl<T> SearchOutcome<T> {
    fn empty() -> Self {
        Self {
            hits: vec![],
            rewritten: false,
            rewrites_applied: vec![],
            rewrite_matched: false,
        }
    }
}

/// How one searchable table maps candidate row-ids back to records. Keeps
/// the two-pass machinery shared without collapsing the BM25 weightings.
trait Projection: Sized {
    const FTS_TABLE: &'static str;
    const BM25_EXPR: &'static str;
    fn fetch(store: &Store, rowid: i64, repo_id: &str, workspace: &str) -> Result<Option<Self>>;
}

impl Projection for MemoryRecord {
    const FTS_TABLE: &'static str = "memories_fts";
    const BM25_EXPR: &'static str = MEMORY_BM25;

    fn fetch(store: &Store, rowid: i64, repo_id: &str, workspace: &str) -> Result<Option<Self>> {
        let mut stmt = store.conn.prepare_cached(&format!(
            "SELECT {} FROM memories
             WHERE rowid = ?1 AND repo_id = ?2 AND workspace = ?3 AND deleted_at IS NULL",
            memories::MEMORY_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![rowid, repo_id, workspace], memories::row_to_memory)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

impl Projection for ChunkRecord {
    const FTS_TABLE: &'static str = "chunks_fts";
    const BM25_EXPR: &'static str = CHUNK_BM25;

    fn fetch(store: &Store, rowid: i64, repo_id: &str, workspace: &str) -> Result<Option<Self>> {
        let mut stmt = store.conn.prepare_cached(&format!(
            "SELECT {} FROM chunks
             WHERE rowid = ?1 AND repo_id = ?2 AND workspace = ?3 AND deleted_at IS NULL",
            chunks::CHUNK_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![rowid, repo_id, workspace], chunks::row_to_chunk)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

impl Store {
    /// Two-pass lexical search over memories: baseline expression first,
    /// rewrite-expanded second when the baseline comes back empty.
    pub fn search_memories(
        &self,
        repo_id: &str,
        workspace: &str,
        query_text: &str,
        limit: usize,
    ) -> Result<SearchOutcome<MemoryRecord>> {
        self.search_two_pass::<MemoryRecord>(repo_id, workspace, query_text, limit)
    }

    pub fn search_chunks(
        &self,
        repo_id: &str,
        workspace: &str,
        query_text: &str,
        limit: usize,
    ) -> Result<SearchOutcome<ChunkRecord>> {
        self.search_two_pass::<ChunkRecord>(repo_id, workspace, query_text, limit)
    }

    fn search_two_pass<T: Projection>(
        &self,
        repo_id: &str,
        workspace: &str,
        query_text: &str,
        limit: usize,
    ) -> Result<SearchOutcome<T>> {
        let parsed = query::parse_query(query_text)?;
        let workspace = normalize_workspace(workspace);
        if parsed.fts_query.is_empty() {
            return Ok(SearchOutcome::empty());
        }

        let hits = self.run_pass::<T>(repo_id, &workspace, &parsed.fts_query, limit)?;
        if !hits.is_empty() {
            return Ok(SearchOutcome {
                hits,
                rewritten: false,
                rewrites_applied: vec![],
                rewrite_matched: false,
            });
        }

        let (expanded, rewrites) = query::build_expanded(&parsed.original);
        if expanded.is_empty() || expanded == parsed.fts_query || rewrites.is_empty() {
            return Ok(SearchOutcome {
                hits,
                rewritten: false,
                rewrites_applied: vec![],
                rewrite_matched: false,
            });
        }

        tracing::debug!(query = %parsed.original, "baseline empty, running expanded pass");
        let expanded_hits = self.run_pass::<T>(repo_id, &workspace, &expanded, limit)?;
        let rewrite_matched = !expanded_hits.is_empty();
        Ok(SearchOutcome {
            hits: expanded_hits,
            rewritten: true,
            rewrites_applied: rewrites,
            rewrite_matched,
        })
    }

    /// One candidate pass plus the row fetch. Candidate order is preserved
    /// and the result truncated to `limit`.
    fn run_pass<T: Projection>(
        &self,
        repo_id: &str,
        workspace: &str,
        fts_query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit<T>>> {
        let candidate_limit = limit.max(CANDIDATE_FLOOR);
        let sql = format!(
            "SELECT rowid, {bm25} AS score FROM {table}
             WHERE {table} MATCH ?1 AND repo_id = ?2 AND workspace = ?3
             ORDER BY score LIMIT ?4",
            bm25 = T::BM25_EXPR,
            table = T::FTS_TABLE,
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let candidates: Vec<(i64, f64)> = stmt
            .query_map(
                params![fts_query, repo_id, workspace, candidate_limit as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut hits = Vec::new();
        for (rowid, bm25) in candidates {
            if hits.len() >= limit {
                break;
            }
            if let Some(item) = T::fetch(self, rowid, repo_id, workspace)? {
                hits.push(SearchHit { item, score: -bm25 });
            }
        }
        Ok(hits)
    }
}
