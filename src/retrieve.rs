use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;

use crate::config::AppContext;
use crate::embed::{EmbeddingProvider, cosine_similarity, provider_from_config};
use crate::error::Result;
use crate::git;
use crate::hash::sha256_hex;
use crate::identity;
use crate::model::{ChunkRecord, EmbeddingKind, MemoryRecord};
use crate::pack::{self, BudgetSpec, ContextPack, PackInputs, PackRepo, SearchMeta};
use crate::query::{self, EntityType, Intent};
use crate::rank;
use crate::store::Store;
use crate::store::repos::RepoUpsert;
use crate::tokenizer::create_tokenizer;

/// Default number of candidates carried into rank fusion per table.
const DEFAULT_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    pub query: String,
    pub workspace: String,
    pub limit: usize,
    pub include_raw: bool,
    pub rules: Vec<String>,
    pub budget_override: Option<usize>,
    pub deadline: Option<Duration>,
}

impl Default for RetrieveRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            workspace: String::new(),
            limit: DEFAULT_LIMIT,
            include_raw: false,
            rules: vec![],
            budget_override: None,
            deadline: None,
        }
    }
}

/// The flagship operation: resolve identity, search, optionally re-rank
/// with vectors, traverse links, and assemble the token-budgeted pack.
///
/// Optional capabilities degrade instead of failing: an unreachable
/// embedding provider or a broken anchor-commit probe is recorded in
/// `search_meta` and the retrieval stays lexical.
pub fn build_context_pack(
    ctx: &AppContext,
    start_dir: &Path,
    req: &RetrieveRequest,
) -> Result<ContextPack> {
    let info = git::detect(start_dir);
    let ident = identity::repo_id(&info);
    let cfg = ctx.config_for_repo(&info.root);

    let store = Store::open(&cfg.db_path(&ident.repo_id))?;
    store.ensure_repo(&RepoUpsert {
        repo_id: ident.repo_id.clone(),
        git_root: info.root.display().to_string(),
        origin_hash: if info.origin.is_empty() {
            String::new()
        } else {
            sha256_hex(&info.origin)
        },
        last_head: info.head.clone(),
        last_branch: info.branch.clone(),
    })?;

    let parsed = query::parse_query(&req.query)?;
    let mut warnings: Vec<String> = Vec::new();
    let mut fallback_reason: Option<String> = None;

    // Lexical two-pass over both tables.
    let memory_outcome = store.search_memories(&ident.repo_id, &req.workspace, &req.query, req.limit)?;
    let chunk_outcome = store.search_chunks(&ident.repo_id, &req.workspace, &req.query, req.limit)?;
    let rewritten = memory_outcome.rewritten || chunk_outcome.rewritten;
    let rewrite_matched = memory_outcome.rewrite_matched || chunk_outcome.rewrite_matched;
    let mut rewrites: Vec<String> = memory_outcome
        .rewrites_applied
        .iter()
        .chain(chunk_outcome.rewrites_applied.iter())
        .map(|r| r.display())
        .collect();
    rewrites.dedup();

    let mut memories: Vec<(MemoryRecord, f64)> = memory_outcome
        .hits
        .into_iter()
        .map(|h| (h.item, h.score))
        .collect();
    let chunks: Vec<(ChunkRecord, f64)> = chunk_outcome
        .hits
        .into_iter()
        .map(|h| (h.item, h.score))
        .collect();

    // Intent-directed seeding: thread queries pull the thread's memories,
    // temporal queries fall back to the recency listing when lexical
    // search found nothing.
    let query_threads: Vec<String> = parsed
        .entities
        .iter()
        .filter(|e| e.etype == EntityType::Thread)
        .map(|e| e.value.clone())
        .collect();
    if parsed.intent == Intent::Thread {
        for thread_id in &query_threads {
            for mem in store.list_thread_memories(&ident.repo_id, &req.workspace, thread_id, req.limit)? {
                if !memories.iter().any(|(m, _)| m.id == mem.id) {
                    memories.push((mem, 0.0));
                }
            }
        }
    }
    if parsed.intent == Intent::Recent && memories.is_empty() {
        let after = parsed.time_hint.as_ref().and_then(|h| h.after);
        for mem in store.list_recent_memories(&ident.repo_id, &req.workspace, req.limit)? {
            if after.map(|cutoff| mem.created_at >= cutoff).unwrap_or(true) {
                memories.push((mem, 0.0));
            }
        }
    }

    // Reachability: drop memories anchored to commits not reachable from
    // the current HEAD. Probe failures degrade to keeping the memory.
    if info.is_vcs && !info.head.is_empty() {
        let mut reachable_failed = false;
        memories.retain(|(mem, _)| {
            let Some(anchor) = mem.anchor_commit.as_deref().filter(|a| !a.is_empty()) else {
                return true;
            };
            match git::is_ancestor(&info.root, anchor, &info.head) {
                Ok(reachable) => reachable,
                Err(_) => {
                    reachable_failed = true;
                    true
                }
            }
        });
        if reachable_failed {
            warnings.push("anchor reachability probe failed; kept anchored memories".into());
        }
    }

    // Optional vector re-rank.
    let mut memory_sims: HashMap<String, f64> = HashMap::new();
    let mut chunk_sims: HashMap<String, f64> = HashMap::new();
    let mut stale_embeddings: Option<usize> = None;
    let mut vector_used = false;
    if let Some(provider) = provider_from_config(&cfg, req.deadline) {
        if !req.query.trim().is_empty() && provider.probe(ctx) {
            match provider.embed(&[req.query.clone()]) {
                Ok(vectors) => {
                    let query_vec = &vectors[0];
                    let mut stale = 0usize;
                    for (kind, sims) in [
                        (EmbeddingKind::Memory, &mut memory_sims),
                        (EmbeddingKind::Chunk, &mut chunk_sims),
                    ] {
                        let listing = store.list_embeddings_for_search(
                            &ident.repo_id,
                            &req.workspace,
                            kind,
                            provider.model(),
                        )?;
                        stale += listing.stale_count;
                        for emb in listing.fresh {
                            let sim = cosine_similarity(&emb.vector, query_vec);
                            if sim >= cfg.embedding_min_similarity {
                                sims.insert(emb.item_id, sim);
                            }
                        }
                    }
                    stale_embeddings = Some(stale);
                    vector_used = true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "embedding provider failed, staying lexical");
                    fallback_reason = Some("embedding provider unavailable".into());
                    warnings.push(e.to_string());
                }
            }
        } else if !req.query.trim().is_empty() {
            fallback_reason = Some("embedding provider unavailable".into());
        }
    }

    // Rank fusion.
    let now = Utc::now();
    let ranked_memories = rank::rank_items(
        memories
            .into_iter()
            .map(|(m, lexical)| {
                let sim = memory_sims.get(&m.id).copied();
                let created = m.created_at;
                (m, lexical, created, sim)
            })
            .collect(),
        parsed.boost_recency,
        now,
    );
    let ranked_chunks = rank::rank_items(
        chunks
            .into_iter()
            .map(|(c, lexical)| {
                let sim = chunk_sims.get(&c.chunk_id).copied();
                let created = c.created_at;
                (c, lexical, created, sim)
            })
            .collect(),
        parsed.boost_recency,
        now,
    );

    let top_memories: Vec<MemoryRecord> = ranked_memories
        .into_iter()
        .take(req.limit)
        .map(|s| s.item)
        .collect();
    let top_chunks: Vec<ChunkRecord> = ranked_chunks
        .into_iter()
        .take(req.limit)
        .map(|s| s.item)
        .collect();

    // Link trail over the selected memory set.
    let memory_ids: Vec<String> = top_memories.iter().map(|m| m.id.clone()).collect();
    let links = store.list_links_for_ids(&ident.repo_id, &req.workspace, &memory_ids)?;

    let state_json = store
        .get_state(&ident.repo_id, &req.workspace)
        .map(|s| s.state_json)
        .ok();

    let mode_used = match (rewritten, vector_used) {
        (false, false) => "fts",
        (true, false) => "fts+rewrite",
        (false, true) => "fts+vector",
        (true, true) => "fts+rewrite+vector",
    };
    let search_meta = SearchMeta {
        mode_used: mode_used.to_string(),
        fallback_reason,
        warnings,
        rewritten,
        rewrites_applied: rewrites,
        rewrite_matched,
        stale_embeddings,
    };

    let raw_chunks = if req.include_raw {
        Some(top_chunks.clone())
    } else {
        None
    };

    let tokenizer = create_tokenizer(&cfg.tokenizer);
    let budget = BudgetSpec {
        target_total: req.budget_override.unwrap_or(cfg.token_budget),
        state_max: cfg.state_max_tokens,
        memory_max_each: cfg.memory_max_each,
        chunk_max_each: cfg.chunk_max_each,
    };

    Ok(pack::assemble(
        PackInputs {
            repo: PackRepo {
                repo_id: ident.repo_id,
                git_root: info.root.display().to_string(),
                head: info.head,
                branch: info.branch,
            },
            workspace: crate::model::normalize_workspace(&req.workspace),
            state_json,
            memories: top_memories,
            chunks: top_chunks,
            raw_chunks,
            links,
            rules: req.rules.clone(),
            search_meta: Some(search_meta),
            query_threads,
        },
        budget,
        tokenizer.as_ref(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Overrides};
    use crate::model::NewMemory;

    fn ctx_with_data_dir(dir: &Path) -> AppContext {
        let cfg = Config {
            data_dir: dir.to_path_buf(),
            ..Config::default()
        };
        AppContext::new(cfg)
    }

    fn seed_memory(ctx: &AppContext, start: &Path, title: &str, summary: &str) {
        let info = git::detect(start);
        let ident = identity::repo_id(&info);
        let store = Store::open(&ctx.config.db_path(&ident.repo_id)).unwrap();
        store
            .add_memory(
                &ident.repo_id,
                &NewMemory {
                    workspace: "default".into(),
                    thread_id: Some("T-seed".into()),
                    title: title.into(),
                    summary: summary.into(),
                    summary_tokens: 5,
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn end_to_end_lexical_pack() {
        let data = tempfile::tempdir().unwrap();
        let repo_dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with_data_dir(data.path());
        seed_memory(&ctx, repo_dir.path(), "retry budget", "we exhausted the retry budget");

        let pack = build_context_pack(
            &ctx,
            repo_dir.path(),
            &RetrieveRequest {
                query: "retry budget".into(),
                ..RetrieveRequest::default()
            },
        )
        .unwrap();

        assert_eq!(pack.top_memories.len(), 1);
        assert_eq!(pack.top_memories[0].title, "retry budget");
        let meta = pack.search_meta.unwrap();
        assert_eq!(meta.mode_used, "fts");
        assert!(pack.repo.repo_id.starts_with("p_"));
        assert!(pack.budget.used_total <= pack.budget.target_total);
    }

    #[test]
    fn empty_query_still_produces_a_pack_with_state() {
        let data = tempfile::tempdir().unwrap();
        let repo_dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with_data_dir(data.path());

        let info = git::detect(repo_dir.path());
        let ident = identity::repo_id(&info);
        let store = Store::open(&ctx.config.db_path(&ident.repo_id)).unwrap();
        store
            .set_state(&ident.repo_id, "default", r#"{"focus":"x"}"#, 4, "init")
            .unwrap();

        let pack = build_context_pack(&ctx, repo_dir.path(), &RetrieveRequest::default()).unwrap();
        assert!(pack.top_memories.is_empty());
        assert_eq!(pack.state["focus"], "x");
    }

    #[test]
    fn retrieval_never_requires_the_embedding_provider() {
        let data = tempfile::tempdir().unwrap();
        let repo_dir = tempfile::tempdir().unwrap();
        let mut cfg = Config {
            data_dir: data.path().to_path_buf(),
            ..Config::default()
        };
        // Point the provider somewhere unreachable.
        cfg.embedding_provider = "ollama".into();
        cfg.embedding_host = "http://192.0.2.1:1".into();
        let ctx = AppContext::new(cfg);
        seed_memory(&ctx, repo_dir.path(), "anchors", "lexical still works");

        let pack = build_context_pack(
            &ctx,
            repo_dir.path(),
            &RetrieveRequest {
                query: "lexical".into(),
                deadline: Some(Duration::from_millis(50)),
                ..RetrieveRequest::default()
            },
        )
        .unwrap();

        assert_eq!(pack.top_memories.len(), 1);
        let meta = pack.search_meta.unwrap();
        assert_eq!(meta.fallback_reason.as_deref(), Some("embedding provider unavailable"));
        assert!(meta.mode_used.starts_with("fts"));
    }

    #[test]
    fn repo_id_resolution_is_stable_across_calls() {
        let data = tempfile::tempdir().unwrap();
        let repo_dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with_data_dir(data.path());

        let a = build_context_pack(&ctx, repo_dir.path(), &RetrieveRequest::default()).unwrap();
        let b = build_context_pack(&ctx, repo_dir.path(), &RetrieveRequest::default()).unwrap();
        assert_eq!(a.repo.repo_id, b.repo.repo_id);
    }

    #[test]
    fn overrides_flow_into_the_budget() {
        let data = tempfile::tempdir().unwrap();
        let repo_dir = tempfile::tempdir().unwrap();
        let cfg = crate::config::resolve(&Overrides {
            data_dir: Some(data.path().to_path_buf()),
            token_budget: Some(999),
            ..Overrides::default()
        })
        .unwrap();
        let ctx = AppContext::new(cfg);

        let pack = build_context_pack(&ctx, repo_dir.path(), &RetrieveRequest::default()).unwrap();
        assert_eq!(pack.budget.target_total, 999);

        let pack = build_context_pack(
            &ctx,
            repo_dir.path(),
            &RetrieveRequest {
                budget_override: Some(123),
                ..RetrieveRequest::default()
            },
        )
        .unwrap();
        assert_eq!(pack.budget.target_total, 123);
    }
}
