use serde::Serialize;

use crate::model::{ChunkRecord, LinkRecord, MemoryRecord};
use crate::tokenizer::{Tokenizer, truncate_to_tokens};

/// Stable wire version of the context pack.
pub const PACK_VERSION: u32 = 1;

pub const TOOL_NAME: &str = "mempack";

#[derive(Debug, Clone, Serialize)]
pub struct PackRepo {
    pub repo_id: String,
    pub git_root: String,
    pub head: String,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SearchMeta {
    pub mode_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub rewritten: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rewrites_applied: Vec<String>,
    pub rewrite_matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_embeddings: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchedThread {
    pub thread_id: String,
    pub why: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackMemory {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub title: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_commit: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackChunk {
    pub chunk_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackLink {
    pub from: String,
    pub rel: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackBudgetReport {
    pub tokenizer: String,
    pub target_total: usize,
    pub used_total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextPack {
    pub version: u32,
    pub tool: String,
    pub repo: PackRepo,
    pub workspace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_meta: Option<SearchMeta>,
    pub state: serde_json::Value,
    pub matched_threads: Vec<MatchedThread>,
    pub top_memories: Vec<PackMemory>,
    pub top_chunks: Vec<PackChunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_chunks_raw: Option<Vec<PackChunk>>,
    pub link_trail: Vec<PackLink>,
    pub rules: Vec<String>,
    pub budget: PackBudgetReport,
}

/// Per-item and total token budgets.
#[derive(Debug, Clone, Copy)]
pub struct BudgetSpec {
    pub target_total: usize,
    pub state_max: usize,
    pub memory_max_each: usize,
    pub chunk_max_each: usize,
}

/// Everything the assembler consumes. Memories and chunks arrive in final
/// rank order; the assembler only applies budgets and emits the trail.
pub struct PackInputs {
    pub repo: PackRepo,
    pub workspace: String,
    pub state_json: Option<String>,
    pub memories: Vec<MemoryRecord>,
    pub chunks: Vec<ChunkRecord>,
    pub raw_chunks: Option<Vec<ChunkRecord>>,
    pub links: Vec<LinkRecord>,
    pub rules: Vec<String>,
    pub search_meta: Option<SearchMeta>,
    /// Thread ids named directly by the query, for the `why` annotation.
    pub query_threads: Vec<String>,
}

/// Apply budgets and produce the final pack. `used_total` never exceeds
/// `target_total`.
pub fn assemble(inputs: PackInputs, budget: BudgetSpec, tokenizer: &dyn Tokenizer) -> ContextPack {
    let mut used_total = 0usize;

    // Authoritative state goes first, verbatim up to its own cap and the
    // overall target.
    let state_cap = budget.state_max.min(budget.target_total);
    let state = match inputs.state_json.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => {
            let kept = truncate_to_tokens(raw, state_cap, tokenizer);
            used_total += tokenizer.count_tokens(&kept);
            serde_json::from_str(&kept)
                .unwrap_or_else(|_| serde_json::Value::String(kept.clone()))
        }
        None => serde_json::json!({}),
    };

    let mut top_memories = Vec::new();
    let mut included_ids: Vec<String> = Vec::new();
    for memory in &inputs.memories {
        // The per-item cap covers the whole card: the summary gets
        // whatever the title leaves of `memory_max_each`.
        let title = truncate_to_tokens(&memory.title, budget.memory_max_each, tokenizer);
        let title_cost = tokenizer.count_tokens(&title);
        let summary = truncate_to_tokens(
            &memory.summary,
            budget.memory_max_each.saturating_sub(title_cost),
            tokenizer,
        );
        let cost = title_cost + tokenizer.count_tokens(&summary);
        if used_total + cost > budget.target_total {
            break;
        }
        used_total += cost;
        included_ids.push(memory.id.clone());
        top_memories.push(PackMemory {
            id: memory.id.clone(),
            thread_id: memory.thread_id.clone(),
            title,
            summary,
            anchor_commit: memory.anchor_commit.clone(),
            links: vec![],
        });
    }

    // Link trail: deduplicated links among included memories. Memory cards
    // carry their outgoing edges for quick scanning.
    let mut link_trail: Vec<PackLink> = Vec::new();
    for link in &inputs.links {
        if !included_ids.contains(&link.from_id) || !included_ids.contains(&link.to_id) {
            continue;
        }
        if link_trail
            .iter()
            .any(|l| l.from == link.from_id && l.rel == link.rel && l.to == link.to_id)
        {
            continue;
        }
        if let Some(card) = top_memories.iter_mut().find(|m| m.id == link.from_id) {
            card.links.push(format!("{} -> {}", link.rel, link.to_id));
        }
        link_trail.push(PackLink {
            from: link.from_id.clone(),
            rel: link.rel.clone(),
            to: link.to_id.clone(),
        });
    }

    let mut top_chunks = Vec::new();
    for chunk in &inputs.chunks {
        let text = truncate_to_tokens(&chunk.text, budget.chunk_max_each, tokenizer);
        let cost = tokenizer.count_tokens(&text);
        if used_total + cost > budget.target_total {
            break;
        }
        used_total += cost;
        top_chunks.push(chunk_card(chunk, text));
    }

    let top_chunks_raw = inputs.raw_chunks.as_ref().map(|raws| {
        let mut cards = Vec::new();
        for chunk in raws {
            let cost = tokenizer.count_tokens(&chunk.text);
            if used_total + cost > budget.target_total {
                break;
            }
            used_total += cost;
            cards.push(chunk_card(chunk, chunk.text.clone()));
        }
        cards
    });

    let matched_threads = collect_threads(&top_memories, &inputs.query_threads);

    ContextPack {
        version: PACK_VERSION,
        tool: TOOL_NAME.to_string(),
        repo: inputs.repo,
        workspace: inputs.workspace,
        search_meta: inputs.search_meta,
        state,
        matched_threads,
        top_memories,
        top_chunks,
        top_chunks_raw,
        link_trail,
        rules: inputs.rules,
        budget: PackBudgetReport {
            tokenizer: tokenizer.name().to_string(),
            target_total: budget.target_total,
            used_total,
        },
    }
}

fn chunk_card(chunk: &ChunkRecord, text: String) -> PackChunk {
    PackChunk {
        chunk_id: chunk.chunk_id.clone(),
        artifact_id: chunk.artifact_id.clone(),
        thread_id: chunk.thread_id.clone(),
        locator: if chunk.locator.is_empty() {
            None
        } else {
            Some(chunk.locator.clone())
        },
        text,
        sources: vec![],
    }
}

fn collect_threads(memories: &[PackMemory], query_threads: &[String]) -> Vec<MatchedThread> {
    let mut threads: Vec<MatchedThread> = Vec::new();
    for thread_id in query_threads {
        threads.push(MatchedThread {
            thread_id: thread_id.clone(),
            why: "named in the query".to_string(),
        });
    }
    for memory in memories {
        let Some(thread_id) = &memory.thread_id else {
            continue;
        };
        if let Some(existing) = threads.iter_mut().find(|t| &t.thread_id == thread_id) {
            if !existing.why.starts_with("named") {
                existing.why = "referenced by selected memories".to_string();
            }
            continue;
        }
        threads.push(MatchedThread {
            thread_id: thread_id.clone(),
            why: "referenced by selected memories".to_string(),
        });
    }
    threads
}
