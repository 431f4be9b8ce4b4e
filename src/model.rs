use chrono::{DateTime, Utc};
use serde::Serialize;

/// Normalize a workspace name: empty input means `"default"`.
pub fn normalize_workspace(workspace: &str) -> String {
    let trimmed = workspace.trim();
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Whitespace-joined mirror of a tag/entity list, kept beside the JSON form
/// so the full-text index can match individual values.
pub fn join_text(values: &[String]) -> String {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Trim, drop empties, sort and deduplicate a tag/entity list.
pub fn normalize_values(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoRecord {
    pub repo_id: String,
    pub git_root: String,
    pub origin_hash: String,
    pub last_head: String,
    pub last_branch: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub repo_id: String,
    pub workspace: String,
    pub title: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Recomputed from live memories, never stored.
    pub memory_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryRecord {
    pub id: String,
    pub repo_id: String,
    pub workspace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub title: String,
    pub summary: String,
    pub summary_tokens: i64,
    pub tags: Vec<String>,
    pub entities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Active means not soft-deleted and not superseded. A legacy empty
    /// `superseded_by` string counts as unset.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none() && self.superseded_by.as_deref().unwrap_or("").is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewMemory {
    pub workspace: String,
    pub thread_id: Option<String>,
    pub title: String,
    pub summary: String,
    pub summary_tokens: i64,
    pub tags: Vec<String>,
    pub entities: Vec<String>,
    pub anchor_commit: Option<String>,
}

/// Field-level patch for a memory. Tags and entities accept either a full
/// replacement (`set`) or incremental `add`/`remove` lists; when both are
/// given the set is applied first and removal wins over addition.
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub summary_tokens: Option<i64>,
    pub thread_id: Option<String>,
    pub anchor_commit: Option<String>,
    pub tags_set: Option<Vec<String>>,
    pub tags_add: Vec<String>,
    pub tags_remove: Vec<String>,
    pub entities_set: Option<Vec<String>>,
    pub entities_add: Vec<String>,
    pub entities_remove: Vec<String>,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.summary.is_none()
            && self.thread_id.is_none()
            && self.anchor_commit.is_none()
            && self.tags_set.is_none()
            && self.tags_add.is_empty()
            && self.tags_remove.is_empty()
            && self.entities_set.is_none()
            && self.entities_add.is_empty()
            && self.entities_remove.is_empty()
    }
}

/// Merge set/add/remove semantics against the current list.
pub fn merge_values(
    current: &[String],
    set: Option<&Vec<String>>,
    add: &[String],
    remove: &[String],
) -> Vec<String> {
    let mut values = match set {
        Some(replacement) => replacement.clone(),
        None => current.to_vec(),
    };
    values.extend(add.iter().cloned());
    let removal: Vec<String> = normalize_values(remove);
    let mut merged = normalize_values(&values);
    merged.retain(|v| !removal.contains(v));
    merged
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub repo_id: String,
    pub workspace: String,
    pub kind: String,
    pub source: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewArtifact {
    pub workspace: String,
    pub kind: String,
    pub source: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub repo_id: String,
    pub workspace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub locator: String,
    pub text: String,
    pub text_hash: String,
    pub text_tokens: i64,
    pub tags: Vec<String>,
    pub chunk_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_kind: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewChunk {
    pub thread_id: Option<String>,
    pub locator: String,
    pub text: String,
    /// Computed from `text` when empty.
    pub text_hash: String,
    pub text_tokens: i64,
    pub tags: Vec<String>,
    /// Defaults to `"line"` when empty.
    pub chunk_type: String,
    pub symbol_name: Option<String>,
    pub symbol_kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LinkRecord {
    pub from_id: String,
    pub rel: String,
    pub to_id: String,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateRecord {
    pub repo_id: String,
    pub workspace: String,
    pub state_json: String,
    pub state_tokens: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateHistoryRecord {
    pub state_id: String,
    pub repo_id: String,
    pub workspace: String,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    pub state_json: String,
    pub state_tokens: i64,
}

/// What gets embedded: a memory's card or a chunk's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbeddingKind {
    Memory,
    Chunk,
}

impl EmbeddingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Chunk => "chunk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "memory" => Some(Self::Memory),
            "chunk" => Some(Self::Chunk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub repo_id: String,
    pub workspace: String,
    pub kind: EmbeddingKind,
    pub item_id: String,
    pub model: String,
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub queue_id: i64,
    pub repo_id: String,
    pub workspace: String,
    pub kind: String,
    pub item_id: String,
    pub model: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Deterministic embedding text for a memory. Empty lines are omitted, so
/// an entirely empty card yields an empty string (never embedded).
pub fn memory_embedding_text(
    title: &str,
    summary: &str,
    tags_text: &str,
    entities_text: &str,
) -> String {
    let mut lines = Vec::new();
    if !title.is_empty() {
        lines.push(title.to_string());
    }
    if !summary.is_empty() {
        lines.push(summary.to_string());
    }
    if !tags_text.is_empty() {
        lines.push(format!("Tags: {tags_text}"));
    }
    if !entities_text.is_empty() {
        lines.push(format!("Entities: {entities_text}"));
    }
    lines.join("\n")
}

/// Deterministic embedding text for a chunk.
pub fn chunk_embedding_text(locator: &str, text: &str, tags_text: &str) -> String {
    let mut lines = Vec::new();
    if !locator.is_empty() {
        lines.push(format!("Locator: {locator}"));
    }
    if !text.is_empty() {
        lines.push(text.to_string());
    }
    if !tags_text.is_empty() {
        lines.push(format!("Tags: {tags_text}"));
    }
    lines.join("\n")
}

/// Content hash of an embedding text; empty text hashes to the empty
/// string so it is never considered fresh.
pub fn embedding_content_hash(text: &str) -> String {
    if text.is_empty() {
        String::new()
    } else {
        crate::hash::sha256_hex(text)
    }
}
