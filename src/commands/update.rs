use std::path::Path;

use serde_json::json;

use crate::config::AppContext;
use crate::error::Result;
use crate::model::MemoryPatch;
use crate::output::{Format, print_json, print_kv};
use crate::tokenizer::create_tokenizer;

use super::{enqueue_for_embedding, open_repo};

pub struct UpdateArgs {
    pub id: String,
    pub workspace: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub thread: Option<String>,
    pub tags_set: Option<Vec<String>>,
    pub tags_add: Vec<String>,
    pub tags_remove: Vec<String>,
    pub entities_set: Option<Vec<String>>,
    pub entities_add: Vec<String>,
    pub entities_remove: Vec<String>,
    /// Mark the memory as replaced by this id.
    pub supersede_with: Option<String>,
}

pub fn run(ctx: &AppContext, dir: &Path, args: UpdateArgs, format: Format) -> Result<()> {
    let handle = open_repo(ctx, dir)?;
    let tokenizer = create_tokenizer(&handle.cfg.tokenizer);

    if let Some(new_id) = &args.supersede_with {
        handle
            .store
            .supersede_memory(&handle.ident.repo_id, &args.workspace, &args.id, new_id)?;
        match format {
            Format::Json => print_json(&json!({"id": args.id, "superseded_by": new_id}))?,
            Format::Pretty => print_kv(&[("superseded", format!("{} -> {new_id}", args.id))]),
        }
        return Ok(());
    }

    let summary_tokens = args
        .summary
        .as_deref()
        .map(|s| tokenizer.count_tokens(s) as i64);
    let patch = MemoryPatch {
        title: args.title,
        summary: args.summary,
        summary_tokens,
        thread_id: args.thread,
        anchor_commit: None,
        tags_set: args.tags_set,
        tags_add: args.tags_add,
        tags_remove: args.tags_remove,
        entities_set: args.entities_set,
        entities_add: args.entities_add,
        entities_remove: args.entities_remove,
    };

    let (memory, changed) =
        handle
            .store
            .update_memory(&handle.ident.repo_id, &args.workspace, &args.id, &patch)?;
    if changed {
        enqueue_for_embedding(&handle, "memory", &memory.id, &memory.workspace);
    }

    match format {
        Format::Json => print_json(&json!({"memory": memory, "changed": changed}))?,
        Format::Pretty => print_kv(&[
            ("id", memory.id.clone()),
            ("changed", changed.to_string()),
            ("title", memory.title.clone()),
            ("tags", memory.tags.join(", ")),
            ("entities", memory.entities.join(", ")),
        ]),
    }
    Ok(())
}
