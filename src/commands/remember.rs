use std::path::Path;

use crate::config::AppContext;
use crate::error::Result;
use crate::model::NewMemory;
use crate::output::{Format, print_json, print_kv};
use crate::tokenizer::create_tokenizer;

use super::{enqueue_for_embedding, open_repo};

pub struct RememberArgs {
    pub title: String,
    pub summary: String,
    pub workspace: String,
    pub thread: Option<String>,
    pub tags: Vec<String>,
    pub entities: Vec<String>,
    /// Anchor the memory to the current HEAD commit.
    pub anchor: bool,
}

pub fn run(ctx: &AppContext, dir: &Path, args: RememberArgs, format: Format) -> Result<()> {
    let handle = open_repo(ctx, dir)?;
    let tokenizer = create_tokenizer(&handle.cfg.tokenizer);

    let anchor_commit = if args.anchor && !handle.info.head.is_empty() {
        Some(handle.info.head.clone())
    } else {
        None
    };
    // Unthreaded writes land on the configured default thread.
    let thread_id = args
        .thread
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| Some(handle.cfg.default_thread.clone()));

    let memory = handle.store.add_memory(
        &handle.ident.repo_id,
        &NewMemory {
            workspace: args.workspace.clone(),
            thread_id,
            title: args.title,
            summary: args.summary.clone(),
            summary_tokens: tokenizer.count_tokens(&args.summary) as i64,
            tags: args.tags,
            entities: args.entities,
            anchor_commit,
        },
    )?;
    enqueue_for_embedding(&handle, "memory", &memory.id, &memory.workspace);

    match format {
        Format::Json => print_json(&memory)?,
        Format::Pretty => print_kv(&[
            ("id", memory.id.clone()),
            ("thread", memory.thread_id.clone().unwrap_or_default()),
            ("title", memory.title.clone()),
            ("summary", memory.summary.clone()),
            ("tags", memory.tags.join(", ")),
            ("anchor", memory.anchor_commit.clone().unwrap_or_default()),
        ]),
    }
    Ok(())
}
