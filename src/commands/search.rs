use std::path::Path;

use serde_json::json;

use crate::config::AppContext;
use crate::error::Result;
use crate::output::{Format, print_json, truncate_text};

use super::open_repo;

pub struct SearchArgs {
    pub query: String,
    pub workspace: String,
    pub limit: usize,
    /// Search ingested chunks instead of memories.
    pub chunks: bool,
}

pub fn run(ctx: &AppContext, dir: &Path, args: SearchArgs, format: Format) -> Result<()> {
    let handle = open_repo(ctx, dir)?;

    if args.chunks {
        let outcome = handle.store.search_chunks(
            &handle.ident.repo_id,
            &args.workspace,
            &args.query,
            args.limit,
        )?;
        let rewrites: Vec<String> = outcome.rewrites_applied.iter().map(|r| r.display()).collect();
        match format {
            Format::Json => print_json(&json!({
                "hits": outcome.hits.iter().map(|h| json!({
                    "chunk_id": h.item.chunk_id,
                    "locator": h.item.locator,
                    "text": h.item.text,
                    "score": h.score,
                })).collect::<Vec<_>>(),
                "rewritten": outcome.rewritten,
                "rewrites_applied": rewrites,
                "rewrite_matched": outcome.rewrite_matched,
            }))?,
            Format::Pretty => {
                for hit in &outcome.hits {
                    println!(
                        "{:8.3}  {}  {}",
                        hit.score,
                        hit.item.locator,
                        truncate_text(&hit.item.text.replace('\n', " "), 80)
                    );
                }
                if outcome.rewritten {
                    println!("(rewritten: {})", rewrites.join("; "));
                }
            }
        }
        return Ok(());
    }

    let outcome = handle.store.search_memories(
        &handle.ident.repo_id,
        &args.workspace,
        &args.query,
        args.limit,
    )?;
    let rewrites: Vec<String> = outcome.rewrites_applied.iter().map(|r| r.display()).collect();
    match format {
        Format::Json => print_json(&json!({
            "hits": outcome.hits.iter().map(|h| json!({
                "memory": h.item,
                "score": h.score,
            })).collect::<Vec<_>>(),
            "rewritten": outcome.rewritten,
            "rewrites_applied": rewrites,
            "rewrite_matched": outcome.rewrite_matched,
        }))?,
        Format::Pretty => {
            for hit in &outcome.hits {
                println!(
                    "{:8.3}  {}  {}",
                    hit.score,
                    hit.item.id,
                    truncate_text(&hit.item.title, 60)
                );
            }
            if outcome.rewritten {
                println!("(rewritten: {})", rewrites.join("; "));
            }
        }
    }
    Ok(())
}
