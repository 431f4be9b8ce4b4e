use std::path::Path;

use serde_json::json;

use crate::config::AppContext;
use crate::embed::{EmbeddingProvider, provider_from_config};
use crate::error::Result;
use crate::model::{EmbeddingKind, embedding_content_hash};
use crate::output::{Format, print_json};

use super::open_repo;

/// Queue entries embedded per provider round-trip.
const BATCH_SIZE: usize = 16;

pub struct DrainArgs {
    pub workspace: String,
    /// Sweep live items for stale embeddings before draining.
    pub sweep: bool,
    /// Maximum number of batches; 0 means drain until empty.
    pub max_batches: usize,
}

/// The out-of-band embedding worker: pull queued items, embed them through
/// the provider, upsert vectors. Provider failures leave entries queued.
pub fn run(ctx: &AppContext, dir: &Path, args: DrainArgs, format: Format) -> Result<()> {
    let handle = open_repo(ctx, dir)?;
    let Some(provider) = provider_from_config(&handle.cfg, None) else {
        return Err(crate::error::MempackError::Config(
            "no embedding provider configured".into(),
        ));
    };

    let mut enqueued = 0usize;
    if args.sweep {
        enqueued = handle.store.enqueue_stale_items(
            &handle.ident.repo_id,
            &args.workspace,
            provider.model(),
        )?;
    }

    let mut embedded = 0usize;
    let mut skipped = 0usize;
    let mut batches = 0usize;
    loop {
        if args.max_batches > 0 && batches >= args.max_batches {
            break;
        }
        let entries = handle.store.peek_embedding_queue(BATCH_SIZE)?;
        if entries.is_empty() {
            break;
        }
        batches += 1;

        // Resolve texts first; entries whose item vanished or emptied are
        // dropped from the queue without an embed call.
        let mut to_embed = Vec::new();
        let mut processed_ids = Vec::new();
        for entry in &entries {
            let Some(kind) = EmbeddingKind::parse(&entry.kind) else {
                processed_ids.push(entry.queue_id);
                skipped += 1;
                continue;
            };
            let text = handle.store.embedding_text(
                &entry.repo_id,
                &entry.workspace,
                kind,
                &entry.item_id,
            )?;
            match text.filter(|t| !t.is_empty()) {
                Some(text) => to_embed.push((entry, kind, text)),
                None => {
                    processed_ids.push(entry.queue_id);
                    skipped += 1;
                }
            }
        }

        if !to_embed.is_empty() {
            let texts: Vec<String> = to_embed.iter().map(|(_, _, t)| t.clone()).collect();
            let vectors = provider.embed(&texts)?;
            for ((entry, kind, text), vector) in to_embed.iter().zip(vectors.iter()) {
                handle.store.upsert_embedding(
                    &entry.repo_id,
                    &entry.workspace,
                    *kind,
                    &entry.item_id,
                    &entry.model,
                    &embedding_content_hash(text),
                    vector,
                )?;
                processed_ids.push(entry.queue_id);
                embedded += 1;
            }
        }

        handle.store.remove_queue_entries(&processed_ids)?;
    }

    match format {
        Format::Json => print_json(&json!({
            "enqueued": enqueued,
            "embedded": embedded,
            "skipped": skipped,
            "batches": batches,
        }))?,
        Format::Pretty => {
            println!("{embedded} embedded, {skipped} skipped, {batches} batches");
        }
    }
    Ok(())
}
