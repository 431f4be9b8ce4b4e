use std::fs;
use std::io::Read;
use std::path::Path;

use serde_json::json;

use crate::config::AppContext;
use crate::error::Result;
use crate::hash::sha256_hex;
use crate::model::{NewArtifact, NewChunk};
use crate::output::{Format, print_json};
use crate::tokenizer::create_tokenizer;

use super::{enqueue_for_embedding, open_repo};

/// Lines per chunk when windowing an ingested file.
const WINDOW_LINES: usize = 20;

pub struct IngestArgs {
    /// File to ingest; `-` reads stdin.
    pub path: String,
    pub workspace: String,
    pub kind: String,
    pub thread: Option<String>,
    pub tags: Vec<String>,
    /// Soft-delete previous chunks from the same source first.
    pub replace: bool,
}

pub fn run(ctx: &AppContext, dir: &Path, args: IngestArgs, format: Format) -> Result<()> {
    let handle = open_repo(ctx, dir)?;
    let tokenizer = create_tokenizer(&handle.cfg.tokenizer);

    let (source, content) = if args.path == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        ("stdin".to_string(), buffer)
    } else {
        (args.path.clone(), fs::read_to_string(&args.path)?)
    };

    if args.replace {
        let removed =
            handle
                .store
                .delete_chunks_by_source(&handle.ident.repo_id, &args.workspace, &source)?;
        tracing::debug!(removed, source = %source, "replaced prior chunks");
    }

    let chunks = window_chunks(
        &source,
        &content,
        args.thread.as_deref(),
        &args.tags,
        tokenizer.as_ref(),
    );
    let result = handle.store.add_artifact_with_chunks(
        &handle.ident.repo_id,
        &NewArtifact {
            workspace: args.workspace.clone(),
            kind: args.kind,
            source,
            content_hash: sha256_hex(&content),
        },
        &chunks,
    )?;
    for chunk_id in &result.inserted_ids {
        enqueue_for_embedding(&handle, "chunk", chunk_id, &result.artifact.workspace);
    }

    match format {
        Format::Json => print_json(&json!({
            "artifact_id": result.artifact.artifact_id,
            "source": result.artifact.source,
            "inserted": result.inserted_count,
            "skipped_duplicates": result.skipped_duplicates,
        }))?,
        Format::Pretty => println!(
            "{}: {} chunks inserted, {} duplicates skipped",
            result.artifact.artifact_id, result.inserted_count, result.skipped_duplicates
        ),
    }
    Ok(())
}

/// Split file content into fixed line windows, one chunk each. Locators
/// carry the source and the 1-based start line.
fn window_chunks(
    source: &str,
    content: &str,
    thread: Option<&str>,
    tags: &[String],
    tokenizer: &dyn crate::tokenizer::Tokenizer,
) -> Vec<NewChunk> {
    let lines: Vec<&str> = content.lines().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < lines.len() {
        let end = (start + WINDOW_LINES).min(lines.len());
        let text = lines[start..end].join("\n");
        if !text.trim().is_empty() {
            chunks.push(NewChunk {
                thread_id: thread.map(String::from),
                locator: format!("{source}:{}", start + 1),
                text_tokens: tokenizer.count_tokens(&text) as i64,
                text,
                tags: tags.to_vec(),
                ..NewChunk::default()
            });
        }
        start = end;
    }
    chunks
}
