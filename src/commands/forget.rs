use std::path::Path;

use serde_json::json;

use crate::config::AppContext;
use crate::error::Result;
use crate::output::{Format, print_json};

use super::open_repo;

pub enum ForgetTarget {
    Memory { id: String, purge: bool },
    Chunk { id: String },
    Source { source: String },
}

pub fn run(
    ctx: &AppContext,
    dir: &Path,
    workspace: &str,
    target: ForgetTarget,
    format: Format,
) -> Result<()> {
    let handle = open_repo(ctx, dir)?;
    let repo_id = &handle.ident.repo_id;

    let payload = match target {
        ForgetTarget::Memory { id, purge } => {
            let affected = if purge {
                handle.store.purge_memory(repo_id, workspace, &id)?
            } else {
                handle.store.forget_memory(repo_id, workspace, &id)?
            };
            json!({"id": id, "purged": purge, "affected": affected})
        }
        ForgetTarget::Chunk { id } => {
            let affected = handle.store.forget_chunk(repo_id, workspace, &id)?;
            json!({"id": id, "affected": affected})
        }
        ForgetTarget::Source { source } => {
            let count = handle
                .store
                .delete_chunks_by_source(repo_id, workspace, &source)?;
            json!({"source": source, "chunks_deleted": count})
        }
    };

    match format {
        Format::Json => print_json(&payload)?,
        Format::Pretty => println!("{payload}"),
    }
    Ok(())
}
