use std::path::Path;

use serde_json::json;

use crate::config::AppContext;
use crate::error::{MempackError, Result};
use crate::output::{Format, print_json};

use super::open_repo;

pub enum LinkAction {
    Add {
        from: String,
        rel: String,
        to: String,
        weight: f64,
    },
    List {
        ids: Vec<String>,
    },
}

pub fn run(
    ctx: &AppContext,
    dir: &Path,
    workspace: &str,
    action: LinkAction,
    format: Format,
) -> Result<()> {
    let handle = open_repo(ctx, dir)?;
    let repo_id = &handle.ident.repo_id;

    match action {
        LinkAction::Add {
            from,
            rel,
            to,
            weight,
        } => {
            // Both endpoints must exist in scope before linking.
            handle.store.get_memory(repo_id, workspace, &from)?;
            handle.store.get_memory(repo_id, workspace, &to)?;
            if handle
                .store
                .would_create_link_cycle(repo_id, workspace, &from, &to)?
            {
                return Err(MempackError::LinkCycle { from, rel, to });
            }
            let inserted = handle.store.add_link_if_missing(&from, &rel, &to, weight)?;
            match format {
                Format::Json => {
                    print_json(&json!({"from": from, "rel": rel, "to": to, "inserted": inserted}))?
                }
                Format::Pretty => {
                    let note = if inserted { "added" } else { "already present" };
                    println!("{from} -{rel}-> {to} ({note})");
                }
            }
        }
        LinkAction::List { ids } => {
            let links = handle.store.list_links_for_ids(repo_id, workspace, &ids)?;
            match format {
                Format::Json => print_json(&links)?,
                Format::Pretty => {
                    for link in &links {
                        println!("{} -{}-> {}", link.from_id, link.rel, link.to_id);
                    }
                }
            }
        }
    }
    Ok(())
}
