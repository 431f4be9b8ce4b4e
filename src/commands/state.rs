use std::path::Path;

use crate::config::AppContext;
use crate::error::Result;
use crate::output::{Format, print_json, print_kv};
use crate::tokenizer::create_tokenizer;

use super::open_repo;

pub enum StateAction {
    Get,
    Set { state_json: String, reason: String },
    History { limit: usize },
}

pub fn run(
    ctx: &AppContext,
    dir: &Path,
    workspace: &str,
    action: StateAction,
    format: Format,
) -> Result<()> {
    let handle = open_repo(ctx, dir)?;

    match action {
        StateAction::Get => {
            let state = handle.store.get_state(&handle.ident.repo_id, workspace)?;
            match format {
                Format::Json => print_json(&state)?,
                Format::Pretty => print_kv(&[
                    ("workspace", state.workspace.clone()),
                    ("tokens", state.state_tokens.to_string()),
                    ("state", state.state_json.clone()),
                ]),
            }
        }
        StateAction::Set { state_json, reason } => {
            // Validate up front so garbage never becomes authoritative.
            serde_json::from_str::<serde_json::Value>(&state_json)?;
            let tokenizer = create_tokenizer(&handle.cfg.tokenizer);
            let tokens = tokenizer.count_tokens(&state_json) as i64;
            let state = handle.store.set_state(
                &handle.ident.repo_id,
                workspace,
                &state_json,
                tokens,
                &reason,
            )?;
            match format {
                Format::Json => print_json(&state)?,
                Format::Pretty => print_kv(&[
                    ("workspace", state.workspace.clone()),
                    ("tokens", state.state_tokens.to_string()),
                ]),
            }
        }
        StateAction::History { limit } => {
            let history = handle
                .store
                .list_state_history(&handle.ident.repo_id, workspace, limit)?;
            match format {
                Format::Json => print_json(&history)?,
                Format::Pretty => {
                    for entry in &history {
                        println!(
                            "{}  {}  {}",
                            entry.state_id,
                            entry.created_at.to_rfc3339(),
                            entry.reason
                        );
                    }
                }
            }
        }
    }
    Ok(())
}
