use std::path::Path;
use std::time::Duration;

use crate::config::AppContext;
use crate::error::Result;
use crate::output::{Format, print_json, print_json_pretty};
use crate::retrieve::{RetrieveRequest, build_context_pack};

pub struct ContextArgs {
    pub query: String,
    pub workspace: String,
    pub limit: usize,
    pub include_raw: bool,
    pub rules: Vec<String>,
    pub budget: Option<usize>,
    pub timeout_secs: Option<u64>,
}

pub fn run(ctx: &AppContext, dir: &Path, args: ContextArgs, format: Format) -> Result<()> {
    let pack = build_context_pack(
        ctx,
        dir,
        &RetrieveRequest {
            query: args.query,
            workspace: args.workspace,
            limit: args.limit,
            include_raw: args.include_raw,
            rules: args.rules,
            budget_override: args.budget,
            deadline: args.timeout_secs.map(Duration::from_secs),
        },
    )?;

    match format {
        Format::Json => print_json(&pack)?,
        Format::Pretty => print_json_pretty(&pack)?,
    }
    Ok(())
}
