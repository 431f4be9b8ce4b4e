pub mod context;
pub mod doctor;
pub mod drain;
pub mod forget;
pub mod ingest;
pub mod link;
pub mod remember;
pub mod search;
pub mod state;
pub mod update;

use std::path::Path;

use crate::config::{AppContext, Config};
use crate::error::Result;
use crate::git::{self, RepoInfo};
use crate::hash::sha256_hex;
use crate::identity::{self, RepoIdentity};
use crate::store::Store;
use crate::store::repos::RepoUpsert;

/// Everything a command needs after repository resolution.
pub(crate) struct RepoHandle {
    pub info: RepoInfo,
    pub ident: RepoIdentity,
    pub cfg: Config,
    pub store: Store,
}

/// Resolve identity for `dir`, open the store, and refresh the repos row.
pub(crate) fn open_repo(ctx: &AppContext, dir: &Path) -> Result<RepoHandle> {
    let info = git::detect(dir);
    let ident = identity::repo_id(&info);
    let cfg = ctx.config_for_repo(&info.root);
    let store = Store::open(&cfg.db_path(&ident.repo_id))?;
    store.ensure_repo(&RepoUpsert {
        repo_id: ident.repo_id.clone(),
        git_root: info.root.display().to_string(),
        origin_hash: if info.origin.is_empty() {
            String::new()
        } else {
            sha256_hex(&info.origin)
        },
        last_head: info.head.clone(),
        last_branch: info.branch.clone(),
    })?;
    Ok(RepoHandle {
        info,
        ident,
        cfg,
        store,
    })
}

/// Queue an item for the embedding worker when a provider is configured.
/// Queue failures are reported but never fail the originating write.
pub(crate) fn enqueue_for_embedding(handle: &RepoHandle, kind: &str, item_id: &str, workspace: &str) {
    if handle.cfg.embedding_provider.is_empty() || handle.cfg.embedding_provider == "none" {
        return;
    }
    if let Err(e) = handle.store.enqueue_embedding(
        &handle.ident.repo_id,
        workspace,
        kind,
        item_id,
        &handle.cfg.embedding_model,
    ) {
        tracing::warn!(error = %e, item_id, "failed to enqueue embedding");
    }
}
