use std::path::Path;

use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;

use crate::config::AppContext;
use crate::error::Result;
use crate::git;
use crate::identity;
use crate::store::{Store, schema};
use crate::tokenizer::create_tokenizer;

const REPAIR_REASON: &str = "repair: invalid state_current JSON";

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub repo_id: String,
    pub id_source: String,
    pub git_root: String,
    pub db_path: String,
    pub db_exists: bool,
    pub db_size_bytes: u64,
    pub schema_version: i64,
    pub expected_schema_version: i64,
    pub fts_memories_present: bool,
    pub fts_chunks_present: bool,
    pub invalid_state_workspaces: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.db_exists
            && self.schema_version == self.expected_schema_version
            && self.fts_memories_present
            && self.fts_chunks_present
            && self.invalid_state_workspaces.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairSummary {
    pub state_rows_repaired: usize,
    pub fts_rebuilt: bool,
}

/// Probe the database behind `start_dir`'s repository identity.
///
/// The probe opens the file read-only and does NOT run the bootstrap: a
/// missing FTS table or a stale schema version must be reported as found,
/// not silently recreated by the act of looking.
pub fn check(ctx: &AppContext, start_dir: &Path) -> Result<HealthReport> {
    let info = git::detect(start_dir);
    let ident = identity::repo_id(&info);
    let cfg = ctx.config_for_repo(&info.root);
    let db_path = cfg.db_path(&ident.repo_id);

    let db_exists = db_path.exists();
    let db_size_bytes = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let mut report = HealthReport {
        repo_id: ident.repo_id,
        id_source: ident.source.as_str().to_string(),
        git_root: info.root.display().to_string(),
        db_path: db_path.display().to_string(),
        db_exists,
        db_size_bytes,
        schema_version: 0,
        expected_schema_version: schema::SCHEMA_VERSION,
        fts_memories_present: false,
        fts_chunks_present: false,
        invalid_state_workspaces: vec![],
        remediation: None,
    };
    if !db_exists {
        report.remediation = Some("no database yet; any write operation creates it".into());
        return Ok(report);
    }

    let conn = Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    report.schema_version = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    report.fts_memories_present = table_present(&conn, "memories_fts")?;
    report.fts_chunks_present = table_present(&conn, "chunks_fts")?;
    if table_present(&conn, "state_current")? {
        report.invalid_state_workspaces = invalid_state_workspaces(&conn, &report.repo_id)?;
    }

    if !report.is_healthy() {
        report.remediation = Some("run `mempack doctor --fix`".into());
    }
    Ok(report)
}

fn table_present(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Workspaces whose `state_current.state_json` is not a JSON object.
fn invalid_state_workspaces(conn: &Connection, repo_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT workspace, state_json FROM state_current WHERE repo_id = ?1 ORDER BY workspace",
    )?;
    let rows: Vec<(String, String)> = stmt
        .query_map(params![repo_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|(_, state_json)| !is_valid_state(state_json))
        .map(|(workspace, _)| workspace)
        .collect())
}

fn is_valid_state(raw: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(raw),
        Ok(serde_json::Value::Object(_))
    )
}

/// Rewrite invalid `state_current` rows to `{}` (with a history entry) and
/// rebuild the FTS content when the probe saw a table missing. Opening the
/// store already re-created missing tables; `rebuild_fts` refills them
/// from the primary rows.
pub fn repair(
    store: &Store,
    repo_id: &str,
    tokenizer_name: &str,
    rebuild_fts: bool,
) -> Result<RepairSummary> {
    let tokenizer = create_tokenizer(tokenizer_name);
    let mut repaired = 0usize;

    for (workspace, state_json) in store.list_state_workspaces(repo_id)? {
        if is_valid_state(&state_json) {
            continue;
        }
        let empty = "{}";
        let tokens = tokenizer.count_tokens(empty) as i64;

        // Skip the history append when the latest entry is already this
        // exact repair, so repeated repairs stay idempotent.
        let latest = store.list_state_history(repo_id, &workspace, 1)?;
        let already_recorded = latest
            .first()
            .map(|h| h.reason == REPAIR_REASON && h.state_json == empty)
            .unwrap_or(false);

        if already_recorded {
            store.conn().execute(
                "UPDATE state_current SET state_json = ?1, state_tokens = ?2
                 WHERE repo_id = ?3 AND workspace = ?4",
                params![empty, tokens, repo_id, workspace],
            )?;
        } else {
            store.set_state(repo_id, &workspace, empty, tokens, REPAIR_REASON)?;
        }
        repaired += 1;
    }

    if rebuild_fts {
        schema::rebuild_fts(store.conn())?;
    }

    Ok(RepairSummary {
        state_rows_repaired: repaired,
        fts_rebuilt: rebuild_fts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::NewMemory;

    fn ctx(dir: &Path) -> AppContext {
        AppContext::new(Config {
            data_dir: dir.to_path_buf(),
            ..Config::default()
        })
    }

    fn db_path_for(context: &AppContext, repo_dir: &Path) -> std::path::PathBuf {
        let info = git::detect(repo_dir);
        let ident = identity::repo_id(&info);
        context.config.db_path(&ident.repo_id)
    }

    #[test]
    fn missing_database_reports_unhealthy_with_hint() {
        let data = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let report = check(&ctx(data.path()), repo.path()).unwrap();
        assert!(!report.db_exists);
        assert!(!report.is_healthy());
        assert!(report.remediation.is_some());
        assert!(report.repo_id.starts_with("p_"));
        assert_eq!(report.id_source, "path");
    }

    #[test]
    fn fresh_database_is_healthy() {
        let data = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let context = ctx(data.path());
        Store::open(&db_path_for(&context, repo.path())).unwrap();

        let report = check(&context, repo.path()).unwrap();
        assert!(report.is_healthy());
        assert_eq!(report.schema_version, schema::SCHEMA_VERSION);
        assert!(report.fts_memories_present && report.fts_chunks_present);
    }

    #[test]
    fn dropped_fts_table_is_detected_and_rebuilt() {
        let data = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let context = ctx(data.path());
        let db_path = db_path_for(&context, repo.path());

        {
            let store = Store::open(&db_path).unwrap();
            store
                .add_memory(
                    "r_x",
                    &NewMemory {
                        workspace: "default".into(),
                        title: "find me".into(),
                        summary: "indexed body".into(),
                        summary_tokens: 2,
                        ..Default::default()
                    },
                )
                .unwrap();
            store
                .conn()
                .execute_batch("DROP TRIGGER memories_fts_ad; DROP TABLE memories_fts;")
                .unwrap();
        }

        let report = check(&context, repo.path()).unwrap();
        assert!(!report.fts_memories_present);
        assert!(!report.is_healthy());

        // Opening re-creates the table; the rebuild refills it.
        let store = Store::open(&db_path).unwrap();
        repair(&store, "r_x", "bytes-estimate", true).unwrap();
        let hits: i64 = store
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH '\"indexed\"'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn invalid_state_is_detected_and_repaired() {
        let store = Store::open_memory().unwrap();
        store.set_state("r_1", "default", "{\"ok\":1}", 3, "init").unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO state_current (repo_id, workspace, state_json, state_tokens, updated_at)
                 VALUES ('r_1', 'broken', 'not json', 0, '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();

        let summary = repair(&store, "r_1", "bytes-estimate", false).unwrap();
        assert_eq!(summary.state_rows_repaired, 1);

        let state = store.get_state("r_1", "broken").unwrap();
        assert_eq!(state.state_json, "{}");
        let history = store.list_state_history("r_1", "broken", 5).unwrap();
        assert_eq!(history[0].reason, REPAIR_REASON);
        assert_eq!(history[0].state_json, "{}");
    }

    #[test]
    fn repeated_repair_does_not_stack_history() {
        let store = Store::open_memory().unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO state_current (repo_id, workspace, state_json, state_tokens, updated_at)
                 VALUES ('r_1', 'default', '[1,2]', 0, '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();

        repair(&store, "r_1", "bytes-estimate", false).unwrap();
        store
            .conn()
            .execute("UPDATE state_current SET state_json = 'garbage'", [])
            .unwrap();
        repair(&store, "r_1", "bytes-estimate", false).unwrap();

        let history = store.list_state_history("r_1", "default", 10).unwrap();
        let repairs = history.iter().filter(|h| h.reason == REPAIR_REASON).count();
        assert_eq!(repairs, 1);
    }

    #[test]
    fn non_object_json_counts_as_invalid() {
        assert!(is_valid_state("{}"));
        assert!(is_valid_state("{\"a\":[1,2]}"));
        assert!(!is_valid_state("[1,2]"));
        assert!(!is_valid_state("\"string\""));
        assert!(!is_valid_state("not json"));
    }
}
