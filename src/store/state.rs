use rusqlite::params;

use super::{Store, parse_dt};
use crate::error::{MempackError, Result};
use crate::ids::{self, IdPrefix, now_timestamp};
use crate::model::{StateHistoryRecord, StateRecord, normalize_workspace};

impl Store {
    pub fn get_state(&self, repo_id: &str, workspace: &str) -> Result<StateRecord> {
        let workspace = normalize_workspace(workspace);
        let mut stmt = self.conn.prepare(
            "SELECT repo_id, workspace, state_json, state_tokens, updated_at
             FROM state_current WHERE repo_id = ?1 AND workspace = ?2",
        )?;
        stmt.query_row(params![repo_id, workspace.clone()], |row| {
            Ok(StateRecord {
                repo_id: row.get(0)?,
                workspace: row.get(1)?,
                state_json: row.get(2)?,
                state_tokens: row.get(3)?,
                updated_at: parse_dt(&row.get::<_, String>(4)?),
            })
        })
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => MempackError::StateNotFound(workspace),
            other => other.into(),
        })
    }

    /// Write a new workspace state. The new snapshot is appended to history
    /// first, then the current row is upserted, in one transaction.
    pub fn set_state(
        &self,
        repo_id: &str,
        workspace: &str,
        state_json: &str,
        state_tokens: i64,
        reason: &str,
    ) -> Result<StateRecord> {
        if repo_id.is_empty() {
            return Err(MempackError::MissingIdentifier("repo_id"));
        }
        let workspace = normalize_workspace(workspace);
        let now = now_timestamp();
        let state_id = ids::generate(IdPrefix::StateHistory)?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO state_history (state_id, repo_id, workspace, created_at, reason, state_json, state_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![state_id, repo_id, workspace, now, reason, state_json, state_tokens],
        )?;
        tx.execute(
            "INSERT INTO state_current (repo_id, workspace, state_json, state_tokens, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(repo_id, workspace) DO UPDATE SET
                 state_json = excluded.state_json,
                 state_tokens = excluded.state_tokens,
                 updated_at = excluded.updated_at",
            params![repo_id, workspace, state_json, state_tokens, now],
        )?;
        tx.commit()?;

        self.get_state(repo_id, &workspace)
    }

    /// History entries for a workspace, newest first.
    pub fn list_state_history(
        &self,
        repo_id: &str,
        workspace: &str,
        limit: usize,
    ) -> Result<Vec<StateHistoryRecord>> {
        let workspace = normalize_workspace(workspace);
        let mut stmt = self.conn.prepare(
            "SELECT state_id, repo_id, workspace, created_at, reason, state_json, state_tokens
             FROM state_history
             WHERE repo_id = ?1 AND workspace = ?2
             ORDER BY created_at DESC, state_id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![repo_id, workspace, limit as i64], |row| {
            Ok(StateHistoryRecord {
                state_id: row.get(0)?,
                repo_id: row.get(1)?,
                workspace: row.get(2)?,
                created_at: parse_dt(&row.get::<_, String>(3)?),
                reason: row.get(4)?,
                state_json: row.get(5)?,
                state_tokens: row.get(6)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Workspaces with a current state row, for the health surface.
    pub fn list_state_workspaces(&self, repo_id: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT workspace, state_json FROM state_current WHERE repo_id = ?1 ORDER BY workspace",
        )?;
        let rows = stmt.query_map(params![repo_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}
