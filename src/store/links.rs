use std::collections::HashSet;

use rusqlite::params;

use super::{Store, parse_dt};
use crate::error::Result;
use crate::ids::now_timestamp;
use crate::model::{LinkRecord, normalize_workspace};

impl Store {
    /// Insert the link only if `(from_id, rel, to_id)` is absent. Returns
    /// whether a row was inserted.
    pub fn add_link_if_missing(
        &self,
        from_id: &str,
        rel: &str,
        to_id: &str,
        weight: f64,
    ) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO links (from_id, rel, to_id, weight, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![from_id, rel, to_id, weight, now_timestamp()],
        )?;
        Ok(inserted > 0)
    }

    /// True when closing `from -> to` would create a directed cycle among
    /// the active, non-superseded memories of `(repo, workspace)`.
    ///
    /// Implemented as an iterative walk from `to`; the visited set is
    /// bounded by the number of active memories in scope.
    pub fn would_create_link_cycle(
        &self,
        repo_id: &str,
        workspace: &str,
        from_id: &str,
        to_id: &str,
    ) -> Result<bool> {
        if from_id == to_id {
            return Ok(true);
        }
        let workspace = normalize_workspace(workspace);

        let mut stmt = self.conn.prepare(
            "SELECT l.to_id FROM links l
             JOIN memories src ON src.id = l.from_id
             JOIN memories dst ON dst.id = l.to_id
             WHERE l.from_id = ?1
               AND src.repo_id = ?2 AND src.workspace = ?3 AND src.deleted_at IS NULL
               AND (src.superseded_by IS NULL OR src.superseded_by = '')
               AND dst.repo_id = ?2 AND dst.workspace = ?3 AND dst.deleted_at IS NULL
               AND (dst.superseded_by IS NULL OR dst.superseded_by = '')",
        )?;

        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier = vec![to_id.to_string()];
        while let Some(node) = frontier.pop() {
            if node == from_id {
                return Ok(true);
            }
            if !visited.insert(node.clone()) {
                continue;
            }
            let next = stmt.query_map(params![node, repo_id, workspace], |row| {
                row.get::<_, String>(0)
            })?;
            for target in next {
                let target = target?;
                if !visited.contains(&target) {
                    frontier.push(target);
                }
            }
        }
        Ok(false)
    }

    /// Links whose both endpoints are active, non-superseded memories in
    /// the given scope and appear in `ids`.
    pub fn list_links_for_ids(
        &self,
        repo_id: &str,
        workspace: &str,
        ids: &[String],
    ) -> Result<Vec<LinkRecord>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let workspace = normalize_workspace(workspace);
        let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 3)).collect();
        let sql = format!(
            "SELECT l.from_id, l.rel, l.to_id, l.weight, l.created_at FROM links l
             JOIN memories src ON src.id = l.from_id
             JOIN memories dst ON dst.id = l.to_id
             WHERE src.repo_id = ?1 AND src.workspace = ?2 AND src.deleted_at IS NULL
               AND (src.superseded_by IS NULL OR src.superseded_by = '')
               AND dst.repo_id = ?1 AND dst.workspace = ?2 AND dst.deleted_at IS NULL
               AND (dst.superseded_by IS NULL OR dst.superseded_by = '')
               AND l.from_id IN ({ph}) AND l.to_id IN ({ph})
             ORDER BY l.from_id, l.rel, l.to_id",
            ph = placeholders.join(", ")
        );

        let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
            Box::new(repo_id.to_string()),
            Box::new(workspace),
        ];
        for id in ids {
            params_vec.push(Box::new(id.clone()));
        }
        let params_slice: Vec<&dyn rusqlite::types::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_slice.as_slice(), |row| {
            Ok(LinkRecord {
                from_id: row.get(0)?,
                rel: row.get(1)?,
                to_id: row.get(2)?,
                weight: row.get(3)?,
                created_at: parse_dt(&row.get::<_, String>(4)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}
