use rusqlite::Connection;

use crate::error::{MempackError, Result};
use crate::hash::sha256_hex;
use crate::ids::now_timestamp;

/// Current schema version, recorded in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 9;

/// Static schema DDL, current shape. Legacy databases converge onto this
/// shape through the migration table below.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS repos (
    repo_id TEXT PRIMARY KEY,
    git_root TEXT NOT NULL DEFAULT '',
    origin_hash TEXT NOT NULL DEFAULT '',
    last_head TEXT NOT NULL DEFAULT '',
    last_branch TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS threads (
    thread_id TEXT NOT NULL,
    repo_id TEXT NOT NULL,
    workspace TEXT NOT NULL DEFAULT 'default',
    title TEXT NOT NULL DEFAULT '',
    tags_json TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    PRIMARY KEY (thread_id, repo_id, workspace)
);

CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    repo_id TEXT NOT NULL,
    workspace TEXT NOT NULL DEFAULT 'default',
    thread_id TEXT,
    title TEXT NOT NULL DEFAULT '',
    summary TEXT NOT NULL DEFAULT '',
    summary_tokens INTEGER NOT NULL DEFAULT 0,
    tags_json TEXT NOT NULL DEFAULT '[]',
    tags_text TEXT NOT NULL DEFAULT '',
    entities_json TEXT NOT NULL DEFAULT '[]',
    entities_text TEXT NOT NULL DEFAULT '',
    anchor_commit TEXT,
    superseded_by TEXT,
    deleted_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS artifacts (
    artifact_id TEXT PRIMARY KEY,
    repo_id TEXT NOT NULL,
    workspace TEXT NOT NULL DEFAULT 'default',
    kind TEXT NOT NULL DEFAULT '',
    source TEXT NOT NULL DEFAULT '',
    content_hash TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    chunk_id TEXT PRIMARY KEY,
    repo_id TEXT NOT NULL,
    workspace TEXT NOT NULL DEFAULT 'default',
    artifact_id TEXT,
    thread_id TEXT,
    locator TEXT NOT NULL DEFAULT '',
    text TEXT NOT NULL DEFAULT '',
    text_hash TEXT NOT NULL DEFAULT '',
    text_tokens INTEGER NOT NULL DEFAULT 0,
    tags_json TEXT NOT NULL DEFAULT '[]',
    tags_text TEXT NOT NULL DEFAULT '',
    chunk_type TEXT NOT NULL DEFAULT 'line',
    symbol_name TEXT,
    symbol_kind TEXT,
    created_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS links (
    from_id TEXT NOT NULL,
    rel TEXT NOT NULL,
    to_id TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    PRIMARY KEY (from_id, rel, to_id)
);

CREATE TABLE IF NOT EXISTS state_current (
    repo_id TEXT NOT NULL,
    workspace TEXT NOT NULL DEFAULT 'default',
    state_json TEXT NOT NULL DEFAULT '{}',
    state_tokens INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (repo_id, workspace)
);

CREATE TABLE IF NOT EXISTS state_history (
    state_id TEXT PRIMARY KEY,
    repo_id TEXT NOT NULL,
    workspace TEXT NOT NULL DEFAULT 'default',
    created_at TEXT NOT NULL,
    reason TEXT NOT NULL DEFAULT '',
    state_json TEXT NOT NULL,
    state_tokens INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS embeddings (
    repo_id TEXT NOT NULL,
    workspace TEXT NOT NULL,
    kind TEXT NOT NULL,
    item_id TEXT NOT NULL,
    model TEXT NOT NULL,
    content_hash TEXT NOT NULL DEFAULT '',
    vector_json TEXT NOT NULL,
    vector_dim INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (repo_id, workspace, kind, item_id, model)
);

CREATE TABLE IF NOT EXISTS embedding_queue (
    queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id TEXT NOT NULL,
    workspace TEXT NOT NULL,
    kind TEXT NOT NULL,
    item_id TEXT NOT NULL,
    model TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    UNIQUE (repo_id, workspace, kind, item_id, model)
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    title, summary, tags, entities,
    repo_id UNINDEXED, workspace UNINDEXED, mem_id UNINDEXED,
    tokenize = 'porter unicode61 tokenchars ''_'''
);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    locator, text, tags,
    repo_id UNINDEXED, workspace UNINDEXED, chunk_id UNINDEXED, thread_id UNINDEXED,
    tokenize = 'porter unicode61 tokenchars ''_'''
);
";

/// Triggers keeping the FTS tables consistent with their primary tables.
/// Dropped and re-created on every bootstrap so shape changes land.
const TRIGGERS: &[(&str, &str)] = &[
    (
        "memories_fts_ai",
        "CREATE TRIGGER memories_fts_ai AFTER INSERT ON memories
         WHEN NEW.deleted_at IS NULL
         BEGIN
             INSERT INTO memories_fts(rowid, title, summary, tags, entities, repo_id, workspace, mem_id)
             VALUES (NEW.rowid, NEW.title, NEW.summary, NEW.tags_text, NEW.entities_text,
                     NEW.repo_id, NEW.workspace, NEW.id);
         END",
    ),
    (
        "memories_fts_au",
        "CREATE TRIGGER memories_fts_au AFTER UPDATE ON memories
         BEGIN
             DELETE FROM memories_fts WHERE rowid = OLD.rowid;
             INSERT INTO memories_fts(rowid, title, summary, tags, entities, repo_id, workspace, mem_id)
             SELECT NEW.rowid, NEW.title, NEW.summary, NEW.tags_text, NEW.entities_text,
                    NEW.repo_id, NEW.workspace, NEW.id
             WHERE NEW.deleted_at IS NULL;
         END",
    ),
    (
        "memories_fts_ad",
        "CREATE TRIGGER memories_fts_ad AFTER DELETE ON memories
         BEGIN
             DELETE FROM memories_fts WHERE rowid = OLD.rowid;
         END",
    ),
    (
        "chunks_fts_ai",
        "CREATE TRIGGER chunks_fts_ai AFTER INSERT ON chunks
         WHEN NEW.deleted_at IS NULL
         BEGIN
             INSERT INTO chunks_fts(rowid, locator, text, tags, repo_id, workspace, chunk_id, thread_id)
             VALUES (NEW.rowid, NEW.locator, NEW.text, NEW.tags_text,
                     NEW.repo_id, NEW.workspace, NEW.chunk_id, NEW.thread_id);
         END",
    ),
    (
        "chunks_fts_au",
        "CREATE TRIGGER chunks_fts_au AFTER UPDATE ON chunks
         BEGIN
             DELETE FROM chunks_fts WHERE rowid = OLD.rowid;
             INSERT INTO chunks_fts(rowid, locator, text, tags, repo_id, workspace, chunk_id, thread_id)
             SELECT NEW.rowid, NEW.locator, NEW.text, NEW.tags_text,
                    NEW.repo_id, NEW.workspace, NEW.chunk_id, NEW.thread_id
             WHERE NEW.deleted_at IS NULL;
         END",
    ),
    (
        "chunks_fts_ad",
        "CREATE TRIGGER chunks_fts_ad AFTER DELETE ON chunks
         BEGIN
             DELETE FROM chunks_fts WHERE rowid = OLD.rowid;
         END",
    ),
];

struct Migration {
    version: i64,
    description: &'static str,
    up: fn(&Connection) -> Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "ensure memory columns",
        up: migrate_memory_columns,
    },
    Migration {
        version: 2,
        description: "ensure chunk columns",
        up: migrate_chunk_columns,
    },
    Migration {
        version: 3,
        description: "ensure scoped indexes",
        up: migrate_indexes,
    },
    Migration {
        version: 4,
        description: "rebuild threads with compound primary key",
        up: migrate_threads_pk,
    },
    Migration {
        version: 5,
        description: "backfill workspace='default'",
        up: migrate_workspace_backfill,
    },
    Migration {
        version: 6,
        description: "backfill chunk text_hash",
        up: migrate_text_hash_backfill,
    },
    Migration {
        version: 7,
        description: "deduplicate chunks and add unique index",
        up: migrate_chunk_dedup,
    },
    Migration {
        version: 8,
        description: "backfill chunk_type and deduplicate links",
        up: migrate_chunk_type_and_links,
    },
    Migration {
        version: 9,
        description: "rebuild FTS tables from primary rows",
        up: migrate_fts_rebuild,
    },
];

/// One-shot idempotent bootstrap: schema DDL, ordered migrations keyed off
/// `user_version`, trigger install, version bump, audit timestamp.
pub fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    let from: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let mut migrated = false;
    for migration in MIGRATIONS {
        if migration.version <= from {
            continue;
        }
        tracing::debug!(version = migration.version, "applying migration: {}", migration.description);
        (migration.up)(conn).map_err(|e| MempackError::Migration {
            version: migration.version,
            message: e.to_string(),
        })?;
        conn.pragma_update(None, "user_version", migration.version)?;
        migrated = true;
    }

    install_triggers(conn)?;

    if migrated {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('last_migration_at', ?1)
             ON CONFLICT(key) DO UPDATE SET value = ?1",
            [now_timestamp()],
        )?;
    }
    Ok(())
}

pub fn install_triggers(conn: &Connection) -> Result<()> {
    for (name, create) in TRIGGERS {
        conn.execute_batch(&format!("DROP TRIGGER IF EXISTS {name}; {create};"))?;
    }
    Ok(())
}

/// Drop and refill both FTS tables from the live primary rows. Used by the
/// final migration and by health repair when an FTS table went missing.
pub fn rebuild_fts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DELETE FROM memories_fts;
         INSERT INTO memories_fts(rowid, title, summary, tags, entities, repo_id, workspace, mem_id)
         SELECT rowid, title, summary, tags_text, entities_text, repo_id, workspace, id
         FROM memories WHERE deleted_at IS NULL;
         DELETE FROM chunks_fts;
         INSERT INTO chunks_fts(rowid, locator, text, tags, repo_id, workspace, chunk_id, thread_id)
         SELECT rowid, locator, text, tags_text, repo_id, workspace, chunk_id, thread_id
         FROM chunks WHERE deleted_at IS NULL;",
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    if !column_exists(conn, table, column)? {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    }
    Ok(())
}

fn migrate_memory_columns(conn: &Connection) -> Result<()> {
    ensure_column(conn, "memories", "workspace", "TEXT NOT NULL DEFAULT 'default'")?;
    ensure_column(conn, "memories", "summary_tokens", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(conn, "memories", "tags_text", "TEXT NOT NULL DEFAULT ''")?;
    ensure_column(conn, "memories", "entities_json", "TEXT NOT NULL DEFAULT '[]'")?;
    ensure_column(conn, "memories", "entities_text", "TEXT NOT NULL DEFAULT ''")?;
    ensure_column(conn, "memories", "anchor_commit", "TEXT")?;
    ensure_column(conn, "memories", "superseded_by", "TEXT")?;
    ensure_column(conn, "memories", "deleted_at", "TEXT")?;
    Ok(())
}

fn migrate_chunk_columns(conn: &Connection) -> Result<()> {
    ensure_column(conn, "chunks", "workspace", "TEXT NOT NULL DEFAULT 'default'")?;
    ensure_column(conn, "artifacts", "workspace", "TEXT NOT NULL DEFAULT 'default'")?;
    ensure_column(conn, "chunks", "text_hash", "TEXT NOT NULL DEFAULT ''")?;
    ensure_column(conn, "chunks", "text_tokens", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(conn, "chunks", "tags_text", "TEXT NOT NULL DEFAULT ''")?;
    ensure_column(conn, "chunks", "chunk_type", "TEXT NOT NULL DEFAULT 'line'")?;
    ensure_column(conn, "chunks", "symbol_name", "TEXT")?;
    ensure_column(conn, "chunks", "symbol_kind", "TEXT")?;
    ensure_column(conn, "chunks", "deleted_at", "TEXT")?;
    Ok(())
}

fn migrate_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_memories_scope ON memories(repo_id, workspace);
         CREATE INDEX IF NOT EXISTS idx_memories_thread ON memories(thread_id);
         CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
         CREATE INDEX IF NOT EXISTS idx_chunks_scope ON chunks(repo_id, workspace);
         CREATE INDEX IF NOT EXISTS idx_chunks_artifact ON chunks(artifact_id);
         CREATE INDEX IF NOT EXISTS idx_artifacts_source ON artifacts(repo_id, workspace, source);
         CREATE INDEX IF NOT EXISTS idx_links_to ON links(to_id);
         CREATE INDEX IF NOT EXISTS idx_state_history_scope
             ON state_history(repo_id, workspace, created_at);",
    )?;
    Ok(())
}

fn migrate_threads_pk(conn: &Connection) -> Result<()> {
    if column_exists(conn, "threads", "workspace")? {
        return Ok(());
    }
    conn.execute_batch(
        "CREATE TABLE threads_new (
             thread_id TEXT NOT NULL,
             repo_id TEXT NOT NULL,
             workspace TEXT NOT NULL DEFAULT 'default',
             title TEXT NOT NULL DEFAULT '',
             tags_json TEXT NOT NULL DEFAULT '[]',
             created_at TEXT NOT NULL,
             PRIMARY KEY (thread_id, repo_id, workspace)
         );
         INSERT OR IGNORE INTO threads_new (thread_id, repo_id, workspace, title, tags_json, created_at)
         SELECT thread_id, repo_id, 'default', title, tags_json, created_at FROM threads;
         DROP TABLE threads;
         ALTER TABLE threads_new RENAME TO threads;",
    )?;
    Ok(())
}

fn migrate_workspace_backfill(conn: &Connection) -> Result<()> {
    for table in ["threads", "memories", "artifacts", "chunks", "state_current", "state_history"] {
        conn.execute(
            &format!("UPDATE {table} SET workspace = 'default' WHERE workspace IS NULL OR workspace = ''"),
            [],
        )?;
    }
    Ok(())
}

fn migrate_text_hash_backfill(conn: &Connection) -> Result<()> {
    let rows: Vec<(String, String)> = {
        let mut stmt =
            conn.prepare("SELECT chunk_id, text FROM chunks WHERE text_hash = '' OR text_hash IS NULL")?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };
    for (chunk_id, text) in rows {
        conn.execute(
            "UPDATE chunks SET text_hash = ?1 WHERE chunk_id = ?2",
            rusqlite::params![sha256_hex(&text), chunk_id],
        )?;
    }
    Ok(())
}

fn migrate_chunk_dedup(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DELETE FROM chunks WHERE rowid NOT IN (
             SELECT MIN(rowid) FROM chunks
             GROUP BY repo_id, workspace, locator, text_hash, COALESCE(thread_id, '')
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_unique
             ON chunks(repo_id, workspace, locator, text_hash, COALESCE(thread_id, ''));",
    )?;
    Ok(())
}

fn migrate_chunk_type_and_links(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE chunks SET chunk_type = 'line' WHERE chunk_type IS NULL OR chunk_type = ''",
        [],
    )?;
    // Legacy link tables lacked the compound primary key; duplicate rows
    // must go before the unique index can exist.
    conn.execute_batch(
        "DELETE FROM links WHERE rowid NOT IN (
             SELECT MIN(rowid) FROM links GROUP BY from_id, rel, to_id
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_links_unique ON links(from_id, rel, to_id);",
    )?;
    Ok(())
}

fn migrate_fts_rebuild(conn: &Connection) -> Result<()> {
    rebuild_fts(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn).unwrap();
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare(
            "SELECT name FROM sqlite_master WHERE type IN ('table','view')
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<std::result::Result<Vec<_>, _>>()
        .unwrap()
    }

    #[test]
    fn bootstrap_creates_all_tables() {
        let conn = fresh_conn();
        let tables = table_names(&conn);
        for expected in [
            "repos",
            "threads",
            "memories",
            "artifacts",
            "chunks",
            "links",
            "state_current",
            "state_history",
            "embeddings",
            "embedding_queue",
            "meta",
            "memories_fts",
            "chunks_fts",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn bootstrap_sets_schema_version_and_audit_key() {
        let conn = fresh_conn();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        let at: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'last_migration_at'", [], |r| r.get(0))
            .unwrap();
        assert!(at.ends_with('Z'));
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let conn = fresh_conn();
        bootstrap(&conn).unwrap();
        bootstrap(&conn).unwrap();
        assert_eq!(
            conn.query_row::<i64, _, _>("PRAGMA user_version", [], |r| r.get(0)).unwrap(),
            SCHEMA_VERSION
        );
    }

    #[test]
    fn legacy_threads_table_is_rebuilt_with_workspace() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE threads (
                 thread_id TEXT NOT NULL,
                 repo_id TEXT NOT NULL,
                 title TEXT NOT NULL DEFAULT '',
                 tags_json TEXT NOT NULL DEFAULT '[]',
                 created_at TEXT NOT NULL,
                 PRIMARY KEY (thread_id, repo_id)
             );
             INSERT INTO threads VALUES ('T-1', 'r_1', 'old', '[]', '2024-01-01T00:00:00Z');",
        )
        .unwrap();

        bootstrap(&conn).unwrap();

        let (ws, title): (String, String) = conn
            .query_row(
                "SELECT workspace, title FROM threads WHERE thread_id = 'T-1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(ws, "default");
        assert_eq!(title, "old");
    }

    #[test]
    fn legacy_chunks_get_text_hash_and_dedup() {
        let conn = Connection::open_in_memory().unwrap();
        // A pre-hash chunks table with a duplicate pair.
        conn.execute_batch(
            "CREATE TABLE chunks (
                 chunk_id TEXT PRIMARY KEY,
                 repo_id TEXT NOT NULL,
                 workspace TEXT NOT NULL DEFAULT 'default',
                 artifact_id TEXT,
                 thread_id TEXT,
                 locator TEXT NOT NULL DEFAULT '',
                 text TEXT NOT NULL DEFAULT '',
                 tags_json TEXT NOT NULL DEFAULT '[]',
                 created_at TEXT NOT NULL
             );
             INSERT INTO chunks (chunk_id, repo_id, locator, text, created_at)
             VALUES ('C-1', 'r_1', 'a.rs:1', 'same text', '2024-01-01T00:00:00Z'),
                    ('C-2', 'r_1', 'a.rs:1', 'same text', '2024-01-02T00:00:00Z'),
                    ('C-3', 'r_1', 'a.rs:9', 'other', '2024-01-03T00:00:00Z');",
        )
        .unwrap();

        bootstrap(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);

        let hash: String = conn
            .query_row("SELECT text_hash FROM chunks WHERE chunk_id = 'C-1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(hash, sha256_hex("same text"));

        let chunk_type: String = conn
            .query_row("SELECT chunk_type FROM chunks WHERE chunk_id = 'C-1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(chunk_type, "line");
    }

    #[test]
    fn fts_rebuild_reflects_live_rows_only() {
        let conn = fresh_conn();
        conn.execute(
            "INSERT INTO memories (id, repo_id, workspace, title, summary, created_at)
             VALUES ('M-live', 'r_1', 'default', 'alpha', 'live row', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO memories (id, repo_id, workspace, title, summary, deleted_at, created_at)
             VALUES ('M-dead', 'r_1', 'default', 'alpha', 'dead row', '2024-02-01T00:00:00Z',
                     '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        rebuild_fts(&conn).unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'alpha'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }
}
