//! Partition schema and migrations
//!
//! Every partition (shared and per-tenant) carries the same schema, versioned
//! through `PRAGMA user_version`. Migrations are additive, idempotent, and
//! never drop rows.

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize or migrate a partition's schema
///
/// # Errors
///
/// Returns error if a migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Long-term memories, one logical table per kind via the kind column
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            owner_id TEXT,
            room_id TEXT,
            agent_id TEXT,
            is_unique INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_memories_kind ON memories(kind);
        CREATE INDEX IF NOT EXISTS idx_memories_room ON memories(room_id);
        CREATE INDEX IF NOT EXISTS idx_memories_owner ON memories(owner_id);

        -- Knowledge items: main documents and their chunks
        CREATE TABLE IF NOT EXISTS knowledge (
            id TEXT PRIMARY KEY,
            owner_id TEXT,
            content TEXT NOT NULL,
            embedding BLOB,
            is_main INTEGER NOT NULL DEFAULT 0,
            is_chunk INTEGER NOT NULL DEFAULT 0,
            is_shared INTEGER NOT NULL DEFAULT 0,
            original_id TEXT,
            chunk_index INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_knowledge_owner ON knowledge(owner_id);
        CREATE INDEX IF NOT EXISTS idx_knowledge_original ON knowledge(original_id);
        CREATE INDEX IF NOT EXISTS idx_knowledge_shared ON knowledge(is_shared);

        -- Write-through result cache keyed by (key, owner)
        CREATE TABLE IF NOT EXISTS cache (
            key TEXT NOT NULL,
            owner_id TEXT NOT NULL DEFAULT '',
            value TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (key, owner_id)
        );

        -- Goals (v1 predates agent scoping; agent_id arrives in v2)
        CREATE TABLE IF NOT EXISTS goals (
            id TEXT PRIMARY KEY,
            owner_id TEXT,
            room_id TEXT,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'in_progress',
            objectives TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_goals_room ON goals(room_id);

        -- Rooms and membership
        CREATE TABLE IF NOT EXISTS rooms (
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS participants (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            room_id TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(user_id, room_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_room ON participants(room_id);

        -- Bidirectional relationships between users
        CREATE TABLE IF NOT EXISTS relationships (
            id TEXT PRIMARY KEY,
            user_a TEXT NOT NULL,
            user_b TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'friends',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_relationships_a ON relationships(user_a);
        CREATE INDEX IF NOT EXISTS idx_relationships_b ON relationships(user_b);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated partition to schema v1");
    Ok(())
}

/// v2: agent scoping for goals.
///
/// Older partitions lack `goals.agent_id`. The column is added, backfilled
/// with the documented default (empty string), and the table is rebuilt so
/// the NOT NULL constraint holds for future writes. Row-preserving and safe
/// to re-run: the column check makes a second pass a no-op.
fn migrate_v2(conn: &Connection) -> Result<()> {
    if !has_column(conn, "goals", "agent_id")? {
        conn.execute_batch(
            r"
            ALTER TABLE goals ADD COLUMN agent_id TEXT;
            UPDATE goals SET agent_id = '' WHERE agent_id IS NULL;
            ",
        )?;
    }

    // Rebuild to tighten the schema: NOT NULL requires a new table
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS goals_new (
            id TEXT PRIMARY KEY,
            owner_id TEXT,
            room_id TEXT,
            agent_id TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'in_progress',
            objectives TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        INSERT OR IGNORE INTO goals_new
            SELECT id, owner_id, room_id, COALESCE(agent_id, ''),
                   name, status, objectives, created_at
            FROM goals;

        DROP TABLE goals;
        ALTER TABLE goals_new RENAME TO goals;

        CREATE INDEX IF NOT EXISTS idx_goals_room ON goals(room_id);
        CREATE INDEX IF NOT EXISTS idx_goals_agent ON goals(agent_id);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated partition to schema v2 (goal agent scoping)");
    Ok(())
}

/// Whether a table already carries a column (guards additive migrations)
fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;

    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_test_conn() -> Connection {
        crate::db::register_sqlite_vec();
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_schema_init() {
        let conn = setup_test_conn();
        init(&conn).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='knowledge'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_schema_idempotent() {
        let conn = setup_test_conn();
        init(&conn).unwrap();
        init(&conn).unwrap(); // Should not fail
    }

    #[test]
    fn test_v2_backfills_existing_rows() {
        let conn = setup_test_conn();

        // Build a v1 partition with a pre-existing goal, then migrate
        migrate_v1(&conn).unwrap();
        conn.execute(
            "INSERT INTO goals (id, owner_id, room_id, name) VALUES ('g1', 'u1', 'r1', 'ship it')",
            [],
        )
        .unwrap();

        init(&conn).unwrap();

        let (agent_id, count): (String, i32) = conn
            .query_row(
                "SELECT agent_id, (SELECT COUNT(*) FROM goals) FROM goals WHERE id = 'g1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(agent_id, "");
        assert_eq!(count, 1);

        // Second run is a no-op and keeps the row
        init(&conn).unwrap();
        let count: i32 = conn
            .query_row("SELECT COUNT(*) FROM goals", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_sqlite_vec_loaded() {
        let conn = setup_test_conn();
        init(&conn).unwrap();

        let version: String = conn
            .query_row("SELECT vec_version()", [], |row| row.get(0))
            .unwrap();
        assert!(version.starts_with('v'));
    }
}
