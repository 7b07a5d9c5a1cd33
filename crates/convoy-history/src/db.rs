use rusqlite::{Connection, Result};

/// Initialise the history snapshot table. Safe to call on every startup (idempotent).
///
/// One row per conversation: the full ordered message list as JSON. Snapshots
/// are replaced wholesale, so compaction and clears need no row bookkeeping.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversation_history (
            project_id      TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            messages        TEXT NOT NULL,
            message_count   INTEGER NOT NULL DEFAULT 0,
            updated_at      TEXT NOT NULL,
            PRIMARY KEY (project_id, conversation_id)
        );
        CREATE INDEX IF NOT EXISTS idx_history_project
            ON conversation_history(project_id, updated_at DESC);",
    )
}
