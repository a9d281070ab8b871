use rusqlite::Connection;

use crate::error::StorageError;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -8000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Empty every table and restart local keys. Used when a new incident begins.
pub fn truncate_all(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(TRUNCATE_SQL)?;
    Ok(())
}

// `n` uses AUTOINCREMENT so a deleted row's key is never handed to a later
// row while a finalization for it may still be in flight.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS teams (
    n INTEGER PRIMARY KEY AUTOINCREMENT,
    tid INTEGER NOT NULL DEFAULT -1,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    resource TEXT NOT NULL,
    medical INTEGER NOT NULL DEFAULT 0,
    last_edit_epoch INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_teams_tid ON teams (tid);
CREATE INDEX IF NOT EXISTS idx_teams_edit ON teams (last_edit_epoch);

CREATE TABLE IF NOT EXISTS assignments (
    n INTEGER PRIMARY KEY AUTOINCREMENT,
    aid INTEGER NOT NULL DEFAULT -1,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    intended_resource TEXT NOT NULL,
    external_ref TEXT,
    last_edit_epoch INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assignments_aid ON assignments (aid);
CREATE INDEX IF NOT EXISTS idx_assignments_edit ON assignments (last_edit_epoch);

CREATE TABLE IF NOT EXISTS pairings (
    n INTEGER PRIMARY KEY AUTOINCREMENT,
    pid INTEGER NOT NULL DEFAULT -1,
    aid INTEGER NOT NULL,
    tid INTEGER NOT NULL,
    status TEXT NOT NULL,
    name_save TEXT,
    resource_save TEXT,
    last_edit_epoch INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pairings_pid ON pairings (pid);
CREATE INDEX IF NOT EXISTS idx_pairings_pair ON pairings (aid, tid, status);
CREATE INDEX IF NOT EXISTS idx_pairings_edit ON pairings (last_edit_epoch);

CREATE TABLE IF NOT EXISTS history (
    n INTEGER PRIMARY KEY AUTOINCREMENT,
    hid INTEGER NOT NULL DEFAULT -1,
    aid INTEGER,
    tid INTEGER,
    description TEXT NOT NULL,
    recorded_by TEXT NOT NULL,
    epoch INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_hid ON history (hid);
CREATE INDEX IF NOT EXISTS idx_history_aid ON history (aid);
CREATE INDEX IF NOT EXISTS idx_history_tid ON history (tid);
CREATE INDEX IF NOT EXISTS idx_history_epoch ON history (epoch);

CREATE TABLE IF NOT EXISTS removals (
    kind TEXT NOT NULL,
    id INTEGER NOT NULL,
    epoch INTEGER NOT NULL,
    PRIMARY KEY (kind, id)
);
CREATE INDEX IF NOT EXISTS idx_removals_epoch ON removals (epoch);

CREATE TABLE IF NOT EXISTS incident (
    slot INTEGER PRIMARY KEY CHECK (slot = 0),
    id BLOB NOT NULL
);
";

const TRUNCATE_SQL: &str = "
DELETE FROM teams;
DELETE FROM assignments;
DELETE FROM pairings;
DELETE FROM history;
DELETE FROM removals;
DELETE FROM incident;
DELETE FROM sqlite_sequence;
";
