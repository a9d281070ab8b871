use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Params, Row, types::Type};
use tracing::{debug, error};

use tracker_core::{
    AssignmentRow, AssignmentStatus, CoreError, EntityKind, Epoch, GlobalId, HistoryRow,
    IncidentId, PairingRow, PairingStatus, Removal, RowKey, TeamRow, TeamStatus,
};

use crate::error::StorageError;
use crate::traits::{HistoryFilter, Match, Outcome, Store};

macro_rules! team_cols {
    () => {
        "n, tid, name, status, resource, medical, last_edit_epoch"
    };
}

macro_rules! assignment_cols {
    () => {
        "n, aid, name, status, intended_resource, external_ref, last_edit_epoch"
    };
}

macro_rules! pairing_cols {
    () => {
        "n, pid, aid, tid, status, name_save, resource_save, last_edit_epoch"
    };
}

macro_rules! history_cols {
    () => {
        "n, hid, aid, tid, description, recorded_by, epoch"
    };
}

/// Map a domain parse failure into rusqlite's error space so it can travel
/// out of a row-mapping closure.
fn parse_col<T>(idx: usize, parsed: Result<T, CoreError>) -> rusqlite::Result<T> {
    parsed.map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn read_team(row: &Row) -> rusqlite::Result<TeamRow> {
    let status: String = row.get(3)?;
    Ok(TeamRow {
        n: RowKey::new(row.get(0)?),
        tid: GlobalId::new(row.get(1)?),
        name: row.get(2)?,
        status: parse_col(3, TeamStatus::parse(&status))?,
        resource: row.get(4)?,
        medical: row.get(5)?,
        last_edit_epoch: Epoch::from_millis(row.get(6)?),
    })
}

fn read_assignment(row: &Row) -> rusqlite::Result<AssignmentRow> {
    let status: String = row.get(3)?;
    Ok(AssignmentRow {
        n: RowKey::new(row.get(0)?),
        aid: GlobalId::new(row.get(1)?),
        name: row.get(2)?,
        status: parse_col(3, AssignmentStatus::parse(&status))?,
        intended_resource: row.get(4)?,
        external_ref: row.get(5)?,
        last_edit_epoch: Epoch::from_millis(row.get(6)?),
    })
}

fn read_pairing(row: &Row) -> rusqlite::Result<PairingRow> {
    let status: String = row.get(4)?;
    Ok(PairingRow {
        n: RowKey::new(row.get(0)?),
        pid: GlobalId::new(row.get(1)?),
        aid: GlobalId::new(row.get(2)?),
        tid: GlobalId::new(row.get(3)?),
        status: parse_col(4, PairingStatus::parse(&status))?,
        name_save: row.get(5)?,
        resource_save: row.get(6)?,
        last_edit_epoch: Epoch::from_millis(row.get(7)?),
    })
}

fn read_history(row: &Row) -> rusqlite::Result<HistoryRow> {
    let aid: Option<i64> = row.get(2)?;
    let tid: Option<i64> = row.get(3)?;
    Ok(HistoryRow {
        n: RowKey::new(row.get(0)?),
        hid: GlobalId::new(row.get(1)?),
        aid: aid.map(GlobalId::new),
        tid: tid.map(GlobalId::new),
        description: row.get(4)?,
        recorded_by: row.get(5)?,
        epoch: Epoch::from_millis(row.get(6)?),
    })
}

fn read_removal(row: &Row) -> rusqlite::Result<Removal> {
    let kind: String = row.get(0)?;
    Ok(Removal {
        kind: parse_col(0, EntityKind::parse(&kind))?,
        id: GlobalId::new(row.get(1)?),
        epoch: Epoch::from_millis(row.get(2)?),
    })
}

fn read_incident(row: &Row) -> rusqlite::Result<IncidentId> {
    let bytes: Vec<u8> = row.get(0)?;
    let bytes: [u8; 16] = bytes.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Blob,
            Box::new(CoreError::InvalidData("incident id length".into())),
        )
    })?;
    Ok(IncidentId::from_bytes(bytes))
}

fn query_rows<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    read: fn(&Row) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, read)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_opt<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    read: fn(&Row) -> rusqlite::Result<T>,
) -> rusqlite::Result<Option<T>> {
    let mut stmt = conn.prepare_cached(sql)?;
    stmt.query_row(params, read).optional()
}

fn insert_row<P: Params>(conn: &Connection, sql: &str, params: P) -> rusqlite::Result<RowKey> {
    conn.prepare_cached(sql)?.execute(params)?;
    Ok(RowKey::new(conn.last_insert_rowid()))
}

fn execute<P: Params>(conn: &Connection, sql: &str, params: P) -> rusqlite::Result<usize> {
    conn.prepare_cached(sql)?.execute(params)
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Run `f` inside one transaction, committing only if it succeeds.
    /// Nested calls join the enclosing transaction.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        if !self.conn.is_autocommit() {
            return f(self);
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(StorageError::from)?;
        let value = f(self)?;
        tx.commit().map_err(StorageError::from)?;
        Ok(value)
    }

    fn run<T>(
        &self,
        what: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Outcome<T> {
        match f(&self.conn) {
            Ok(value) => Outcome::Done(value),
            Err(e) => {
                error!(op = what, error = %e, "store statement failed");
                Outcome::Faulted
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

impl Store for SqliteStore {
    fn reset_incident(&self) -> Outcome<()> {
        debug!("truncating all tables for new incident");
        self.run("reset_incident", |conn| {
            crate::schema::truncate_all(conn).map_err(|e| match e {
                StorageError::Sqlite(sq) => sq,
                other => rusqlite::Error::ToSqlConversionFailure(Box::new(other)),
            })
        })
    }

    fn incident(&self) -> Outcome<Option<IncidentId>> {
        self.run("incident", |conn| {
            query_opt(conn, "SELECT id FROM incident WHERE slot = 0", [], read_incident)
        })
    }

    fn set_incident(&self, incident: IncidentId) -> Outcome<()> {
        self.run("set_incident", |conn| {
            execute(
                conn,
                "INSERT INTO incident (slot, id) VALUES (0, ?1)
                 ON CONFLICT(slot) DO UPDATE SET id = excluded.id",
                [incident.as_bytes().to_vec()],
            )
            .map(|_| ())
        })
    }

    fn max_global_id(&self, kind: EntityKind) -> Outcome<GlobalId> {
        let sql = match kind {
            EntityKind::Team => {
                "SELECT MAX(COALESCE((SELECT MAX(tid) FROM teams), 0),
                            COALESCE((SELECT MAX(id) FROM removals WHERE kind = 'team'), 0))"
            }
            EntityKind::Assignment => {
                "SELECT MAX(COALESCE((SELECT MAX(aid) FROM assignments), 0),
                            COALESCE((SELECT MAX(id) FROM removals WHERE kind = 'assignment'), 0))"
            }
            EntityKind::Pairing => "SELECT COALESCE(MAX(pid), 0) FROM pairings",
            EntityKind::History => "SELECT COALESCE(MAX(hid), 0) FROM history",
        };
        self.run("max_global_id", |conn| {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(GlobalId::new)
        })
    }

    fn discard_tentative(&self, kind: EntityKind, n: RowKey) -> Outcome<usize> {
        let sql = match kind {
            EntityKind::Team => "DELETE FROM teams WHERE n = ?1 AND tid = -1",
            EntityKind::Assignment => "DELETE FROM assignments WHERE n = ?1 AND aid = -1",
            EntityKind::Pairing => "DELETE FROM pairings WHERE n = ?1 AND pid = -1",
            EntityKind::History => "DELETE FROM history WHERE n = ?1 AND hid = -1",
        };
        self.run("discard_tentative", |conn| execute(conn, sql, [n.get()]))
    }

    fn discard_all_tentative(&self) -> Outcome<usize> {
        self.run("discard_all_tentative", |conn| {
            let mut dropped = execute(conn, "DELETE FROM teams WHERE tid = -1", [])?;
            dropped += execute(conn, "DELETE FROM assignments WHERE aid = -1", [])?;
            dropped += execute(conn, "DELETE FROM pairings WHERE pid = -1", [])?;
            Ok(dropped)
        })
    }

    // ========================================================================
    // Teams
    // ========================================================================

    fn insert_team(&self, row: &TeamRow) -> Outcome<RowKey> {
        self.run("insert_team", |conn| {
            insert_row(
                conn,
                "INSERT INTO teams (tid, name, status, resource, medical, last_edit_epoch) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    row.tid.get(),
                    row.name,
                    row.status.as_str(),
                    row.resource,
                    row.medical,
                    row.last_edit_epoch.millis(),
                ],
            )
        })
    }

    fn get_team(&self, n: RowKey) -> Outcome<Option<TeamRow>> {
        self.run("get_team", |conn| {
            query_opt(
                conn,
                concat!("SELECT ", team_cols!(), " FROM teams WHERE n = ?1"),
                [n.get()],
                read_team,
            )
        })
    }

    fn find_team(&self, tid: GlobalId) -> Outcome<Option<TeamRow>> {
        self.run("find_team", |conn| {
            query_opt(
                conn,
                concat!("SELECT ", team_cols!(), " FROM teams WHERE tid = ?1 ORDER BY n LIMIT 1"),
                [tid.get()],
                read_team,
            )
        })
    }

    fn list_teams(&self) -> Outcome<Vec<TeamRow>> {
        self.run("list_teams", |conn| {
            query_rows(conn, concat!("SELECT ", team_cols!(), " FROM teams ORDER BY n"), [], read_team)
        })
    }

    fn teams_since(&self, since: Epoch) -> Outcome<Vec<TeamRow>> {
        self.run("teams_since", |conn| {
            query_rows(
                conn,
                concat!("SELECT ", team_cols!(), " FROM teams WHERE last_edit_epoch > ?1 ORDER BY last_edit_epoch, n"),
                [since.millis()],
                read_team,
            )
        })
    }

    fn update_team_status(&self, tid: GlobalId, status: TeamStatus, at: Epoch) -> Outcome<usize> {
        self.run("update_team_status", |conn| {
            execute(
                conn,
                "UPDATE teams SET status = ?1, last_edit_epoch = ?2 WHERE tid = ?3",
                rusqlite::params![status.as_str(), at.millis(), tid.get()],
            )
        })
    }

    fn update_team_resource(&self, tid: GlobalId, resource: &str, at: Epoch) -> Outcome<usize> {
        self.run("update_team_resource", |conn| {
            execute(
                conn,
                "UPDATE teams SET resource = ?1, last_edit_epoch = ?2 WHERE tid = ?3",
                rusqlite::params![resource, at.millis(), tid.get()],
            )
        })
    }

    fn update_team_medical(&self, tid: GlobalId, medical: bool, at: Epoch) -> Outcome<usize> {
        self.run("update_team_medical", |conn| {
            execute(
                conn,
                "UPDATE teams SET medical = ?1, last_edit_epoch = ?2 WHERE tid = ?3",
                rusqlite::params![medical, at.millis(), tid.get()],
            )
        })
    }

    fn finalize_team(&self, n: RowKey, tid: GlobalId, at: Epoch) -> Outcome<usize> {
        self.run("finalize_team", |conn| {
            execute(
                conn,
                "UPDATE teams SET tid = ?1, last_edit_epoch = ?2 WHERE n = ?3",
                rusqlite::params![tid.get(), at.millis(), n.get()],
            )
        })
    }

    fn replace_team(&self, row: &TeamRow) -> Outcome<usize> {
        self.run("replace_team", |conn| {
            execute(
                conn,
                "UPDATE teams SET name = ?1, status = ?2, resource = ?3, medical = ?4, last_edit_epoch = ?5 WHERE tid = ?6",
                rusqlite::params![
                    row.name,
                    row.status.as_str(),
                    row.resource,
                    row.medical,
                    row.last_edit_epoch.millis(),
                    row.tid.get(),
                ],
            )
        })
    }

    fn delete_team(&self, tid: GlobalId) -> Outcome<usize> {
        self.run("delete_team", |conn| {
            execute(conn, "DELETE FROM teams WHERE tid = ?1", [tid.get()])
        })
    }

    // ========================================================================
    // Assignments
    // ========================================================================

    fn insert_assignment(&self, row: &AssignmentRow) -> Outcome<RowKey> {
        self.run("insert_assignment", |conn| {
            insert_row(
                conn,
                "INSERT INTO assignments (aid, name, status, intended_resource, external_ref, last_edit_epoch) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    row.aid.get(),
                    row.name,
                    row.status.as_str(),
                    row.intended_resource,
                    row.external_ref,
                    row.last_edit_epoch.millis(),
                ],
            )
        })
    }

    fn get_assignment(&self, n: RowKey) -> Outcome<Option<AssignmentRow>> {
        self.run("get_assignment", |conn| {
            query_opt(
                conn,
                concat!("SELECT ", assignment_cols!(), " FROM assignments WHERE n = ?1"),
                [n.get()],
                read_assignment,
            )
        })
    }

    fn find_assignment(&self, aid: GlobalId) -> Outcome<Option<AssignmentRow>> {
        self.run("find_assignment", |conn| {
            query_opt(
                conn,
                concat!("SELECT ", assignment_cols!(), " FROM assignments WHERE aid = ?1 ORDER BY n LIMIT 1"),
                [aid.get()],
                read_assignment,
            )
        })
    }

    fn list_assignments(&self) -> Outcome<Vec<AssignmentRow>> {
        self.run("list_assignments", |conn| {
            query_rows(
                conn,
                concat!("SELECT ", assignment_cols!(), " FROM assignments ORDER BY n"),
                [],
                read_assignment,
            )
        })
    }

    fn assignments_since(&self, since: Epoch) -> Outcome<Vec<AssignmentRow>> {
        self.run("assignments_since", |conn| {
            query_rows(
                conn,
                concat!("SELECT ", assignment_cols!(), " FROM assignments WHERE last_edit_epoch > ?1 ORDER BY last_edit_epoch, n"),
                [since.millis()],
                read_assignment,
            )
        })
    }

    fn update_assignment_status(
        &self,
        aid: GlobalId,
        status: AssignmentStatus,
        at: Epoch,
    ) -> Outcome<usize> {
        self.run("update_assignment_status", |conn| {
            execute(
                conn,
                "UPDATE assignments SET status = ?1, last_edit_epoch = ?2 WHERE aid = ?3",
                rusqlite::params![status.as_str(), at.millis(), aid.get()],
            )
        })
    }

    fn update_intended_resource(&self, aid: GlobalId, resource: &str, at: Epoch) -> Outcome<usize> {
        self.run("update_intended_resource", |conn| {
            execute(
                conn,
                "UPDATE assignments SET intended_resource = ?1, last_edit_epoch = ?2 WHERE aid = ?3",
                rusqlite::params![resource, at.millis(), aid.get()],
            )
        })
    }

    fn update_external_ref(
        &self,
        aid: GlobalId,
        external_ref: Option<&str>,
        at: Epoch,
    ) -> Outcome<usize> {
        self.run("update_external_ref", |conn| {
            execute(
                conn,
                "UPDATE assignments SET external_ref = ?1, last_edit_epoch = ?2 WHERE aid = ?3",
                rusqlite::params![external_ref, at.millis(), aid.get()],
            )
        })
    }

    fn finalize_assignment(&self, n: RowKey, aid: GlobalId, at: Epoch) -> Outcome<usize> {
        self.run("finalize_assignment", |conn| {
            execute(
                conn,
                "UPDATE assignments SET aid = ?1, last_edit_epoch = ?2 WHERE n = ?3",
                rusqlite::params![aid.get(), at.millis(), n.get()],
            )
        })
    }

    fn replace_assignment(&self, row: &AssignmentRow) -> Outcome<usize> {
        self.run("replace_assignment", |conn| {
            execute(
                conn,
                "UPDATE assignments SET name = ?1, status = ?2, intended_resource = ?3, external_ref = ?4, last_edit_epoch = ?5 WHERE aid = ?6",
                rusqlite::params![
                    row.name,
                    row.status.as_str(),
                    row.intended_resource,
                    row.external_ref,
                    row.last_edit_epoch.millis(),
                    row.aid.get(),
                ],
            )
        })
    }

    fn delete_assignment(&self, aid: GlobalId) -> Outcome<usize> {
        self.run("delete_assignment", |conn| {
            execute(conn, "DELETE FROM assignments WHERE aid = ?1", [aid.get()])
        })
    }

    // ========================================================================
    // Pairings
    // ========================================================================

    fn insert_pairing(&self, row: &PairingRow) -> Outcome<RowKey> {
        self.run("insert_pairing", |conn| {
            insert_row(
                conn,
                "INSERT INTO pairings (pid, aid, tid, status, name_save, resource_save, last_edit_epoch) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    row.pid.get(),
                    row.aid.get(),
                    row.tid.get(),
                    row.status.as_str(),
                    row.name_save,
                    row.resource_save,
                    row.last_edit_epoch.millis(),
                ],
            )
        })
    }

    fn get_pairing(&self, n: RowKey) -> Outcome<Option<PairingRow>> {
        self.run("get_pairing", |conn| {
            query_opt(
                conn,
                concat!("SELECT ", pairing_cols!(), " FROM pairings WHERE n = ?1"),
                [n.get()],
                read_pairing,
            )
        })
    }

    fn find_pairing(&self, pid: GlobalId) -> Outcome<Option<PairingRow>> {
        self.run("find_pairing", |conn| {
            query_opt(
                conn,
                concat!("SELECT ", pairing_cols!(), " FROM pairings WHERE pid = ?1 ORDER BY n LIMIT 1"),
                [pid.get()],
                read_pairing,
            )
        })
    }

    fn find_current_pairing(&self, aid: GlobalId, tid: GlobalId) -> Outcome<Option<PairingRow>> {
        self.run("find_current_pairing", |conn| {
            query_opt(
                conn,
                concat!("SELECT ", pairing_cols!(), " FROM pairings WHERE aid = ?1 AND tid = ?2 AND status = 'CURRENT' ORDER BY n LIMIT 1"),
                [aid.get(), tid.get()],
                read_pairing,
            )
        })
    }

    fn list_pairings(&self) -> Outcome<Vec<PairingRow>> {
        self.run("list_pairings", |conn| {
            query_rows(
                conn,
                concat!("SELECT ", pairing_cols!(), " FROM pairings ORDER BY n"),
                [],
                read_pairing,
            )
        })
    }

    fn pairings_since(&self, since: Epoch) -> Outcome<Vec<PairingRow>> {
        self.run("pairings_since", |conn| {
            query_rows(
                conn,
                concat!("SELECT ", pairing_cols!(), " FROM pairings WHERE last_edit_epoch > ?1 ORDER BY last_edit_epoch, n"),
                [since.millis()],
                read_pairing,
            )
        })
    }

    fn current_pairings_for_team(&self, tid: GlobalId) -> Outcome<Vec<PairingRow>> {
        self.run("current_pairings_for_team", |conn| {
            query_rows(
                conn,
                concat!("SELECT ", pairing_cols!(), " FROM pairings WHERE tid = ?1 AND status = 'CURRENT' ORDER BY n"),
                [tid.get()],
                read_pairing,
            )
        })
    }

    fn current_pairings_for_assignment(&self, aid: GlobalId) -> Outcome<Vec<PairingRow>> {
        self.run("current_pairings_for_assignment", |conn| {
            query_rows(
                conn,
                concat!("SELECT ", pairing_cols!(), " FROM pairings WHERE aid = ?1 AND status = 'CURRENT' ORDER BY n"),
                [aid.get()],
                read_pairing,
            )
        })
    }

    fn close_pairing(
        &self,
        pid: GlobalId,
        name_save: Option<&str>,
        resource_save: Option<&str>,
        at: Epoch,
    ) -> Outcome<usize> {
        self.run("close_pairing", |conn| {
            execute(
                conn,
                "UPDATE pairings SET status = 'PREVIOUS', name_save = COALESCE(?1, name_save), resource_save = COALESCE(?2, resource_save), last_edit_epoch = ?3
                 WHERE pid = ?4 AND status = 'CURRENT'",
                rusqlite::params![name_save, resource_save, at.millis(), pid.get()],
            )
        })
    }

    fn finalize_pairing(&self, n: RowKey, pid: GlobalId, at: Epoch) -> Outcome<usize> {
        self.run("finalize_pairing", |conn| {
            execute(
                conn,
                "UPDATE pairings SET pid = ?1, last_edit_epoch = ?2 WHERE n = ?3",
                rusqlite::params![pid.get(), at.millis(), n.get()],
            )
        })
    }

    fn replace_pairing(&self, row: &PairingRow) -> Outcome<usize> {
        self.run("replace_pairing", |conn| {
            execute(
                conn,
                "UPDATE pairings SET aid = ?1, tid = ?2, status = ?3, name_save = ?4, resource_save = ?5, last_edit_epoch = ?6 WHERE pid = ?7",
                rusqlite::params![
                    row.aid.get(),
                    row.tid.get(),
                    row.status.as_str(),
                    row.name_save,
                    row.resource_save,
                    row.last_edit_epoch.millis(),
                    row.pid.get(),
                ],
            )
        })
    }

    // ========================================================================
    // History
    // ========================================================================

    fn insert_history(&self, row: &HistoryRow) -> Outcome<RowKey> {
        self.run("insert_history", |conn| {
            insert_row(
                conn,
                "INSERT INTO history (hid, aid, tid, description, recorded_by, epoch) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    row.hid.get(),
                    row.aid.map(|id| id.get()),
                    row.tid.map(|id| id.get()),
                    row.description,
                    row.recorded_by,
                    row.epoch.millis(),
                ],
            )
        })
    }

    fn count_history(&self, hid: GlobalId) -> Outcome<usize> {
        self.run("count_history", |conn| {
            conn.query_row("SELECT COUNT(*) FROM history WHERE hid = ?1", [hid.get()], |row| {
                row.get::<_, i64>(0)
            })
            .map(|count| count as usize)
        })
    }

    fn list_history(&self, filter: HistoryFilter) -> Outcome<Vec<HistoryRow>> {
        self.run("list_history", |conn| match filter {
            HistoryFilter::All => query_rows(
                conn,
                concat!("SELECT ", history_cols!(), " FROM history ORDER BY epoch, n"),
                [],
                read_history,
            ),
            HistoryFilter::Assignment(aid) => query_rows(
                conn,
                concat!("SELECT ", history_cols!(), " FROM history WHERE aid = ?1 ORDER BY epoch, n"),
                [aid.get()],
                read_history,
            ),
            HistoryFilter::Team(tid) => query_rows(
                conn,
                concat!("SELECT ", history_cols!(), " FROM history WHERE tid = ?1 ORDER BY epoch, n"),
                [tid.get()],
                read_history,
            ),
            HistoryFilter::Pair { aid, tid, mode: Match::All } => query_rows(
                conn,
                concat!("SELECT ", history_cols!(), " FROM history WHERE aid = ?1 AND tid = ?2 ORDER BY epoch, n"),
                [aid.get(), tid.get()],
                read_history,
            ),
            HistoryFilter::Pair { aid, tid, mode: Match::Any } => query_rows(
                conn,
                concat!("SELECT ", history_cols!(), " FROM history WHERE aid = ?1 OR tid = ?2 ORDER BY epoch, n"),
                [aid.get(), tid.get()],
                read_history,
            ),
            HistoryFilter::Since(since) => query_rows(
                conn,
                concat!("SELECT ", history_cols!(), " FROM history WHERE epoch > ?1 ORDER BY epoch, n"),
                [since.millis()],
                read_history,
            ),
        })
    }

    // ========================================================================
    // Removals
    // ========================================================================

    fn insert_removal(&self, removal: &Removal) -> Outcome<()> {
        self.run("insert_removal", |conn| {
            execute(
                conn,
                "INSERT INTO removals (kind, id, epoch) VALUES (?1, ?2, ?3)
                 ON CONFLICT(kind, id) DO UPDATE SET epoch = excluded.epoch",
                rusqlite::params![removal.kind.as_str(), removal.id.get(), removal.epoch.millis()],
            )
            .map(|_| ())
        })
    }

    fn removals_since(&self, since: Epoch) -> Outcome<Vec<Removal>> {
        self.run("removals_since", |conn| {
            query_rows(
                conn,
                "SELECT kind, id, epoch FROM removals WHERE epoch > ?1 ORDER BY epoch",
                [since.millis()],
                read_removal,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team(tid: i64, name: &str, at: i64) -> TeamRow {
        TeamRow {
            n: RowKey::new(0),
            tid: GlobalId::new(tid),
            name: name.into(),
            status: TeamStatus::Unassigned,
            resource: "GROUND".into(),
            medical: false,
            last_edit_epoch: Epoch::from_millis(at),
        }
    }

    #[test]
    fn insert_assigns_fresh_local_keys() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.insert_team(&team(-1, "101", 10)).into_result("insert").unwrap();
        let b = store.insert_team(&team(-1, "102", 11)).into_result("insert").unwrap();
        assert_ne!(a, b);

        let row = store.get_team(b).into_result("get").unwrap().unwrap();
        assert_eq!(row.n, b);
        assert_eq!(row.name, "102");
        assert!(row.is_tentative());
    }

    #[test]
    fn updates_report_affected_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_team(&team(4, "101", 10)).into_result("insert").unwrap();

        let hit = store.update_team_status(GlobalId::new(4), TeamStatus::Working, Epoch::from_millis(20));
        assert_eq!(hit, Outcome::Done(1));
        let miss = store.update_team_status(GlobalId::new(5), TeamStatus::Working, Epoch::from_millis(20));
        assert_eq!(miss, Outcome::Done(0));
    }

    #[test]
    fn deleted_keys_are_not_reused() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.insert_team(&team(1, "101", 10)).into_result("insert").unwrap();
        store.delete_team(GlobalId::new(1)).into_result("delete").unwrap();
        let second = store.insert_team(&team(2, "102", 11)).into_result("insert").unwrap();
        assert!(second > first);
    }

    #[test]
    fn discard_only_touches_tentative_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tentative = store.insert_team(&team(-1, "101", 10)).into_result("insert").unwrap();
        let confirmed = store.insert_team(&team(2, "102", 10)).into_result("insert").unwrap();

        assert_eq!(store.discard_tentative(EntityKind::Team, confirmed), Outcome::Done(0));
        assert_eq!(store.discard_tentative(EntityKind::Team, tentative), Outcome::Done(1));
        assert_eq!(store.list_teams().into_result("list").unwrap().len(), 1);
    }

    #[test]
    fn since_queries_are_strictly_after_watermark() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_team(&team(1, "101", 10)).into_result("insert").unwrap();
        store.insert_team(&team(2, "102", 20)).into_result("insert").unwrap();

        let rows = store.teams_since(Epoch::from_millis(10)).into_result("since").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tid, GlobalId::new(2));
        assert!(store.teams_since(Epoch::from_millis(20)).into_result("since").unwrap().is_empty());
    }

    #[test]
    fn fault_is_a_sentinel_not_an_empty_read() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.conn().execute_batch("DROP TABLE teams").unwrap();

        let listed = store.list_teams();
        assert!(listed.is_faulted());
        assert!(matches!(listed.into_result("list teams"), Err(StorageError::Faulted(_))));

        // A genuinely empty table is a successful read.
        assert_eq!(store.list_assignments(), Outcome::Done(vec![]));
    }

    #[test]
    fn corrupt_status_text_faults_instead_of_guessing() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO teams (tid, name, status, resource, medical, last_edit_epoch) VALUES (1, 'x', 'DONE', 'GROUND', 0, 1)",
                [],
            )
            .unwrap();
        assert!(store.list_teams().is_faulted());
    }

    #[test]
    fn values_are_bound_not_interpolated() {
        let store = SqliteStore::open_in_memory().unwrap();
        let hostile = "x'); DROP TABLE teams; --";
        store.insert_team(&team(1, hostile, 10)).into_result("insert").unwrap();

        let rows = store.list_teams().into_result("list").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, hostile);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result: Result<(), StorageError> = store.transaction(|s| {
            s.insert_team(&team(1, "101", 10)).into_result("insert")?;
            Err(StorageError::NotFound("forced".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.list_teams(), Outcome::Done(vec![]));
    }

    #[test]
    fn max_global_id_remembers_removed_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_team(&team(3, "101", 10)).into_result("insert").unwrap();
        store.delete_team(GlobalId::new(3)).into_result("delete").unwrap();
        store
            .insert_removal(&Removal {
                kind: EntityKind::Team,
                id: GlobalId::new(3),
                epoch: Epoch::from_millis(11),
            })
            .into_result("removal")
            .unwrap();

        assert_eq!(store.max_global_id(EntityKind::Team), Outcome::Done(GlobalId::new(3)));
        assert_eq!(store.max_global_id(EntityKind::Pairing), Outcome::Done(GlobalId::new(0)));
    }

    #[test]
    fn reset_incident_truncates_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("tracker.db")).unwrap();
        store.insert_team(&team(1, "101", 10)).into_result("insert").unwrap();
        store.set_incident(IncidentId::new()).into_result("incident").unwrap();
        store.reset_incident().into_result("reset").unwrap();

        assert_eq!(store.list_teams(), Outcome::Done(vec![]));
        assert_eq!(store.incident(), Outcome::Done(None));
        let n = store.insert_team(&team(1, "101", 10)).into_result("insert").unwrap();
        assert_eq!(n, RowKey::new(1));
    }

    #[test]
    fn incident_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.db");
        let first = IncidentId::new();
        let second = IncidentId::new();
        {
            let store = SqliteStore::open(&path).unwrap();
            assert_eq!(store.incident(), Outcome::Done(None));
            store.set_incident(first).into_result("incident").unwrap();
            store.set_incident(second).into_result("incident").unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.incident(), Outcome::Done(Some(second)));
    }

    #[test]
    fn discard_all_tentative_keeps_confirmed_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_team(&team(-1, "101", 10)).into_result("insert").unwrap();
        store.insert_team(&team(3, "102", 10)).into_result("insert").unwrap();
        store
            .insert_pairing(&PairingRow {
                n: RowKey::new(0),
                pid: GlobalId::TENTATIVE,
                aid: GlobalId::new(1),
                tid: GlobalId::new(3),
                status: PairingStatus::Current,
                name_save: None,
                resource_save: None,
                last_edit_epoch: Epoch::from_millis(11),
            })
            .into_result("insert")
            .unwrap();

        assert_eq!(store.discard_all_tentative(), Outcome::Done(2));
        let teams = store.list_teams().into_result("list").unwrap();
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].tid, GlobalId::new(3));
        assert_eq!(store.list_pairings(), Outcome::Done(vec![]));
    }
}
