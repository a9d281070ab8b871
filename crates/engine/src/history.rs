//! Append-only audit trail. Only the host writes new entries; replicas
//! receive them through sync.

use tracker_core::{Epoch, GlobalId, HistoryRow, RowKey};
use tracker_storage::{HistoryFilter, Match, SqliteStore, Store};

use crate::error::EngineError;

pub struct HistoryLedger<'a> {
    store: &'a SqliteStore,
}

impl<'a> HistoryLedger<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self { store }
    }

    pub(crate) fn append(
        &self,
        hid: GlobalId,
        aid: Option<GlobalId>,
        tid: Option<GlobalId>,
        description: String,
        recorded_by: &str,
        epoch: Epoch,
    ) -> Result<HistoryRow, EngineError> {
        let mut row = HistoryRow {
            n: RowKey::new(0),
            hid,
            aid,
            tid,
            description,
            recorded_by: recorded_by.to_string(),
            epoch,
        };
        row.n = self.store.insert_history(&row).into_result("append history")?;
        Ok(row)
    }

    pub fn all(&self) -> Result<Vec<HistoryRow>, EngineError> {
        self.query(HistoryFilter::All)
    }

    pub fn for_assignment(&self, aid: GlobalId) -> Result<Vec<HistoryRow>, EngineError> {
        self.query(HistoryFilter::Assignment(aid))
    }

    pub fn for_team(&self, tid: GlobalId) -> Result<Vec<HistoryRow>, EngineError> {
        self.query(HistoryFilter::Team(tid))
    }

    /// Entries mentioning the assignment and the team (`Match::All`) or
    /// either of them (`Match::Any`).
    pub fn for_pair(
        &self,
        aid: GlobalId,
        tid: GlobalId,
        mode: Match,
    ) -> Result<Vec<HistoryRow>, EngineError> {
        self.query(HistoryFilter::Pair { aid, tid, mode })
    }

    pub fn since(&self, since: Epoch) -> Result<Vec<HistoryRow>, EngineError> {
        self.query(HistoryFilter::Since(since))
    }

    fn query(&self, filter: HistoryFilter) -> Result<Vec<HistoryRow>, EngineError> {
        Ok(self.store.list_history(filter).into_result("history query")?)
    }
}

pub(crate) mod describe {
    pub fn team_created(name: &str, resource: &str) -> String {
        format!("Team {name} created ({resource})")
    }

    pub fn assignment_created(name: &str, intended: &str) -> String {
        format!("Assignment {name} created (intended resource {intended})")
    }

    pub fn team_status(name: &str, status: &str) -> String {
        format!("Team {name} status changed to {status}")
    }

    pub fn assignment_status(name: &str, status: &str) -> String {
        format!("Assignment {name} status changed to {status}")
    }

    pub fn resource(name: &str, resource: &str) -> String {
        format!("Team {name} resource changed to {resource}")
    }

    pub fn medical(name: &str, medical: bool) -> String {
        if medical {
            format!("Team {name} marked medical")
        } else {
            format!("Team {name} medical flag cleared")
        }
    }

    pub fn intended_resource(name: &str, resource: &str) -> String {
        format!("Assignment {name} intended resource changed to {resource}")
    }

    pub fn paired(team: &str, assignment: &str) -> String {
        format!("Team {team} paired with assignment {assignment}")
    }

    pub fn pairing_closed(team: &str, assignment: &str) -> String {
        format!("Team {team} finished assignment {assignment}")
    }

    pub fn team_deleted(name: &str) -> String {
        format!("Team {name} deleted")
    }

    pub fn assignment_deleted(name: &str) -> String {
        format!("Assignment {name} deleted")
    }
}
