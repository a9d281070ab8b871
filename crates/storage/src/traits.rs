use tracker_core::{
    AssignmentRow, AssignmentStatus, EntityKind, Epoch, GlobalId, HistoryRow, IncidentId,
    PairingRow, Removal, RowKey, TeamRow, TeamStatus,
};

use crate::error::StorageError;

/// Result of one store call.
///
/// A statement fault is logged by the store and reported as `Faulted`
/// instead of an error, so that a caller can never mistake it for a
/// successful empty read: `Done(vec![])` means "no rows", `Faulted` means
/// "don't know".
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T> {
    Done(T),
    Faulted,
}

impl<T> Outcome<T> {
    pub fn is_faulted(&self) -> bool {
        matches!(self, Outcome::Faulted)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            Outcome::Faulted => None,
        }
    }

    /// Turn the sentinel into an error naming what was being attempted.
    pub fn into_result(self, what: &str) -> Result<T, StorageError> {
        match self {
            Outcome::Done(value) => Ok(value),
            Outcome::Faulted => Err(StorageError::Faulted(what.to_string())),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Done(value) => Outcome::Done(f(value)),
            Outcome::Faulted => Outcome::Faulted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryFilter {
    All,
    Assignment(GlobalId),
    Team(GlobalId),
    Pair {
        aid: GlobalId,
        tid: GlobalId,
        mode: Match,
    },
    Since(Epoch),
}

pub trait Store {
    /// Truncate every table, the incident marker included.
    fn reset_incident(&self) -> Outcome<()>;

    /// Incident the stored rows belong to, if one was recorded.
    fn incident(&self) -> Outcome<Option<IncidentId>>;

    fn set_incident(&self, incident: IncidentId) -> Outcome<()>;

    fn max_global_id(&self, kind: EntityKind) -> Outcome<GlobalId>;

    /// Delete the row `n` of `kind` if it is still tentative.
    fn discard_tentative(&self, kind: EntityKind, n: RowKey) -> Outcome<usize>;

    /// Delete every tentative team, assignment and pairing.
    fn discard_all_tentative(&self) -> Outcome<usize>;

    // Teams

    /// Insert a team. `row.n` is ignored; the assigned key is returned.
    fn insert_team(&self, row: &TeamRow) -> Outcome<RowKey>;

    fn get_team(&self, n: RowKey) -> Outcome<Option<TeamRow>>;

    fn find_team(&self, tid: GlobalId) -> Outcome<Option<TeamRow>>;

    fn list_teams(&self) -> Outcome<Vec<TeamRow>>;

    fn teams_since(&self, since: Epoch) -> Outcome<Vec<TeamRow>>;

    fn update_team_status(&self, tid: GlobalId, status: TeamStatus, at: Epoch) -> Outcome<usize>;

    fn update_team_resource(&self, tid: GlobalId, resource: &str, at: Epoch) -> Outcome<usize>;

    fn update_team_medical(&self, tid: GlobalId, medical: bool, at: Epoch) -> Outcome<usize>;

    fn finalize_team(&self, n: RowKey, tid: GlobalId, at: Epoch) -> Outcome<usize>;

    /// Overwrite every mutable column of the team(s) with `row.tid`.
    fn replace_team(&self, row: &TeamRow) -> Outcome<usize>;

    fn delete_team(&self, tid: GlobalId) -> Outcome<usize>;

    // Assignments

    fn insert_assignment(&self, row: &AssignmentRow) -> Outcome<RowKey>;

    fn get_assignment(&self, n: RowKey) -> Outcome<Option<AssignmentRow>>;

    fn find_assignment(&self, aid: GlobalId) -> Outcome<Option<AssignmentRow>>;

    fn list_assignments(&self) -> Outcome<Vec<AssignmentRow>>;

    fn assignments_since(&self, since: Epoch) -> Outcome<Vec<AssignmentRow>>;

    fn update_assignment_status(
        &self,
        aid: GlobalId,
        status: AssignmentStatus,
        at: Epoch,
    ) -> Outcome<usize>;

    fn update_intended_resource(&self, aid: GlobalId, resource: &str, at: Epoch) -> Outcome<usize>;

    fn update_external_ref(&self, aid: GlobalId, external_ref: Option<&str>, at: Epoch)
    -> Outcome<usize>;

    fn finalize_assignment(&self, n: RowKey, aid: GlobalId, at: Epoch) -> Outcome<usize>;

    fn replace_assignment(&self, row: &AssignmentRow) -> Outcome<usize>;

    fn delete_assignment(&self, aid: GlobalId) -> Outcome<usize>;

    // Pairings

    fn insert_pairing(&self, row: &PairingRow) -> Outcome<RowKey>;

    fn get_pairing(&self, n: RowKey) -> Outcome<Option<PairingRow>>;

    fn find_pairing(&self, pid: GlobalId) -> Outcome<Option<PairingRow>>;

    fn find_current_pairing(&self, aid: GlobalId, tid: GlobalId) -> Outcome<Option<PairingRow>>;

    fn list_pairings(&self) -> Outcome<Vec<PairingRow>>;

    fn pairings_since(&self, since: Epoch) -> Outcome<Vec<PairingRow>>;

    fn current_pairings_for_team(&self, tid: GlobalId) -> Outcome<Vec<PairingRow>>;

    fn current_pairings_for_assignment(&self, aid: GlobalId) -> Outcome<Vec<PairingRow>>;

    /// Mark a CURRENT pairing PREVIOUS and store the team snapshot.
    fn close_pairing(
        &self,
        pid: GlobalId,
        name_save: Option<&str>,
        resource_save: Option<&str>,
        at: Epoch,
    ) -> Outcome<usize>;

    fn finalize_pairing(&self, n: RowKey, pid: GlobalId, at: Epoch) -> Outcome<usize>;

    fn replace_pairing(&self, row: &PairingRow) -> Outcome<usize>;

    // History

    fn insert_history(&self, row: &HistoryRow) -> Outcome<RowKey>;

    fn count_history(&self, hid: GlobalId) -> Outcome<usize>;

    fn list_history(&self, filter: HistoryFilter) -> Outcome<Vec<HistoryRow>>;

    // Removals

    fn insert_removal(&self, removal: &Removal) -> Outcome<()>;

    fn removals_since(&self, since: Epoch) -> Outcome<Vec<Removal>>;
}
