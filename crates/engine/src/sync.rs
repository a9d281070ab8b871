//! Incremental pull from the host and idempotent merge of the returned delta.

use tracing::{debug, info, warn};

use tracker_core::{
    EntityKind, Epoch, IncidentId, NodeRole,
    wire::{Envelope, HostRequest, HostResponse, SyncDelta},
};
use tracker_storage::{SqliteStore, Store};

use crate::error::EngineError;
use crate::lifecycle::{EntityLifecycle, replay_pairing_into};
use crate::link::HostLink;

/// What one merge did to the local store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub since: Epoch,
    pub watermark: Epoch,
    pub inserted: usize,
    pub updated: usize,
    pub history_added: usize,
    pub removed: usize,
    /// The host had moved to a new incident; local rows were dropped first.
    pub incident_reset: bool,
}

impl PullReport {
    pub fn changed(&self) -> usize {
        self.inserted + self.updated + self.history_added + self.removed
    }
}

/// Watermark-driven pull. The watermark only moves after a delta has been
/// fully applied, and only to the host's timestamp.
#[derive(Debug, Clone, Default)]
pub struct SyncEngine {
    watermark: Epoch,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_watermark(watermark: Epoch) -> Self {
        Self { watermark }
    }

    pub fn watermark(&self) -> Epoch {
        self.watermark
    }

    /// Forget the watermark so the next pull fetches everything.
    pub fn rewind(&mut self) {
        self.watermark = Epoch::ZERO;
    }

    pub fn pull(
        &mut self,
        link: &dyn HostLink,
        lifecycle: &mut EntityLifecycle,
    ) -> Result<PullReport, EngineError> {
        if lifecycle.role() == NodeRole::Host {
            return Err(EngineError::RoleViolation { op: "pull", role: NodeRole::Host });
        }
        let since = self.watermark;
        let incident = lifecycle.incident();
        let mut delta = Self::fetch(link, since, incident)?;
        if since > Epoch::ZERO && starts_new_incident(lifecycle, &delta) {
            delta = Self::fetch(link, Epoch::ZERO, incident)?;
        }
        self.apply(lifecycle, delta)
    }

    /// Ask the host for everything after `since`. Touches nothing locally.
    pub fn fetch(
        link: &dyn HostLink,
        since: Epoch,
        incident: Option<IncidentId>,
    ) -> Result<SyncDelta, EngineError> {
        let envelope = Envelope::new(HostRequest::PullSince { since }).in_incident(incident);
        let response = link.call(envelope).map_err(|e| {
            warn!(host = %link.describe(), %since, error = %e, "pull failed, watermark kept");
            EngineError::from(e)
        })?;
        match response {
            HostResponse::Delta(delta) => Ok(delta),
            HostResponse::Rejected { reason } => Err(EngineError::Rejected(reason)),
            other => Err(EngineError::TransientNetwork(format!(
                "unexpected answer to pull-since: {other:?}"
            ))),
        }
    }

    /// Merge `delta` in one transaction, then advance the watermark.
    ///
    /// A delta from another incident first drops every local row and the
    /// watermark. It should then cover everything since zero, which is what
    /// [`Self::pull`] makes sure of.
    pub fn apply(
        &mut self,
        lifecycle: &mut EntityLifecycle,
        delta: SyncDelta,
    ) -> Result<PullReport, EngineError> {
        let since = self.watermark;
        let incident_reset = match delta.incident {
            Some(incident) => lifecycle.adopt_incident(incident)?,
            None => false,
        };
        if incident_reset {
            self.rewind();
        }
        let mut report = lifecycle
            .store()
            .transaction(|store| merge(store, &delta))?;

        self.watermark = self.watermark.max(delta.timestamp);
        lifecycle.observe(self.watermark);
        report.since = since;
        report.watermark = self.watermark;
        report.incident_reset = incident_reset;

        if report.changed() > 0 {
            info!(
                %since,
                watermark = %report.watermark,
                inserted = report.inserted,
                updated = report.updated,
                history = report.history_added,
                removed = report.removed,
                "delta applied"
            );
        } else {
            debug!(%since, watermark = %report.watermark, "delta empty");
        }
        Ok(report)
    }
}

/// True when `delta` comes from an incident other than the one the local
/// rows belong to.
pub fn starts_new_incident(lifecycle: &EntityLifecycle, delta: &SyncDelta) -> bool {
    matches!(
        (lifecycle.incident(), delta.incident),
        (Some(ours), Some(theirs)) if ours != theirs
    )
}

enum Merged {
    Inserted,
    Updated,
}

fn upsert(
    affected: usize,
    what: impl FnOnce() -> String,
    insert: impl FnOnce() -> Result<(), EngineError>,
) -> Result<Merged, EngineError> {
    match affected {
        0 => {
            insert()?;
            Ok(Merged::Inserted)
        }
        1 => Ok(Merged::Updated),
        matched => Err(EngineError::ValidationConflict { what: what(), matched }),
    }
}

fn merge(store: &SqliteStore, delta: &SyncDelta) -> Result<PullReport, EngineError> {
    let mut report = PullReport::default();
    let mut tally = |merged: Merged| match merged {
        Merged::Inserted => report.inserted += 1,
        Merged::Updated => report.updated += 1,
    };

    for row in &delta.teams {
        let affected = store.replace_team(row).into_result("merge team")?;
        tally(upsert(affected, || format!("team {}", row.tid), || {
            store.insert_team(row).into_result("insert team")?;
            Ok(())
        })?);
    }
    for row in &delta.assignments {
        let affected = store.replace_assignment(row).into_result("merge assignment")?;
        tally(upsert(affected, || format!("assignment {}", row.aid), || {
            store.insert_assignment(row).into_result("insert assignment")?;
            Ok(())
        })?);
    }
    for row in &delta.pairings {
        let affected = store.replace_pairing(row).into_result("merge pairing")?;
        tally(upsert(affected, || format!("pairing {}", row.pid), || {
            replay_pairing_into(store, row)?;
            Ok(())
        })?);
    }

    let mut history_added = 0;
    for row in &delta.history {
        if store.count_history(row.hid).into_result("count history")? == 0 {
            store.insert_history(row).into_result("insert history")?;
            history_added += 1;
        }
    }

    let mut removed = 0;
    for removal in &delta.removals {
        removed += match removal.kind {
            EntityKind::Team => store.delete_team(removal.id).into_result("remove team")?,
            EntityKind::Assignment => {
                store.delete_assignment(removal.id).into_result("remove assignment")?
            }
            kind => return Err(EngineError::Permanent(kind)),
        };
    }

    report.history_added = history_added;
    report.removed = removed;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracker_core::{
        GlobalId, HistoryRow, IncidentId, PairingRow, PairingStatus, Removal, RowKey, TeamRow,
        TeamStatus,
    };

    fn client() -> EntityLifecycle {
        EntityLifecycle::client(SqliteStore::open_in_memory().unwrap(), "field")
    }

    fn team(tid: i64, status: TeamStatus, at: i64) -> TeamRow {
        TeamRow {
            n: RowKey::new(0),
            tid: GlobalId::new(tid),
            name: format!("{}", 100 + tid),
            status,
            resource: "GROUND".into(),
            medical: false,
            last_edit_epoch: Epoch::from_millis(at),
        }
    }

    #[test]
    fn unknown_rows_are_inserted_and_known_rows_updated() {
        let mut lifecycle = client();
        let mut sync = SyncEngine::new();

        let report = sync
            .apply(
                &mut lifecycle,
                SyncDelta {
                    teams: vec![team(1, TeamStatus::Unassigned, 10)],
                    timestamp: Epoch::from_millis(20),
                    ..SyncDelta::default()
                },
            )
            .unwrap();
        assert_eq!((report.inserted, report.updated), (1, 0));
        assert_eq!(sync.watermark(), Epoch::from_millis(20));

        let report = sync
            .apply(
                &mut lifecycle,
                SyncDelta {
                    teams: vec![team(1, TeamStatus::Working, 30)],
                    timestamp: Epoch::from_millis(40),
                    ..SyncDelta::default()
                },
            )
            .unwrap();
        assert_eq!((report.inserted, report.updated), (0, 1));
        let stored = lifecycle.team(GlobalId::new(1)).unwrap().unwrap();
        assert_eq!(stored.status, TeamStatus::Working);
        assert_eq!(lifecycle.teams().unwrap().len(), 1);
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let mut lifecycle = client();
        let mut sync = SyncEngine::with_watermark(Epoch::from_millis(100));
        let report = sync
            .apply(
                &mut lifecycle,
                SyncDelta { timestamp: Epoch::from_millis(50), ..SyncDelta::default() },
            )
            .unwrap();
        assert_eq!(report.watermark, Epoch::from_millis(100));
    }

    #[test]
    fn replayed_pairing_leaves_status_alone() {
        let mut lifecycle = client();
        let mut sync = SyncEngine::new();
        let pairing = PairingRow {
            n: RowKey::new(0),
            pid: GlobalId::new(1),
            aid: GlobalId::new(1),
            tid: GlobalId::new(1),
            status: PairingStatus::Current,
            name_save: None,
            resource_save: None,
            last_edit_epoch: Epoch::from_millis(12),
        };
        sync.apply(
            &mut lifecycle,
            SyncDelta {
                teams: vec![team(1, TeamStatus::Working, 11)],
                pairings: vec![pairing],
                timestamp: Epoch::from_millis(13),
                ..SyncDelta::default()
            },
        )
        .unwrap();
        let stored = lifecycle.team(GlobalId::new(1)).unwrap().unwrap();
        assert_eq!(stored.status, TeamStatus::Working);
        assert!(lifecycle.pairing(GlobalId::new(1)).unwrap().unwrap().is_current());
    }

    #[test]
    fn known_history_is_not_rewritten() {
        let mut lifecycle = client();
        let mut sync = SyncEngine::new();
        let entry = HistoryRow {
            n: RowKey::new(0),
            hid: GlobalId::new(1),
            aid: None,
            tid: Some(GlobalId::new(1)),
            description: "Team 101 created (GROUND)".into(),
            recorded_by: "base".into(),
            epoch: Epoch::from_millis(5),
        };
        let mut altered = entry.clone();
        altered.description = "something else".into();

        let first = sync
            .apply(
                &mut lifecycle,
                SyncDelta { history: vec![entry], timestamp: Epoch::from_millis(6), ..SyncDelta::default() },
            )
            .unwrap();
        let second = sync
            .apply(
                &mut lifecycle,
                SyncDelta { history: vec![altered], timestamp: Epoch::from_millis(7), ..SyncDelta::default() },
            )
            .unwrap();
        assert_eq!((first.history_added, second.history_added), (1, 0));
        let history = lifecycle.history().all().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].description, "Team 101 created (GROUND)");
    }

    #[test]
    fn removals_delete_by_global_id() {
        let mut lifecycle = client();
        let mut sync = SyncEngine::new();
        sync.apply(
            &mut lifecycle,
            SyncDelta {
                teams: vec![team(1, TeamStatus::Unassigned, 1), team(2, TeamStatus::Unassigned, 2)],
                timestamp: Epoch::from_millis(3),
                ..SyncDelta::default()
            },
        )
        .unwrap();
        let report = sync
            .apply(
                &mut lifecycle,
                SyncDelta {
                    removals: vec![Removal {
                        kind: EntityKind::Team,
                        id: GlobalId::new(1),
                        epoch: Epoch::from_millis(4),
                    }],
                    timestamp: Epoch::from_millis(5),
                    ..SyncDelta::default()
                },
            )
            .unwrap();
        assert_eq!(report.removed, 1);
        let remaining: Vec<_> = lifecycle.teams().unwrap().into_iter().map(|t| t.tid).collect();
        assert_eq!(remaining, vec![GlobalId::new(2)]);
    }

    #[test]
    fn delta_from_a_new_incident_replaces_everything() {
        let mut lifecycle = client();
        let mut sync = SyncEngine::new();
        let first = IncidentId::new();
        sync.apply(
            &mut lifecycle,
            SyncDelta {
                incident: Some(first),
                teams: vec![team(1, TeamStatus::Working, 10), team(2, TeamStatus::Working, 11)],
                timestamp: Epoch::from_millis(12),
                ..SyncDelta::default()
            },
        )
        .unwrap();

        let second = SyncDelta {
            incident: Some(IncidentId::new()),
            teams: vec![team(1, TeamStatus::Unassigned, 20)],
            timestamp: Epoch::from_millis(21),
            ..SyncDelta::default()
        };
        assert!(starts_new_incident(&lifecycle, &second));
        let report = sync.apply(&mut lifecycle, second).unwrap();
        assert!(report.incident_reset);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.watermark, Epoch::from_millis(21));

        let teams = lifecycle.teams().unwrap();
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].status, TeamStatus::Unassigned);
    }

    #[test]
    fn failed_merge_rolls_back_and_keeps_watermark() {
        let mut lifecycle = client();
        let mut sync = SyncEngine::new();
        let bad_pairing = PairingRow {
            n: RowKey::new(0),
            pid: GlobalId::TENTATIVE,
            aid: GlobalId::new(1),
            tid: GlobalId::new(1),
            status: PairingStatus::Current,
            name_save: None,
            resource_save: None,
            last_edit_epoch: Epoch::from_millis(2),
        };
        let result = sync.apply(
            &mut lifecycle,
            SyncDelta {
                teams: vec![team(1, TeamStatus::Unassigned, 1)],
                pairings: vec![bad_pairing],
                timestamp: Epoch::from_millis(3),
                ..SyncDelta::default()
            },
        );
        assert!(matches!(result, Err(EngineError::IdentityNotYetAssigned(_))));
        assert_eq!(sync.watermark(), Epoch::ZERO);
        assert!(lifecycle.teams().unwrap().is_empty());
    }
}
