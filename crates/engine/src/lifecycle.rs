use std::sync::Arc;

use tracing::{debug, info, warn};

use tracker_core::{
    AssignmentRow, AssignmentStatus, CoreError, EditClock, EntityKind, Epoch, GlobalId,
    IdentityAllocator, IncidentId, NodeId, NodeRole, PairingRow, PairingStatus, Removal, RowKey,
    StatusChange, StatusCommand, Target, TeamRow, TeamStatus, wire::ChangeSignal,
};
use tracker_storage::{SqliteStore, Store};

use crate::error::EngineError;
use crate::fanout::{NotificationFanout, NullFanout};
use crate::history::{HistoryLedger, describe};
use crate::role::{ClientPolicy, HostPolicy, RolePolicy};

/// Whether a mutation signals listeners immediately or leaves the signal for
/// a later [`EntityLifecycle::flush_notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Now,
    Defer,
}

impl Push {
    pub fn from_flag(push: bool) -> Self {
        if push { Push::Now } else { Push::Defer }
    }

    pub fn as_flag(&self) -> bool {
        matches!(self, Push::Now)
    }
}

struct Note {
    aid: Option<GlobalId>,
    tid: Option<GlobalId>,
    description: String,
}

impl Note {
    fn team(tid: GlobalId, description: String) -> Self {
        Self { aid: None, tid: Some(tid), description }
    }

    fn assignment(aid: GlobalId, description: String) -> Self {
        Self { aid: Some(aid), tid: None, description }
    }

    fn pair(aid: GlobalId, tid: GlobalId, description: String) -> Self {
        Self { aid: Some(aid), tid: Some(tid), description }
    }
}

fn expect_one(affected: usize, what: impl FnOnce() -> String) -> Result<(), EngineError> {
    match affected {
        1 => Ok(()),
        0 => Err(EngineError::NotFound(what())),
        matched => Err(EngineError::ValidationConflict { what: what(), matched }),
    }
}

fn require_confirmed(id: GlobalId, what: impl FnOnce() -> String) -> Result<(), EngineError> {
    if id.is_confirmed() {
        Ok(())
    } else {
        Err(EngineError::IdentityNotYetAssigned(what()))
    }
}

/// Create, finalize, mutate and delete operations over one node's store,
/// enforcing the status and pairing rules. Role differences (id allocation,
/// history authorship) come from the injected [`RolePolicy`].
pub struct EntityLifecycle {
    policy: Box<dyn RolePolicy>,
    store: SqliteStore,
    clock: EditClock,
    actor: String,
    node_id: NodeId,
    fanout: Arc<dyn NotificationFanout>,
    unsent_change: Option<Epoch>,
    incident: Option<IncidentId>,
}

impl EntityLifecycle {
    pub fn new(
        policy: Box<dyn RolePolicy>,
        store: SqliteStore,
        actor: impl Into<String>,
        fanout: Arc<dyn NotificationFanout>,
    ) -> Self {
        Self {
            policy,
            store,
            clock: EditClock::new(),
            actor: actor.into(),
            node_id: NodeId::new(),
            fanout,
            unsent_change: None,
            incident: None,
        }
    }

    /// Host lifecycle. The allocator resumes past any ids already in `store`,
    /// and the stored incident is kept; a blank store starts a fresh one.
    pub fn host(
        store: SqliteStore,
        actor: impl Into<String>,
        fanout: Arc<dyn NotificationFanout>,
    ) -> Result<Self, EngineError> {
        let mut highest = Vec::new();
        for kind in EntityKind::ALL {
            highest.push((kind, store.max_global_id(kind).into_result("resume allocator")?));
        }
        let incident = match store.incident().into_result("load incident")? {
            Some(incident) => incident,
            None => {
                let incident = IncidentId::new();
                store.set_incident(incident).into_result("record incident")?;
                incident
            }
        };
        let policy = HostPolicy::new(IdentityAllocator::resume(highest));
        let mut lifecycle = Self::new(Box::new(policy), store, actor, fanout);
        lifecycle.incident = Some(incident);
        Ok(lifecycle)
    }

    pub fn client(store: SqliteStore, actor: impl Into<String>) -> Self {
        Self::new(Box::new(ClientPolicy), store, actor, Arc::new(NullFanout))
    }

    pub fn role(&self) -> NodeRole {
        self.policy.role()
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Incident the local rows belong to. `None` on a client that has never
    /// synced.
    pub fn incident(&self) -> Option<IncidentId> {
        self.incident
    }

    pub fn history(&self) -> HistoryLedger<'_> {
        HistoryLedger::new(&self.store)
    }

    /// Stamp for the next local mutation.
    pub fn tick(&mut self) -> Result<Epoch, EngineError> {
        Ok(self.clock.tick()?)
    }

    /// Fold in an epoch stamped by the host.
    pub fn observe(&mut self, epoch: Epoch) {
        self.clock.observe(epoch);
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn teams(&self) -> Result<Vec<TeamRow>, EngineError> {
        Ok(self.store.list_teams().into_result("list teams")?)
    }

    pub fn assignments(&self) -> Result<Vec<AssignmentRow>, EngineError> {
        Ok(self.store.list_assignments().into_result("list assignments")?)
    }

    pub fn pairings(&self) -> Result<Vec<PairingRow>, EngineError> {
        Ok(self.store.list_pairings().into_result("list pairings")?)
    }

    pub fn team(&self, tid: GlobalId) -> Result<Option<TeamRow>, EngineError> {
        Ok(self.store.find_team(tid).into_result("find team")?)
    }

    pub fn team_at(&self, n: RowKey) -> Result<Option<TeamRow>, EngineError> {
        Ok(self.store.get_team(n).into_result("get team")?)
    }

    pub fn assignment(&self, aid: GlobalId) -> Result<Option<AssignmentRow>, EngineError> {
        Ok(self.store.find_assignment(aid).into_result("find assignment")?)
    }

    pub fn assignment_at(&self, n: RowKey) -> Result<Option<AssignmentRow>, EngineError> {
        Ok(self.store.get_assignment(n).into_result("get assignment")?)
    }

    pub fn pairing(&self, pid: GlobalId) -> Result<Option<PairingRow>, EngineError> {
        Ok(self.store.find_pairing(pid).into_result("find pairing")?)
    }

    pub fn pairing_at(&self, n: RowKey) -> Result<Option<PairingRow>, EngineError> {
        Ok(self.store.get_pairing(n).into_result("get pairing")?)
    }

    /// CURRENT pairings referencing a team, an assignment, or the pairing itself.
    pub fn current_pairings(&self, target: Target) -> Result<Vec<PairingRow>, EngineError> {
        match target.kind {
            EntityKind::Team => Ok(self
                .store
                .current_pairings_for_team(target.id)
                .into_result("current pairings for team")?),
            EntityKind::Assignment => Ok(self
                .store
                .current_pairings_for_assignment(target.id)
                .into_result("current pairings for assignment")?),
            EntityKind::Pairing => Ok(self
                .pairing(target.id)?
                .filter(PairingRow::is_current)
                .into_iter()
                .collect()),
            EntityKind::History => Err(EngineError::Permanent(EntityKind::History)),
        }
    }

    fn require_team(&self, tid: GlobalId) -> Result<TeamRow, EngineError> {
        self.team(tid)?
            .ok_or_else(|| EngineError::NotFound(format!("team {tid}")))
    }

    fn require_assignment(&self, aid: GlobalId) -> Result<AssignmentRow, EngineError> {
        self.assignment(aid)?
            .ok_or_else(|| EngineError::NotFound(format!("assignment {aid}")))
    }

    // ========================================================================
    // Creation and finalization
    // ========================================================================

    /// Create a team. Hosts assign the permanent `tid` immediately; clients
    /// store the row tentatively with `tid = -1` until [`Self::finalize`].
    pub fn create_team(&mut self, name: &str, resource: &str) -> Result<TeamRow, EngineError> {
        let at = self.clock.tick()?;
        let tid = self.policy.issue_id(EntityKind::Team);
        let mut row = TeamRow {
            n: RowKey::new(0),
            tid,
            name: name.to_string(),
            status: TeamStatus::Unassigned,
            resource: resource.to_string(),
            medical: false,
            last_edit_epoch: at,
        };
        let notes = vec![Note::team(tid, describe::team_created(name, resource))];
        row.n = self.commit(at, Push::Now, notes, |store| {
            Ok(store.insert_team(&row).into_result("insert team")?)
        })?;
        info!(n = %row.n, tid = %row.tid, team = %row.name, role = %self.role(), "team created");
        Ok(row)
    }

    pub fn create_assignment(
        &mut self,
        name: &str,
        intended_resource: &str,
    ) -> Result<AssignmentRow, EngineError> {
        let at = self.clock.tick()?;
        let aid = self.policy.issue_id(EntityKind::Assignment);
        let mut row = AssignmentRow {
            n: RowKey::new(0),
            aid,
            name: name.to_string(),
            status: AssignmentStatus::Unassigned,
            intended_resource: intended_resource.to_string(),
            external_ref: None,
            last_edit_epoch: at,
        };
        let notes = vec![Note::assignment(
            aid,
            describe::assignment_created(name, intended_resource),
        )];
        row.n = self.commit(at, Push::Now, notes, |store| {
            Ok(store.insert_assignment(&row).into_result("insert assignment")?)
        })?;
        info!(n = %row.n, aid = %row.aid, assignment = %row.name, role = %self.role(), "assignment created");
        Ok(row)
    }

    /// Adopt the host's id for the tentative row `n`. Rows are addressed by
    /// local key only, so several creates can be in flight at once.
    ///
    /// If a pull already delivered the host's copy of the row, the tentative
    /// row is superseded and discarded; the surviving row's key is returned.
    pub fn finalize(
        &mut self,
        kind: EntityKind,
        n: RowKey,
        id: GlobalId,
        edit_epoch: Epoch,
    ) -> Result<RowKey, EngineError> {
        if self.role() != NodeRole::Client {
            return Err(EngineError::RoleViolation { op: "finalize", role: self.role() });
        }
        if !id.is_confirmed() {
            return Err(EngineError::InvalidFinalize(format!("{kind} {n} cannot take id {id}")));
        }

        let current = self
            .local_global_id(kind, n)?
            .ok_or_else(|| EngineError::NotFound(format!("{kind} {n}")))?;
        if current == id {
            self.clock.observe(edit_epoch);
            return Ok(n);
        }
        if current.is_confirmed() {
            return Err(EngineError::InvalidFinalize(format!(
                "{kind} {n} is already confirmed as {current}"
            )));
        }

        if let Some(existing) = self.local_key(kind, id)? {
            self.store
                .discard_tentative(kind, n)
                .into_result("discard superseded row")?;
            debug!(%kind, %n, %id, kept = %existing, "tentative row superseded by pull");
            self.clock.observe(edit_epoch);
            return Ok(existing);
        }

        let affected = match kind {
            EntityKind::Team => self.store.finalize_team(n, id, edit_epoch),
            EntityKind::Assignment => self.store.finalize_assignment(n, id, edit_epoch),
            EntityKind::Pairing => self.store.finalize_pairing(n, id, edit_epoch),
            EntityKind::History => unreachable_history()?,
        }
        .into_result("finalize")?;
        expect_one(affected, || format!("{kind} {n}"))?;
        self.clock.observe(edit_epoch);
        info!(%kind, %n, %id, "tentative row finalized");
        Ok(n)
    }

    /// Drop a tentative row the host refused to create.
    pub fn discard_tentative(&mut self, kind: EntityKind, n: RowKey) -> Result<bool, EngineError> {
        let affected = self
            .store
            .discard_tentative(kind, n)
            .into_result("discard tentative row")?;
        Ok(affected > 0)
    }

    fn local_global_id(&self, kind: EntityKind, n: RowKey) -> Result<Option<GlobalId>, EngineError> {
        Ok(match kind {
            EntityKind::Team => self.team_at(n)?.map(|row| row.tid),
            EntityKind::Assignment => self.assignment_at(n)?.map(|row| row.aid),
            EntityKind::Pairing => self.pairing_at(n)?.map(|row| row.pid),
            EntityKind::History => unreachable_history()?,
        })
    }

    fn local_key(&self, kind: EntityKind, id: GlobalId) -> Result<Option<RowKey>, EngineError> {
        Ok(match kind {
            EntityKind::Team => self.team(id)?.map(|row| row.n),
            EntityKind::Assignment => self.assignment(id)?.map(|row| row.n),
            EntityKind::Pairing => self.pairing(id)?.map(|row| row.n),
            EntityKind::History => unreachable_history()?,
        })
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub fn set_status(
        &mut self,
        target: Target,
        status: StatusChange,
        push: Push,
    ) -> Result<Epoch, EngineError> {
        require_confirmed(target.id, || target.to_string())?;
        match (target.kind, status) {
            (EntityKind::Team, StatusChange::Team(status)) => {
                let team = self.require_team(target.id)?;
                let at = self.clock.tick()?;
                let notes = vec![Note::team(target.id, describe::team_status(&team.name, status.as_str()))];
                self.commit(at, push, notes, |store| {
                    let affected = store
                        .update_team_status(target.id, status, at)
                        .into_result("team status")?;
                    expect_one(affected, || target.to_string())
                })?;
                debug!(%target, %status, "team status set");
                Ok(at)
            }
            (EntityKind::Assignment, StatusChange::Assignment(status)) => {
                let assignment = self.require_assignment(target.id)?;
                let at = self.clock.tick()?;
                let notes = vec![Note::assignment(
                    target.id,
                    describe::assignment_status(&assignment.name, status.as_str()),
                )];
                self.commit(at, push, notes, |store| {
                    let affected = store
                        .update_assignment_status(target.id, status, at)
                        .into_result("assignment status")?;
                    expect_one(affected, || target.to_string())
                })?;
                debug!(%target, %status, "assignment status set");
                Ok(at)
            }
            _ => Err(EngineError::Core(CoreError::InvalidData(format!(
                "status {} does not apply to {target}",
                status.as_str()
            )))),
        }
    }

    pub fn set_resource(&mut self, tid: GlobalId, resource: &str) -> Result<Epoch, EngineError> {
        require_confirmed(tid, || format!("team {tid}"))?;
        let team = self.require_team(tid)?;
        let at = self.clock.tick()?;
        let notes = vec![Note::team(tid, describe::resource(&team.name, resource))];
        self.commit(at, Push::Now, notes, |store| {
            let affected = store
                .update_team_resource(tid, resource, at)
                .into_result("team resource")?;
            expect_one(affected, || format!("team {tid}"))
        })?;
        Ok(at)
    }

    pub fn set_medical(&mut self, tid: GlobalId, medical: bool) -> Result<Epoch, EngineError> {
        require_confirmed(tid, || format!("team {tid}"))?;
        let team = self.require_team(tid)?;
        let at = self.clock.tick()?;
        let notes = vec![Note::team(tid, describe::medical(&team.name, medical))];
        self.commit(at, Push::Now, notes, |store| {
            let affected = store
                .update_team_medical(tid, medical, at)
                .into_result("team medical")?;
            expect_one(affected, || format!("team {tid}"))
        })?;
        Ok(at)
    }

    pub fn set_intended_resource(
        &mut self,
        aid: GlobalId,
        resource: &str,
    ) -> Result<Epoch, EngineError> {
        require_confirmed(aid, || format!("assignment {aid}"))?;
        let assignment = self.require_assignment(aid)?;
        let at = self.clock.tick()?;
        let notes = vec![Note::assignment(
            aid,
            describe::intended_resource(&assignment.name, resource),
        )];
        self.commit(at, Push::Now, notes, |store| {
            let affected = store
                .update_intended_resource(aid, resource, at)
                .into_result("intended resource")?;
            expect_one(affected, || format!("assignment {aid}"))
        })?;
        Ok(at)
    }

    /// Link an assignment to its record in an external planning tool. Not an
    /// operational change, so it is not written to history.
    pub fn set_external_ref(
        &mut self,
        aid: GlobalId,
        external_ref: Option<&str>,
    ) -> Result<Epoch, EngineError> {
        require_confirmed(aid, || format!("assignment {aid}"))?;
        let at = self.clock.tick()?;
        self.commit(at, Push::Now, Vec::new(), |store| {
            let affected = store
                .update_external_ref(aid, external_ref, at)
                .into_result("external ref")?;
            expect_one(affected, || format!("assignment {aid}"))
        })?;
        Ok(at)
    }

    /// Hard delete. Pairings and history that mention the row stay behind and
    /// remain readable through their own text and snapshots.
    pub fn delete(&mut self, target: Target) -> Result<Epoch, EngineError> {
        require_confirmed(target.id, || target.to_string())?;
        let tombstone = self.role() == NodeRole::Host;
        match target.kind {
            EntityKind::Team => {
                let team = self.require_team(target.id)?;
                let at = self.clock.tick()?;
                let notes = vec![Note::team(target.id, describe::team_deleted(&team.name))];
                self.commit(at, Push::Now, notes, |store| {
                    let affected = store.delete_team(target.id).into_result("delete team")?;
                    expect_one(affected, || target.to_string())?;
                    if tombstone {
                        let removal = Removal { kind: target.kind, id: target.id, epoch: at };
                        store.insert_removal(&removal).into_result("record removal")?;
                    }
                    Ok(())
                })?;
                info!(%target, team = %team.name, "team deleted");
                Ok(at)
            }
            EntityKind::Assignment => {
                let assignment = self.require_assignment(target.id)?;
                let at = self.clock.tick()?;
                let notes = vec![Note::assignment(
                    target.id,
                    describe::assignment_deleted(&assignment.name),
                )];
                self.commit(at, Push::Now, notes, |store| {
                    let affected = store
                        .delete_assignment(target.id)
                        .into_result("delete assignment")?;
                    expect_one(affected, || target.to_string())?;
                    if tombstone {
                        let removal = Removal { kind: target.kind, id: target.id, epoch: at };
                        store.insert_removal(&removal).into_result("record removal")?;
                    }
                    Ok(())
                })?;
                info!(%target, assignment = %assignment.name, "assignment deleted");
                Ok(at)
            }
            kind => Err(EngineError::Permanent(kind)),
        }
    }

    pub fn delete_team(&mut self, tid: GlobalId) -> Result<Epoch, EngineError> {
        self.delete(Target::team(tid))
    }

    pub fn delete_assignment(&mut self, aid: GlobalId) -> Result<Epoch, EngineError> {
        self.delete(Target::assignment(aid))
    }

    // ========================================================================
    // Pairings
    // ========================================================================

    /// Pair a team with an assignment. Both must already carry host ids.
    /// Sets both to ASSIGNED.
    pub fn create_pairing(&mut self, aid: GlobalId, tid: GlobalId) -> Result<PairingRow, EngineError> {
        require_confirmed(aid, || format!("assignment {aid}"))?;
        require_confirmed(tid, || format!("team {tid}"))?;
        let team = self.require_team(tid)?;
        let assignment = self.require_assignment(aid)?;
        if self
            .store
            .find_current_pairing(aid, tid)
            .into_result("find current pairing")?
            .is_some()
        {
            return Err(EngineError::DuplicatePairing { aid, tid });
        }

        let at = self.clock.tick()?;
        let pid = self.policy.issue_id(EntityKind::Pairing);
        let mut row = PairingRow {
            n: RowKey::new(0),
            pid,
            aid,
            tid,
            status: PairingStatus::Current,
            name_save: None,
            resource_save: None,
            last_edit_epoch: at,
        };
        let notes = vec![Note::pair(aid, tid, describe::paired(&team.name, &assignment.name))];
        row.n = self.commit(at, Push::Now, notes, |store| {
            let n = store.insert_pairing(&row).into_result("insert pairing")?;
            let affected = store
                .update_team_status(tid, TeamStatus::Assigned, at)
                .into_result("team status")?;
            expect_one(affected, || format!("team {tid}"))?;
            let affected = store
                .update_assignment_status(aid, AssignmentStatus::Assigned, at)
                .into_result("assignment status")?;
            expect_one(affected, || format!("assignment {aid}"))?;
            Ok(n)
        })?;
        info!(pid = %row.pid, %aid, %tid, "pairing created");
        Ok(row)
    }

    /// Insert a pairing delivered by sync. Team and assignment status are left
    /// alone: the host's statuses arrive in the same delta.
    pub fn replay_pairing(&mut self, row: &PairingRow) -> Result<RowKey, EngineError> {
        let n = replay_pairing_into(&self.store, row)?;
        self.clock.observe(row.last_edit_epoch);
        Ok(n)
    }

    /// Close a CURRENT pairing. The team drops back to UNASSIGNED and the
    /// assignment becomes COMPLETED only when no other CURRENT pairing still
    /// references them.
    pub fn close_pairing(&mut self, pid: GlobalId) -> Result<PairingRow, EngineError> {
        require_confirmed(pid, || format!("pairing {pid}"))?;
        let pairing = self
            .pairing(pid)?
            .ok_or_else(|| EngineError::NotFound(format!("pairing {pid}")))?;
        if !pairing.is_current() {
            return Err(EngineError::PairingAlreadyClosed(pid));
        }
        let (aid, tid) = (pairing.aid, pairing.tid);

        let team = self.team(tid)?;
        let assignment = self.assignment(aid)?;
        let team_fan_in = self
            .current_pairings(Target::team(tid))?
            .iter()
            .filter(|other| other.pid != pid)
            .count();
        let assignment_fan_in = self
            .current_pairings(Target::assignment(aid))?
            .iter()
            .filter(|other| other.pid != pid)
            .count();
        let revert_team = team.is_some() && team_fan_in == 0;
        let complete_assignment = assignment.is_some() && assignment_fan_in == 0;

        let team_label = team
            .as_ref()
            .map(|t| t.name.clone())
            .or_else(|| pairing.name_save.clone())
            .unwrap_or_else(|| tid.to_string());
        let assignment_label = assignment
            .as_ref()
            .map(|a| a.name.clone())
            .unwrap_or_else(|| aid.to_string());

        let mut notes = vec![Note::pair(
            aid,
            tid,
            describe::pairing_closed(&team_label, &assignment_label),
        )];
        if revert_team {
            notes.push(Note::team(
                tid,
                describe::team_status(&team_label, TeamStatus::Unassigned.as_str()),
            ));
        }
        if complete_assignment {
            notes.push(Note::assignment(
                aid,
                describe::assignment_status(&assignment_label, AssignmentStatus::Completed.as_str()),
            ));
        }

        let at = self.clock.tick()?;
        let name_save = team.as_ref().map(|t| t.name.as_str());
        let resource_save = team.as_ref().map(|t| t.resource.as_str());
        self.commit(at, Push::Now, notes, |store| {
            let affected = store
                .close_pairing(pid, name_save, resource_save, at)
                .into_result("close pairing")?;
            expect_one(affected, || format!("pairing {pid}"))?;
            if revert_team {
                let affected = store
                    .update_team_status(tid, TeamStatus::Unassigned, at)
                    .into_result("team status")?;
                expect_one(affected, || format!("team {tid}"))?;
            }
            if complete_assignment {
                let affected = store
                    .update_assignment_status(aid, AssignmentStatus::Completed, at)
                    .into_result("assignment status")?;
                expect_one(affected, || format!("assignment {aid}"))?;
            }
            Ok(())
        })?;
        info!(%pid, %aid, %tid, team_fan_in, assignment_fan_in, "pairing closed");

        self.pairing(pid)?
            .ok_or_else(|| EngineError::NotFound(format!("pairing {pid}")))
    }

    /// Run a status-menu command. `Done` closes every CURRENT pairing of the
    /// target and returns the closed pairings.
    pub fn apply_command(
        &mut self,
        target: Target,
        command: StatusCommand,
        push: Push,
    ) -> Result<Vec<PairingRow>, EngineError> {
        match command {
            StatusCommand::Set(status) => {
                self.set_status(target, status, push)?;
                Ok(Vec::new())
            }
            StatusCommand::Done => {
                require_confirmed(target.id, || target.to_string())?;
                let open = self.current_pairings(target)?;
                if open.is_empty() {
                    return Err(EngineError::NotFound(format!("current pairing of {target}")));
                }
                let mut closed = Vec::with_capacity(open.len());
                for pairing in open {
                    closed.push(self.close_pairing(pairing.pid)?);
                }
                Ok(closed)
            }
        }
    }

    // ========================================================================
    // Incident and notification
    // ========================================================================

    /// Truncate every table, restart id counters and draw a new incident id.
    pub fn reset_incident(&mut self) -> Result<(), EngineError> {
        if self.role() != NodeRole::Host {
            return Err(EngineError::RoleViolation { op: "new incident", role: self.role() });
        }
        let incident = IncidentId::new();
        self.truncate_into(incident)?;
        let at = self.clock.tick()?;
        info!(%incident, "new incident started");
        self.changed(at, Push::Now);
        Ok(())
    }

    /// Follow the host into `incident`. Rows of any other incident are
    /// dropped; returns whether that happened.
    pub fn adopt_incident(&mut self, incident: IncidentId) -> Result<bool, EngineError> {
        if self.role() != NodeRole::Client {
            return Err(EngineError::RoleViolation { op: "adopt incident", role: self.role() });
        }
        match self.incident {
            Some(current) if current == incident => Ok(false),
            None => {
                self.store.set_incident(incident).into_result("record incident")?;
                self.incident = Some(incident);
                debug!(%incident, "incident recorded");
                Ok(false)
            }
            Some(previous) => {
                self.truncate_into(incident)?;
                warn!(%previous, %incident, "host started a new incident, local rows dropped");
                Ok(true)
            }
        }
    }

    /// Client start-up over an existing store: load the recorded incident and
    /// drop tentative rows, whose requests did not outlive the last process.
    pub fn recover(&mut self) -> Result<usize, EngineError> {
        if self.role() != NodeRole::Client {
            return Err(EngineError::RoleViolation { op: "recover", role: self.role() });
        }
        self.incident = self.store.incident().into_result("load incident")?;
        let dropped = self
            .store
            .discard_all_tentative()
            .into_result("discard orphaned rows")?;
        if dropped > 0 {
            warn!(dropped, "tentative rows without a pending request discarded");
        }
        Ok(dropped)
    }

    fn truncate_into(&mut self, incident: IncidentId) -> Result<(), EngineError> {
        self.store.transaction(|store| {
            store.reset_incident().into_result("reset incident")?;
            store.set_incident(incident).into_result("record incident")?;
            Ok::<_, EngineError>(())
        })?;
        self.policy.reset();
        self.unsent_change = None;
        self.incident = Some(incident);
        Ok(())
    }

    /// Send the change signal held back by `Push::Defer` mutations, if any.
    pub fn flush_notification(&mut self) -> bool {
        match (self.unsent_change.take(), self.incident) {
            (Some(at), Some(incident)) => {
                self.fanout.send(&ChangeSignal::new(self.node_id, incident, at));
                true
            }
            _ => false,
        }
    }

    fn changed(&mut self, at: Epoch, push: Push) {
        self.unsent_change = Some(at);
        if push == Push::Now {
            self.flush_notification();
        }
    }

    /// Apply `write` and the history notes in one transaction, then record
    /// the change for notification.
    fn commit<T>(
        &mut self,
        at: Epoch,
        push: Push,
        notes: Vec<Note>,
        write: impl FnOnce(&SqliteStore) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let hids: Vec<GlobalId> = if self.policy.authors_history() {
            notes
                .iter()
                .map(|_| self.policy.issue_id(EntityKind::History))
                .collect()
        } else {
            Vec::new()
        };
        let actor = &self.actor;
        let value = self.store.transaction(|store| {
            let value = write(store)?;
            let ledger = HistoryLedger::new(store);
            for (hid, note) in hids.iter().zip(notes) {
                ledger.append(*hid, note.aid, note.tid, note.description, actor, at)?;
            }
            Ok::<_, EngineError>(value)
        })?;
        self.changed(at, push);
        Ok(value)
    }
}

/// Store-level half of [`EntityLifecycle::replay_pairing`], usable inside a
/// merge transaction.
pub(crate) fn replay_pairing_into(store: &SqliteStore, row: &PairingRow) -> Result<RowKey, EngineError> {
    if !row.pid.is_confirmed() {
        return Err(EngineError::IdentityNotYetAssigned(format!("pairing {}", row.pid)));
    }
    Ok(store.insert_pairing(row).into_result("replay pairing")?)
}

fn unreachable_history<T>() -> Result<T, EngineError> {
    Err(EngineError::InvalidFinalize(
        "history rows are authored by the host and never finalized".into(),
    ))
}
