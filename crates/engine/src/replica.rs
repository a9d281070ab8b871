use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use tracker_core::{
    AssignmentRow, EntityKind, Epoch, GlobalId, NodeRole, PairingRow, RowKey, StatusChange,
    StatusCommand, Target, TeamRow, wire::HostRequest,
};

use crate::config::TrackerConfig;
use crate::error::EngineError;
use crate::lifecycle::{EntityLifecycle, Push};
use crate::link::HostLink;
use crate::outbox::{FlushReport, Outbox};
use crate::sync::{PullReport, SyncEngine, starts_new_incident};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Host chosen, liveness sync not yet completed.
    Connecting,
    Live,
    /// The mandatory liveness sync failed. Nothing more is accepted.
    Terminated,
}

/// A client node: local lifecycle, watermark sync and the outbox of requests
/// waiting for the host.
///
/// Every mutation is applied locally and queued; it never waits for the
/// host. Delivery happens in [`Replica::flush`], [`Replica::sync_now`] or,
/// under a [`crate::PullScheduler`], in [`Replica::sync_shared`], which
/// releases the replica while talking to the host. A transport failure
/// leaves the request queued and the local change in place.
pub struct Replica {
    lifecycle: EntityLifecycle,
    sync: SyncEngine,
    outbox: Outbox,
    link: Arc<dyn HostLink>,
    state: SessionState,
    flush_trigger: Option<Arc<Notify>>,
}

impl Replica {
    /// Wrap a client lifecycle. Tentative rows left in its store by an
    /// earlier process have no queued request any more and are dropped.
    pub fn new(mut lifecycle: EntityLifecycle, link: Arc<dyn HostLink>) -> Result<Self, EngineError> {
        if lifecycle.role() != NodeRole::Client {
            return Err(EngineError::RoleViolation { op: "replica", role: lifecycle.role() });
        }
        lifecycle.recover()?;
        Ok(Self {
            lifecycle,
            sync: SyncEngine::new(),
            outbox: Outbox::new(),
            link,
            state: SessionState::Connecting,
            flush_trigger: None,
        })
    }

    /// Probe `candidates` in order, keep the first that answers within
    /// `probe_timeout`, and run the liveness sync against it.
    pub fn connect(
        lifecycle: EntityLifecycle,
        candidates: Vec<Arc<dyn HostLink>>,
        probe_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let mut last_failure = String::from("no host candidates");
        for link in candidates {
            match link.probe(probe_timeout) {
                Ok(()) => {
                    info!(host = %link.describe(), "host selected");
                    let mut replica = Self::new(lifecycle, link)?;
                    replica.liveness_check()?;
                    return Ok(replica);
                }
                Err(e) => {
                    warn!(host = %link.describe(), error = %e, "host probe failed");
                    last_failure = format!("{}: {e}", link.describe());
                }
            }
        }
        error!(reason = %last_failure, "no reachable host");
        Err(EngineError::FatalSession(last_failure))
    }

    pub fn from_config(
        config: &TrackerConfig,
        candidates: Vec<Arc<dyn HostLink>>,
    ) -> Result<Self, EngineError> {
        if config.role != NodeRole::Client {
            return Err(EngineError::RoleViolation { op: "replica", role: config.role });
        }
        let lifecycle = EntityLifecycle::client(config.open_store()?, config.actor.clone());
        Self::connect(lifecycle, candidates, config.probe_timeout())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == SessionState::Live
    }

    pub fn lifecycle(&self) -> &EntityLifecycle {
        &self.lifecycle
    }

    pub fn watermark(&self) -> Epoch {
        self.sync.watermark()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn host(&self) -> String {
        self.link.describe()
    }

    /// Wake `trigger` whenever a request is queued.
    pub fn attach_trigger(&mut self, trigger: Arc<Notify>) {
        self.flush_trigger = Some(trigger);
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// The mandatory sync with the selected host. A transport failure here
    /// ends the session.
    pub fn liveness_check(&mut self) -> Result<PullReport, EngineError> {
        if self.state == SessionState::Terminated {
            return Err(self.terminated());
        }
        match self.pull_unchecked() {
            Ok(report) => {
                if self.state != SessionState::Live {
                    info!(host = %self.link.describe(), watermark = %report.watermark, "session live");
                }
                self.state = SessionState::Live;
                Ok(report)
            }
            Err(EngineError::TransientNetwork(reason)) => {
                error!(host = %self.link.describe(), %reason, "liveness sync failed, session terminated");
                self.state = SessionState::Terminated;
                Err(EngineError::FatalSession(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Routine pull. A failure leaves the watermark untouched.
    pub fn pull(&mut self) -> Result<PullReport, EngineError> {
        self.ensure_live()?;
        self.pull_unchecked()
    }

    fn pull_unchecked(&mut self) -> Result<PullReport, EngineError> {
        let report = self.sync.pull(self.link.as_ref(), &mut self.lifecycle)?;
        self.after_pull(&report);
        Ok(report)
    }

    /// Queued requests were made against rows that no longer exist once the
    /// host has moved to a new incident.
    fn after_pull(&mut self, report: &PullReport) {
        if report.incident_reset && !self.outbox.is_empty() {
            warn!(dropped = self.outbox.len(), "queued requests of the previous incident dropped");
            self.outbox.clear();
        }
    }

    pub fn flush(&mut self) -> Result<FlushReport, EngineError> {
        self.ensure_live()?;
        self.outbox.flush(self.link.as_ref(), &mut self.lifecycle)
    }

    /// Flush what can be flushed, then pull.
    pub fn sync_now(&mut self) -> Result<PullReport, EngineError> {
        self.try_flush()?;
        self.pull()
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        match self.state {
            SessionState::Live => Ok(()),
            SessionState::Connecting => Err(EngineError::FatalSession(
                "liveness sync has not completed".into(),
            )),
            SessionState::Terminated => Err(self.terminated()),
        }
    }

    fn terminated(&self) -> EngineError {
        EngineError::FatalSession(format!("session with {} was terminated", self.link.describe()))
    }

    fn try_flush(&mut self) -> Result<(), EngineError> {
        match self.flush() {
            Ok(report) => {
                debug!(pending = report.pending, "outbox drained");
                Ok(())
            }
            Err(EngineError::TransientNetwork(reason)) => {
                debug!(%reason, pending = self.outbox.len(), "outbox flush deferred");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Queue `request` and wake the flusher, if one is attached. Never
    /// touches the network.
    fn submit(&mut self, request: HostRequest, finalize: Option<(EntityKind, RowKey)>) {
        self.outbox.push(request, finalize, self.lifecycle.incident());
        if let Some(trigger) = &self.flush_trigger {
            trigger.notify_one();
        }
    }

    // ========================================================================
    // Shared session
    // ========================================================================

    /// [`Self::sync_now`] for a replica shared with the interactive path. The
    /// lock is held only while local state is read or written, never across
    /// a host call, so mutations made meanwhile do not wait on the network.
    pub fn sync_shared(shared: &Mutex<Replica>) -> Result<PullReport, EngineError> {
        Self::flush_shared(shared)?;
        Self::pull_shared(shared)
    }

    fn lock(shared: &Mutex<Replica>) -> Result<MutexGuard<'_, Replica>, EngineError> {
        shared
            .lock()
            .map_err(|_| EngineError::FatalSession("replica lock poisoned".into()))
    }

    fn flush_shared(shared: &Mutex<Replica>) -> Result<(), EngineError> {
        let mut report = FlushReport::default();
        loop {
            let (link, sent) = {
                let mut replica = Self::lock(shared)?;
                replica.ensure_live()?;
                match replica.outbox.begin_attempt() {
                    Some(sent) => (replica.link.clone(), sent),
                    None => break,
                }
            };
            let response = match link.call(sent.envelope()) {
                Ok(response) => response,
                Err(e) => {
                    debug!(
                        op = sent.request.op_name(),
                        attempts = sent.attempts,
                        error = %e,
                        "outbox flush deferred"
                    );
                    break;
                }
            };
            let mut replica = Self::lock(shared)?;
            let replica = &mut *replica;
            replica
                .outbox
                .complete(&sent, response, &mut replica.lifecycle, &mut report)?;
        }
        report.log();
        Ok(())
    }

    fn pull_shared(shared: &Mutex<Replica>) -> Result<PullReport, EngineError> {
        let (link, since, incident) = {
            let replica = Self::lock(shared)?;
            replica.ensure_live()?;
            (replica.link.clone(), replica.sync.watermark(), replica.lifecycle.incident())
        };
        let mut delta = SyncEngine::fetch(link.as_ref(), since, incident)?;
        let refetch = {
            let replica = Self::lock(shared)?;
            since > Epoch::ZERO && starts_new_incident(&replica.lifecycle, &delta)
        };
        if refetch {
            delta = SyncEngine::fetch(link.as_ref(), Epoch::ZERO, incident)?;
        }

        let mut replica = Self::lock(shared)?;
        if replica.sync.watermark() != since {
            // Another pull finished while this one was in flight; its delta
            // is at least as recent as this one.
            debug!(%since, watermark = %replica.sync.watermark(), "delta superseded, dropped");
            return Ok(PullReport {
                since,
                watermark: replica.sync.watermark(),
                ..PullReport::default()
            });
        }
        let replica = &mut *replica;
        let report = replica.sync.apply(&mut replica.lifecycle, delta)?;
        replica.after_pull(&report);
        Ok(report)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Returns the tentative row; it adopts the host's id once the queued
    /// request is delivered.
    pub fn create_team(&mut self, name: &str, resource: &str) -> Result<TeamRow, EngineError> {
        self.ensure_live()?;
        let row = self.lifecycle.create_team(name, resource)?;
        self.submit(
            HostRequest::CreateTeam { name: name.into(), resource: resource.into() },
            Some((EntityKind::Team, row.n)),
        );
        Ok(row)
    }

    pub fn create_assignment(
        &mut self,
        name: &str,
        intended_resource: &str,
    ) -> Result<AssignmentRow, EngineError> {
        self.ensure_live()?;
        let row = self.lifecycle.create_assignment(name, intended_resource)?;
        self.submit(
            HostRequest::CreateAssignment {
                name: name.into(),
                intended_resource: intended_resource.into(),
            },
            Some((EntityKind::Assignment, row.n)),
        );
        Ok(row)
    }

    pub fn create_pairing(&mut self, aid: GlobalId, tid: GlobalId) -> Result<PairingRow, EngineError> {
        self.ensure_live()?;
        let row = self.lifecycle.create_pairing(aid, tid)?;
        self.submit(
            HostRequest::CreatePairing { aid, tid },
            Some((EntityKind::Pairing, row.n)),
        );
        Ok(row)
    }

    pub fn close_pairing(&mut self, pid: GlobalId) -> Result<PairingRow, EngineError> {
        self.ensure_live()?;
        let row = self.lifecycle.close_pairing(pid)?;
        self.submit(HostRequest::ClosePairing { pid }, None);
        Ok(row)
    }

    pub fn set_status(
        &mut self,
        target: Target,
        status: StatusChange,
        push: Push,
    ) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.lifecycle.set_status(target, status, push)?;
        self.submit(
            HostRequest::SetStatus { target, status, push: push.as_flag() },
            None,
        );
        Ok(())
    }

    pub fn set_resource(&mut self, tid: GlobalId, value: &str) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.lifecycle.set_resource(tid, value)?;
        self.submit(HostRequest::SetResource { tid, value: value.into() }, None);
        Ok(())
    }

    pub fn set_medical(&mut self, tid: GlobalId, value: bool) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.lifecycle.set_medical(tid, value)?;
        self.submit(HostRequest::SetMedical { tid, value }, None);
        Ok(())
    }

    pub fn set_intended_resource(&mut self, aid: GlobalId, value: &str) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.lifecycle.set_intended_resource(aid, value)?;
        self.submit(HostRequest::SetIntendedResource { aid, value: value.into() }, None);
        Ok(())
    }

    pub fn set_external_ref(&mut self, aid: GlobalId, value: Option<&str>) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.lifecycle.set_external_ref(aid, value)?;
        self.submit(
            HostRequest::SetExternalRef { aid, value: value.map(str::to_string) },
            None,
        );
        Ok(())
    }

    pub fn delete(&mut self, target: Target) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.lifecycle.delete(target)?;
        self.submit(HostRequest::Delete { target }, None);
        Ok(())
    }

    /// Status-menu command. `Done` closes each CURRENT pairing of the target.
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
                self.ensure_live()?;
                let open = self.lifecycle.current_pairings(target)?;
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
}
