use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tracker_core::{
    Epoch, NodeRole, RequestId,
    wire::{ChangeSignal, Envelope, HostRequest, HostResponse, SyncDelta},
};
use tracker_storage::{SqliteStore, Store};

use crate::config::TrackerConfig;
use crate::error::EngineError;
use crate::fanout::BroadcastFanout;
use crate::lifecycle::{EntityLifecycle, Push};

/// Answers kept for resent requests.
const ANSWERED_CAPACITY: usize = 1024;

/// Recent answers by request id, oldest evicted first.
#[derive(Debug, Default)]
struct Answered {
    answers: HashMap<RequestId, HostResponse>,
    order: VecDeque<RequestId>,
}

impl Answered {
    fn get(&self, id: &RequestId) -> Option<&HostResponse> {
        self.answers.get(id)
    }

    fn remember(&mut self, id: RequestId, response: HostResponse) {
        if self.answers.insert(id, response).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > ANSWERED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.answers.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.answers.clear();
        self.order.clear();
    }
}

/// The reference node. Answers replica requests on top of a host
/// [`EntityLifecycle`] and broadcasts a change signal after each mutation.
pub struct Host {
    lifecycle: EntityLifecycle,
    fanout: BroadcastFanout,
    answered: Answered,
}

impl Host {
    pub fn new(
        store: SqliteStore,
        actor: impl Into<String>,
        notification_capacity: usize,
    ) -> Result<Self, EngineError> {
        let fanout = BroadcastFanout::new(notification_capacity);
        let lifecycle = EntityLifecycle::host(store, actor, Arc::new(fanout.clone()))?;
        info!(
            node = %lifecycle.node_id(),
            actor = lifecycle.actor(),
            incident = ?lifecycle.incident(),
            "host started"
        );
        Ok(Self { lifecycle, fanout, answered: Answered::default() })
    }

    pub fn from_config(config: &TrackerConfig) -> Result<Self, EngineError> {
        if config.role != NodeRole::Host {
            return Err(EngineError::RoleViolation { op: "host", role: config.role });
        }
        let store = config.open_store()?;
        Self::new(store, config.actor.clone(), config.sync.notification_capacity)
    }

    pub fn lifecycle(&self) -> &EntityLifecycle {
        &self.lifecycle
    }

    /// Direct access for operators working at the host itself.
    pub fn lifecycle_mut(&mut self) -> &mut EntityLifecycle {
        &mut self.lifecycle
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSignal> {
        self.fanout.subscribe()
    }

    pub fn fanout(&self) -> &BroadcastFanout {
        &self.fanout
    }

    /// Entry point for replicas. On top of [`Self::handle`]:
    ///
    /// - a resent envelope gets the answer already given, without applying
    ///   the request again;
    /// - a mutation from another incident is refused;
    /// - errors that describe the request become [`HostResponse::Rejected`]
    ///   so the caller knows not to resend.
    pub fn serve(&mut self, envelope: Envelope) -> Result<HostResponse, EngineError> {
        let op = envelope.op_name();
        if let Some(response) = self.answered.get(&envelope.request_id) {
            debug!(op, request = %envelope.request_id, "repeated request, answer resent");
            return Ok(response.clone());
        }
        let is_pull = matches!(envelope.request, HostRequest::PullSince { .. });

        let response = match (envelope.incident, self.lifecycle.incident()) {
            (Some(theirs), Some(ours)) if theirs != ours && !is_pull => {
                warn!(op, %theirs, %ours, "request from another incident rejected");
                HostResponse::Rejected {
                    reason: format!("request belongs to incident {theirs}, host is on {ours}"),
                }
            }
            _ => match self.handle(envelope.request) {
                Ok(response) => response,
                Err(e) if e.is_rejection() => {
                    warn!(op, error = %e, "request rejected");
                    HostResponse::Rejected { reason: e.to_string() }
                }
                Err(e) => return Err(e),
            },
        };
        if !is_pull {
            self.answered.remember(envelope.request_id, response.clone());
        }
        Ok(response)
    }

    pub fn handle(&mut self, request: HostRequest) -> Result<HostResponse, EngineError> {
        debug!(op = request.op_name(), "host request");
        let lifecycle = &mut self.lifecycle;
        let response = match request {
            HostRequest::CreateTeam { name, resource } => {
                HostResponse::Team(lifecycle.create_team(&name, &resource)?)
            }
            HostRequest::CreateAssignment { name, intended_resource } => {
                HostResponse::Assignment(lifecycle.create_assignment(&name, &intended_resource)?)
            }
            HostRequest::CreatePairing { aid, tid } => {
                HostResponse::Pairing(lifecycle.create_pairing(aid, tid)?)
            }
            HostRequest::ClosePairing { pid } => {
                HostResponse::Pairing(lifecycle.close_pairing(pid)?)
            }
            HostRequest::SetStatus { target, status, push } => HostResponse::Ack {
                epoch: lifecycle.set_status(target, status, Push::from_flag(push))?,
            },
            HostRequest::SetResource { tid, value } => HostResponse::Ack {
                epoch: lifecycle.set_resource(tid, &value)?,
            },
            HostRequest::SetMedical { tid, value } => HostResponse::Ack {
                epoch: lifecycle.set_medical(tid, value)?,
            },
            HostRequest::SetIntendedResource { aid, value } => HostResponse::Ack {
                epoch: lifecycle.set_intended_resource(aid, &value)?,
            },
            HostRequest::SetExternalRef { aid, value } => HostResponse::Ack {
                epoch: lifecycle.set_external_ref(aid, value.as_deref())?,
            },
            HostRequest::Delete { target } => HostResponse::Ack {
                epoch: lifecycle.delete(target)?,
            },
            HostRequest::PullSince { since } => HostResponse::Delta(self.pull_since(since)?),
        };
        Ok(response)
    }

    /// Every row edited after `since`, stamped with a fresh host epoch.
    ///
    /// The timestamp is taken before reading, so each existing row is at or
    /// below it and any later edit lands strictly above it.
    pub fn pull_since(&mut self, since: Epoch) -> Result<SyncDelta, EngineError> {
        let timestamp = self.lifecycle.tick()?;
        let store = self.lifecycle.store();
        let delta = SyncDelta {
            incident: self.lifecycle.incident(),
            teams: store.teams_since(since).into_result("teams since")?,
            assignments: store.assignments_since(since).into_result("assignments since")?,
            pairings: store.pairings_since(since).into_result("pairings since")?,
            history: self.lifecycle.history().since(since)?,
            removals: store.removals_since(since).into_result("removals since")?,
            timestamp,
        };
        debug!(%since, %timestamp, rows = delta.row_count(), "delta served");
        Ok(delta)
    }

    /// Truncate everything, restart id counters and switch to a new incident
    /// id. Replicas notice the new id on their next pull and start over.
    pub fn new_incident(&mut self) -> Result<(), EngineError> {
        self.answered.clear();
        self.lifecycle.reset_incident()
    }
}
