//! Messages exchanged between replicas and the host, and the change signal
//! carried by the notification channel.

use serde::{Deserialize, Serialize};

use crate::epoch::Epoch;
use crate::error::CoreError;
use crate::ids::{GlobalId, IncidentId, NodeId, RequestId, SignalId, Target};
use crate::records::{AssignmentRow, HistoryRow, PairingRow, Removal, TeamRow};
use crate::status::StatusChange;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostRequest {
    CreateTeam {
        name: String,
        resource: String,
    },
    CreateAssignment {
        name: String,
        intended_resource: String,
    },
    CreatePairing {
        aid: GlobalId,
        tid: GlobalId,
    },
    ClosePairing {
        pid: GlobalId,
    },
    SetStatus {
        target: Target,
        status: StatusChange,
        push: bool,
    },
    SetResource {
        tid: GlobalId,
        value: String,
    },
    SetMedical {
        tid: GlobalId,
        value: bool,
    },
    SetIntendedResource {
        aid: GlobalId,
        value: String,
    },
    SetExternalRef {
        aid: GlobalId,
        value: Option<String>,
    },
    Delete {
        target: Target,
    },
    PullSince {
        since: Epoch,
    },
}

impl HostRequest {
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::CreateTeam { .. } => "create-team",
            Self::CreateAssignment { .. } => "create-assignment",
            Self::CreatePairing { .. } => "create-pairing",
            Self::ClosePairing { .. } => "close-pairing",
            Self::SetStatus { .. } => "set-status",
            Self::SetResource { .. } => "set-resource",
            Self::SetMedical { .. } => "set-medical",
            Self::SetIntendedResource { .. } => "set-intended-resource",
            Self::SetExternalRef { .. } => "set-external-ref",
            Self::Delete { .. } => "delete",
            Self::PullSince { .. } => "pull-since",
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// One request as it travels to the host.
///
/// `request_id` is fixed when the request is queued, so a resend after a lost
/// answer is recognised by the host. `incident` names the incident the sender
/// was working in; `None` until the sender has synced once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: RequestId,
    pub incident: Option<IncidentId>,
    pub request: HostRequest,
}

impl Envelope {
    pub fn new(request: HostRequest) -> Self {
        Self { request_id: RequestId::new(), incident: None, request }
    }

    pub fn in_incident(mut self, incident: Option<IncidentId>) -> Self {
        self.incident = incident;
        self
    }

    pub fn op_name(&self) -> &'static str {
        self.request.op_name()
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostResponse {
    Team(TeamRow),
    Assignment(AssignmentRow),
    Pairing(PairingRow),
    /// Mutation applied; carries the host epoch it was stamped with.
    Ack { epoch: Epoch },
    Delta(SyncDelta),
    /// The host refused the request. Retrying the same request cannot help.
    Rejected { reason: String },
}

impl HostResponse {
    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// Everything the host changed after `since`, plus the host timestamp the
/// receiver should adopt as its new watermark once the delta is applied.
///
/// A host always fills `incident`. A receiver holding rows of another
/// incident must drop them before merging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDelta {
    pub incident: Option<IncidentId>,
    pub teams: Vec<TeamRow>,
    pub assignments: Vec<AssignmentRow>,
    pub pairings: Vec<PairingRow>,
    pub history: Vec<HistoryRow>,
    pub removals: Vec<Removal>,
    pub timestamp: Epoch,
}

impl SyncDelta {
    pub fn row_count(&self) -> usize {
        self.teams.len()
            + self.assignments.len()
            + self.pairings.len()
            + self.history.len()
            + self.removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }
}

/// "Something changed on the host." Purely a hint to pull early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSignal {
    pub signal_id: SignalId,
    pub origin: NodeId,
    pub incident: IncidentId,
    pub epoch: Epoch,
}

impl ChangeSignal {
    pub fn new(origin: NodeId, incident: IncidentId, epoch: Epoch) -> Self {
        Self {
            signal_id: SignalId::new(),
            origin,
            incident,
            epoch,
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
