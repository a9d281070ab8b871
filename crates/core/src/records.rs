//! Row shapes shared by the store, the lifecycle and the wire.
//!
//! Every row carries the local key `n` of the node that produced it. `n` is
//! only meaningful on that node; receivers match rows by global id.

use serde::{Deserialize, Serialize};

use crate::epoch::Epoch;
use crate::ids::{EntityKind, GlobalId, RowKey};
use crate::status::{AssignmentStatus, PairingStatus, TeamStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamRow {
    pub n: RowKey,
    pub tid: GlobalId,
    pub name: String,
    pub status: TeamStatus,
    pub resource: String,
    pub medical: bool,
    pub last_edit_epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRow {
    pub n: RowKey,
    pub aid: GlobalId,
    pub name: String,
    pub status: AssignmentStatus,
    pub intended_resource: String,
    pub external_ref: Option<String>,
    pub last_edit_epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRow {
    pub n: RowKey,
    pub pid: GlobalId,
    pub aid: GlobalId,
    pub tid: GlobalId,
    pub status: PairingStatus,
    /// Team name captured when the pairing closed.
    pub name_save: Option<String>,
    /// Team resource captured when the pairing closed.
    pub resource_save: Option<String>,
    pub last_edit_epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub n: RowKey,
    pub hid: GlobalId,
    pub aid: Option<GlobalId>,
    pub tid: Option<GlobalId>,
    pub description: String,
    pub recorded_by: String,
    pub epoch: Epoch,
}

/// Tombstone of a hard-deleted team or assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Removal {
    pub kind: EntityKind,
    pub id: GlobalId,
    pub epoch: Epoch,
}

impl TeamRow {
    pub fn is_tentative(&self) -> bool {
        self.tid.is_tentative()
    }
}

impl AssignmentRow {
    pub fn is_tentative(&self) -> bool {
        self.aid.is_tentative()
    }
}

impl PairingRow {
    pub fn is_tentative(&self) -> bool {
        self.pid.is_tentative()
    }

    pub fn is_current(&self) -> bool {
        self.status == PairingStatus::Current
    }
}
