use std::sync::Arc;

use tracker_core::{AssignmentRow, GlobalId, PairingRow, TeamRow};
use tracker_engine::{EngineError, HostLink, Replica};

use crate::network::{PROBE_TIMEOUT, client_lifecycle};
use crate::state_digest;

pub struct TestPeer {
    pub replica: Replica,
}

impl TestPeer {
    pub fn connect(actor: &str, candidates: Vec<Arc<dyn HostLink>>) -> Result<Self, EngineError> {
        let replica = Replica::connect(client_lifecycle(actor)?, candidates, PROBE_TIMEOUT)?;
        Ok(Self { replica })
    }

    pub fn digest(&self) -> Result<blake3::Hash, EngineError> {
        state_digest(self.replica.lifecycle())
    }

    pub fn into_replica(self) -> Replica {
        self.replica
    }

    // Create, deliver, and return the row as it stands after the host's
    // answer. Fails if the request is still queued.

    pub fn confirmed_team(&mut self, name: &str, resource: &str) -> Result<TeamRow, EngineError> {
        let row = self.replica.create_team(name, resource)?;
        self.replica.flush()?;
        self.replica
            .lifecycle()
            .team_at(row.n)?
            .filter(|team| team.tid.is_confirmed())
            .ok_or_else(|| EngineError::NotFound(format!("confirmed team {name}")))
    }

    pub fn confirmed_assignment(
        &mut self,
        name: &str,
        intended_resource: &str,
    ) -> Result<AssignmentRow, EngineError> {
        let row = self.replica.create_assignment(name, intended_resource)?;
        self.replica.flush()?;
        self.replica
            .lifecycle()
            .assignment_at(row.n)?
            .filter(|assignment| assignment.aid.is_confirmed())
            .ok_or_else(|| EngineError::NotFound(format!("confirmed assignment {name}")))
    }

    pub fn confirmed_pairing(
        &mut self,
        aid: GlobalId,
        tid: GlobalId,
    ) -> Result<PairingRow, EngineError> {
        let row = self.replica.create_pairing(aid, tid)?;
        self.replica.flush()?;
        self.replica
            .lifecycle()
            .pairing_at(row.n)?
            .filter(|pairing| pairing.pid.is_confirmed())
            .ok_or_else(|| EngineError::NotFound(format!("confirmed pairing {aid}/{tid}")))
    }
}
