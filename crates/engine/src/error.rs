use tracker_core::{CoreError, EntityKind, GlobalId, NodeRole};
use tracker_storage::StorageError;
use thiserror::Error;

use crate::link::LinkError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Push or pull could not reach the host. Retried on the next trigger.
    #[error("host unreachable: {0}")]
    TransientNetwork(String),

    /// An update expected to touch one row touched several.
    #[error("{what} matched {matched} rows, expected one")]
    ValidationConflict { what: String, matched: usize },

    /// The referenced row is still tentative (global id -1).
    #[error("{0} has no host-assigned id yet")]
    IdentityNotYetAssigned(String),

    /// The host could not be reached during a mandatory liveness sync. The
    /// session is over; no further mutations are accepted.
    #[error("session terminated: {0}")]
    FatalSession(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{op} is not available on a {role} node")]
    RoleViolation { op: &'static str, role: NodeRole },

    #[error("team {tid} already has a current pairing with assignment {aid}")]
    DuplicatePairing { aid: GlobalId, tid: GlobalId },

    #[error("pairing {0} is already closed")]
    PairingAlreadyClosed(GlobalId),

    #[error("{0} rows are permanent")]
    Permanent(EntityKind),

    #[error("invalid finalization: {0}")]
    InvalidFinalize(String),

    #[error("rejected by host: {0}")]
    Rejected(String),
}

impl EngineError {
    /// Errors that describe the request itself rather than the state of the
    /// host. The host answers these with a rejection instead of failing the
    /// call, and a client must not resend the request.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::Core(_)
                | EngineError::ValidationConflict { .. }
                | EngineError::IdentityNotYetAssigned(_)
                | EngineError::NotFound(_)
                | EngineError::RoleViolation { .. }
                | EngineError::DuplicatePairing { .. }
                | EngineError::PairingAlreadyClosed(_)
                | EngineError::Permanent(_)
                | EngineError::InvalidFinalize(_)
                | EngineError::Rejected(_)
        )
    }
}

impl From<LinkError> for EngineError {
    fn from(e: LinkError) -> Self {
        EngineError::TransientNetwork(e.to_string())
    }
}
