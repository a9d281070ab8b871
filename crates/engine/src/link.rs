use std::time::Duration;

use thiserror::Error;
use tracker_core::{
    CoreError,
    wire::{Envelope, HostResponse},
};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("no answer within {0:?}")]
    Timeout(Duration),

    #[error("host failed to process the request: {0}")]
    HostFault(String),

    #[error("codec error: {0}")]
    Codec(#[from] CoreError),
}

/// A replica's connection to one candidate host. Every failure is transient
/// from the replica's point of view; the host answers bad requests with
/// [`HostResponse::Rejected`] rather than an error.
///
/// A call that fails may still have been applied by the host. Resending the
/// same envelope is safe.
pub trait HostLink: Send + Sync {
    fn call(&self, envelope: Envelope) -> Result<HostResponse, LinkError>;

    /// Cheap reachability check bounded by `timeout`.
    fn probe(&self, timeout: Duration) -> Result<(), LinkError>;

    /// Human-readable address, for logs.
    fn describe(&self) -> String;
}
