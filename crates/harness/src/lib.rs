//! In-process host and replicas for integration tests.

mod digest;
mod link;
mod network;
mod peer;

pub use digest::state_digest;
pub use link::LoopbackLink;
pub use network::{PROBE_TIMEOUT, TestNetwork};
pub use peer::TestPeer;
