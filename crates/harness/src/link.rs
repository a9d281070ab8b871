use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;

use tracker_core::wire::{Envelope, HostResponse};
use tracker_engine::{Host, HostLink, LinkError};

/// In-process link to a shared [`Host`]. Requests and responses go through
/// the MessagePack codec so tests exercise the wire format, and the link can
/// be taken offline to simulate a lost connection.
pub struct LoopbackLink {
    name: String,
    host: Arc<Mutex<Host>>,
    online: Arc<AtomicBool>,
}

impl LoopbackLink {
    pub fn new(name: impl Into<String>, host: Arc<Mutex<Host>>, online: Arc<AtomicBool>) -> Self {
        Self { name: name.into(), host, online }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl HostLink for LoopbackLink {
    fn call(&self, envelope: Envelope) -> Result<HostResponse, LinkError> {
        if !self.is_online() {
            return Err(LinkError::Unreachable(self.name.clone()));
        }
        let bytes = envelope.to_msgpack()?;
        let envelope = Envelope::from_msgpack(&bytes)?;
        trace!(link = %self.name, op = envelope.op_name(), bytes = bytes.len(), "loopback call");

        let response = {
            let mut host = self
                .host
                .lock()
                .map_err(|_| LinkError::HostFault("host lock poisoned".into()))?;
            host.serve(envelope)
                .map_err(|e| LinkError::HostFault(e.to_string()))?
        };
        Ok(HostResponse::from_msgpack(&response.to_msgpack()?)?)
    }

    fn probe(&self, timeout: Duration) -> Result<(), LinkError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(LinkError::Timeout(timeout))
        }
    }

    fn describe(&self) -> String {
        format!("loopback:{}", self.name)
    }
}
