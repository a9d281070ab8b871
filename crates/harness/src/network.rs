use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;

use tracker_core::wire::ChangeSignal;
use tracker_engine::{EngineError, EntityLifecycle, Host, HostLink};
use tracker_storage::SqliteStore;

use crate::{LoopbackLink, TestPeer, state_digest};

pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1_000);

/// One host and any number of replicas connected through loopback links that
/// share a single on/off switch.
pub struct TestNetwork {
    host: Arc<Mutex<Host>>,
    online: Arc<AtomicBool>,
    links: usize,
    // Keeps the on-disk host database alive.
    _dir: Option<TempDir>,
}

impl TestNetwork {
    pub fn new() -> Result<Self, EngineError> {
        let host = Host::new(SqliteStore::open_in_memory()?, "base", 64)?;
        Ok(Self::with_host(host, None))
    }

    /// Host backed by a database file in a temporary directory.
    pub fn on_disk() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = SqliteStore::open(dir.path().join("host.db"))?;
        let host = Host::new(store, "base", 64)?;
        Ok(Self::with_host(host, Some(dir)))
    }

    fn with_host(host: Host, dir: Option<TempDir>) -> Self {
        Self {
            host: Arc::new(Mutex::new(host)),
            online: Arc::new(AtomicBool::new(true)),
            links: 0,
            _dir: dir,
        }
    }

    pub fn host(&self) -> MutexGuard<'_, Host> {
        match self.host.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn shared_host(&self) -> Arc<Mutex<Host>> {
        self.host.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSignal> {
        self.host().subscribe()
    }

    pub fn link(&mut self) -> Arc<LoopbackLink> {
        self.links += 1;
        Arc::new(LoopbackLink::new(
            format!("client-{}", self.links),
            self.host.clone(),
            self.online.clone(),
        ))
    }

    /// A link that never answers, for host selection tests.
    pub fn dead_link(&self, name: &str) -> Arc<LoopbackLink> {
        Arc::new(LoopbackLink::new(
            name,
            self.host.clone(),
            Arc::new(AtomicBool::new(false)),
        ))
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, std::sync::atomic::Ordering::SeqCst);
    }

    /// Connect a fresh in-memory replica. Fails if the host is offline.
    pub fn add_peer(&mut self, actor: &str) -> Result<TestPeer, EngineError> {
        let link: Arc<dyn HostLink> = self.link();
        TestPeer::connect(actor, vec![link])
    }

    pub fn host_digest(&self) -> Result<blake3::Hash, EngineError> {
        state_digest(self.host().lifecycle())
    }
}

pub(crate) fn client_lifecycle(actor: &str) -> Result<EntityLifecycle, EngineError> {
    Ok(EntityLifecycle::client(SqliteStore::open_in_memory()?, actor))
}
