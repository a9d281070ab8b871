pub mod config;
pub mod error;
pub mod fanout;
pub mod history;
pub mod host;
pub mod lifecycle;
pub mod link;
pub mod outbox;
pub mod replica;
pub mod role;
pub mod scheduler;
pub mod sync;
pub mod telemetry;

pub use config::{ConfigError, SyncConfig, TrackerConfig};
pub use error::EngineError;
pub use fanout::{BroadcastFanout, NotificationFanout, NullFanout};
pub use history::HistoryLedger;
pub use host::Host;
pub use lifecycle::{EntityLifecycle, Push};
pub use link::{HostLink, LinkError};
pub use outbox::{FlushReport, Outbox, PendingRequest};
pub use replica::{Replica, SessionState};
pub use role::{ClientPolicy, HostPolicy, RolePolicy};
pub use scheduler::PullScheduler;
pub use sync::{PullReport, SyncEngine};
