pub mod allocator;
pub mod epoch;
pub mod error;
pub mod ids;
pub mod records;
pub mod role;
pub mod status;
pub mod wire;

pub use allocator::IdentityAllocator;
pub use epoch::{EditClock, Epoch};
pub use error::CoreError;
pub use ids::*;
pub use records::*;
pub use role::NodeRole;
pub use status::*;
