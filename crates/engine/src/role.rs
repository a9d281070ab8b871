use tracker_core::{EntityKind, GlobalId, IdentityAllocator, NodeRole};

/// Role-specific behaviour of an [`EntityLifecycle`](crate::EntityLifecycle).
pub trait RolePolicy: Send {
    fn role(&self) -> NodeRole;

    /// Global id for a row created on this node.
    fn issue_id(&mut self, kind: EntityKind) -> GlobalId;

    /// Whether mutations on this node append to the history ledger.
    fn authors_history(&self) -> bool;

    /// Forget all issued ids. Called when a new incident truncates the store.
    fn reset(&mut self);
}

/// The host allocates durable ids and is the only author of history.
pub struct HostPolicy {
    allocator: IdentityAllocator,
}

impl HostPolicy {
    pub fn new(allocator: IdentityAllocator) -> Self {
        Self { allocator }
    }

    pub fn allocator(&self) -> &IdentityAllocator {
        &self.allocator
    }
}

impl RolePolicy for HostPolicy {
    fn role(&self) -> NodeRole {
        NodeRole::Host
    }

    fn issue_id(&mut self, kind: EntityKind) -> GlobalId {
        self.allocator.allocate(kind)
    }

    fn authors_history(&self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.allocator.reset();
    }
}

/// Clients create tentative rows and only replicate history.
#[derive(Debug, Default)]
pub struct ClientPolicy;

impl RolePolicy for ClientPolicy {
    fn role(&self) -> NodeRole {
        NodeRole::Client
    }

    fn issue_id(&mut self, _kind: EntityKind) -> GlobalId {
        GlobalId::TENTATIVE
    }

    fn authors_history(&self) -> bool {
        false
    }

    fn reset(&mut self) {}
}
