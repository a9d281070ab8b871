use std::collections::BTreeMap;

use crate::ids::{EntityKind, GlobalId};

/// Host-side issuer of global ids. Each entity class has its own counter,
/// seeded at 1 and only ever moving forward until `reset` starts a new
/// incident.
#[derive(Debug, Clone)]
pub struct IdentityAllocator {
    next: BTreeMap<EntityKind, i64>,
}

impl Default for IdentityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityAllocator {
    pub fn new() -> Self {
        let next = EntityKind::ALL.iter().map(|kind| (*kind, 1)).collect();
        Self { next }
    }

    /// Seed counters past the highest id already persisted, so a restarted
    /// host continues the running incident without reissuing ids.
    pub fn resume(highest: impl IntoIterator<Item = (EntityKind, GlobalId)>) -> Self {
        let mut allocator = Self::new();
        for (kind, id) in highest {
            let slot = allocator.next.entry(kind).or_insert(1);
            if id.get() + 1 > *slot {
                *slot = id.get() + 1;
            }
        }
        allocator
    }

    pub fn allocate(&mut self, kind: EntityKind) -> GlobalId {
        let slot = self.next.entry(kind).or_insert(1);
        let id = GlobalId::new(*slot);
        *slot += 1;
        id
    }

    /// The id the next `allocate(kind)` call will return.
    pub fn peek(&self, kind: EntityKind) -> GlobalId {
        GlobalId::new(self.next.get(&kind).copied().unwrap_or(1))
    }

    /// Start a new incident. Only valid together with truncating every table.
    pub fn reset(&mut self) {
        for slot in self.next.values_mut() {
            *slot = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_per_class_and_start_at_one() {
        let mut alloc = IdentityAllocator::new();
        assert_eq!(alloc.allocate(EntityKind::Team), GlobalId::new(1));
        assert_eq!(alloc.allocate(EntityKind::Team), GlobalId::new(2));
        assert_eq!(alloc.allocate(EntityKind::Assignment), GlobalId::new(1));
        assert_eq!(alloc.allocate(EntityKind::Pairing), GlobalId::new(1));
        assert_eq!(alloc.peek(EntityKind::Team), GlobalId::new(3));
    }

    #[test]
    fn resume_never_reissues() {
        let mut alloc = IdentityAllocator::resume([
            (EntityKind::Team, GlobalId::new(7)),
            (EntityKind::History, GlobalId::new(12)),
        ]);
        assert_eq!(alloc.allocate(EntityKind::Team), GlobalId::new(8));
        assert_eq!(alloc.allocate(EntityKind::History), GlobalId::new(13));
        assert_eq!(alloc.allocate(EntityKind::Assignment), GlobalId::new(1));
    }

    #[test]
    fn resume_ignores_tentative_maxima() {
        let mut alloc = IdentityAllocator::resume([(EntityKind::Team, GlobalId::TENTATIVE)]);
        assert_eq!(alloc.allocate(EntityKind::Team), GlobalId::new(1));
    }

    #[test]
    fn reset_restarts_every_class() {
        let mut alloc = IdentityAllocator::new();
        alloc.allocate(EntityKind::Team);
        alloc.allocate(EntityKind::Pairing);
        alloc.reset();
        assert_eq!(alloc.allocate(EntityKind::Team), GlobalId::new(1));
        assert_eq!(alloc.allocate(EntityKind::Pairing), GlobalId::new(1));
    }
}
