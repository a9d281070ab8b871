use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(NodeId);
uuid_id!(SignalId);
// Drawn by the host each time a new incident starts.
uuid_id!(IncidentId);
// Stable across retries of one queued request.
uuid_id!(RequestId);

/// Host-allocated identifier of a row within one entity class (`tid`, `aid`,
/// `pid`, `hid`). `-1` marks a tentative row that the host has not confirmed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalId(i64);

impl GlobalId {
    pub const TENTATIVE: GlobalId = GlobalId(-1);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    pub fn is_tentative(&self) -> bool {
        self.0 == Self::TENTATIVE.0
    }

    pub fn is_confirmed(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_tentative() {
            write!(f, "GlobalId(tentative)")
        } else {
            write!(f, "GlobalId({})", self.0)
        }
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-local row index `n`. Stable for a row's lifetime on one node and
/// meaningless on any other node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(i64);

impl RowKey {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n={}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Team,
    Assignment,
    Pairing,
    History,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Team,
        EntityKind::Assignment,
        EntityKind::Pairing,
        EntityKind::History,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Team => "team",
            Self::Assignment => "assignment",
            Self::Pairing => "pairing",
            Self::History => "history",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "team" => Ok(Self::Team),
            "assignment" => Ok(Self::Assignment),
            "pairing" => Ok(Self::Pairing),
            "history" => Ok(Self::History),
            _ => Err(CoreError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A confirmed row addressed by class and global id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub kind: EntityKind,
    pub id: GlobalId,
}

impl Target {
    pub fn team(tid: GlobalId) -> Self {
        Self { kind: EntityKind::Team, id: tid }
    }

    pub fn assignment(aid: GlobalId) -> Self {
        Self { kind: EntityKind::Assignment, id: aid }
    }

    pub fn pairing(pid: GlobalId) -> Self {
        Self { kind: EntityKind::Pairing, id: pid }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tentative_is_neither_confirmed_nor_zero() {
        assert!(GlobalId::TENTATIVE.is_tentative());
        assert!(!GlobalId::TENTATIVE.is_confirmed());
        assert!(GlobalId::new(1).is_confirmed());
        assert!(!GlobalId::new(0).is_confirmed());
    }

    #[test]
    fn kind_names_roundtrip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(EntityKind::parse("edge").is_err());
    }
}
