use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

macro_rules! status_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(s: &str) -> Result<Self, CoreError> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(CoreError::UnknownStatus {
                        kind: $label,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum!(TeamStatus, "team", {
    Unassigned => "UNASSIGNED",
    Assigned => "ASSIGNED",
    Working => "WORKING",
    EnrouteToIc => "ENROUTE TO IC",
    Debriefing => "DEBRIEFING",
});

status_enum!(AssignmentStatus, "assignment", {
    Unassigned => "UNASSIGNED",
    Assigned => "ASSIGNED",
    Completed => "COMPLETED",
});

status_enum!(PairingStatus, "pairing", {
    Current => "CURRENT",
    Previous => "PREVIOUS",
});

/// A persisted status value for one of the two status-bearing classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusChange {
    Team(TeamStatus),
    Assignment(AssignmentStatus),
}

impl StatusChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Team(s) => s.as_str(),
            Self::Assignment(s) => s.as_str(),
        }
    }
}

/// What an operator can pick from the status menu. `Done` is not a status:
/// it closes the current pairing(s) and lets the close rules pick the
/// resulting statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCommand {
    Set(StatusChange),
    Done,
}

impl StatusCommand {
    pub fn parse_for_team(s: &str) -> Result<Self, CoreError> {
        if s == "DONE" {
            return Ok(Self::Done);
        }
        Ok(Self::Set(StatusChange::Team(TeamStatus::parse(s)?)))
    }

    pub fn parse_for_assignment(s: &str) -> Result<Self, CoreError> {
        if s == "DONE" {
            return Ok(Self::Done);
        }
        Ok(Self::Set(StatusChange::Assignment(AssignmentStatus::parse(s)?)))
    }
}
