//! The two disjoint conversation universes.

use serde::{Deserialize, Serialize};

use crate::message::ParticipantId;

/// A conversation domain. No message ever crosses from one to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Universe {
    /// Anonymous visitors talking to a consultant.
    Guest,
    /// Authenticated staff talking to each other.
    Internal,
}

impl Universe {
    /// Both universes, in a fixed order.
    pub const ALL: [Self; 2] = [Self::Guest, Self::Internal];

    /// The universe a one-to-one conversation between `a` and `b` lives in.
    ///
    /// Any conversation with a guest on either side is guest-support chat.
    #[must_use]
    pub fn for_pair(a: &ParticipantId, b: &ParticipantId) -> Self {
        if a.is_guest() || b.is_guest() {
            Self::Guest
        } else {
            Self::Internal
        }
    }

    /// Lowercase name used in storage namespaces and URLs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown universe name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown universe: {0} (expected `guest` or `internal`)")]
pub struct UnknownUniverse(pub String);

impl std::str::FromStr for Universe {
    type Err = UnknownUniverse;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "guest" => Ok(Self::Guest),
            "internal" | "staff" => Ok(Self::Internal),
            other => Err(UnknownUniverse(other.to_string())),
        }
    }
}
