//! Account warmup state machine.
//!
//! `Unverified -> Verified -> Active -> Completed`, with `Paused` reachable from
//! `Active` or `Completed` and resuming to whichever of the two it came from.

use crate::error::StateError;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountState {
    Unverified,
    Verified,
    Active,
    Paused,
    Completed,
}

impl AccountState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Verified => "verified",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unverified" => Some(Self::Unverified),
            "verified" => Some(Self::Verified),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Accounts in these states run cycles and can receive warmup mail.
    pub fn runs_cycles(&self) -> bool {
        matches!(self, Self::Active | Self::Completed)
    }

    /// A successful credential check.
    pub fn verify(self) -> Result<Self, StateError> {
        match self {
            Self::Unverified | Self::Verified => Ok(Self::Verified),
            other => Err(invalid(other, "verify")),
        }
    }

    /// Start warming up. Requires an active config.
    pub fn activate(self, config_active: bool) -> Result<Self, StateError> {
        match self {
            Self::Verified if config_active => Ok(Self::Active),
            Self::Verified => Err(StateError::ConfigInactive),
            Self::Active => Ok(Self::Active),
            other => Err(invalid(other, "activate")),
        }
    }

    /// Explicit disable. Returns the new state and the state to resume to.
    pub fn pause(self) -> Result<(Self, Self), StateError> {
        match self {
            Self::Active | Self::Completed => Ok((Self::Paused, self)),
            other => Err(invalid(other, "pause")),
        }
    }

    /// Re-enable a paused account.
    pub fn resume(self, paused_from: Option<Self>) -> Result<Self, StateError> {
        match (self, paused_from) {
            (Self::Paused, Some(previous @ (Self::Active | Self::Completed))) => Ok(previous),
            (Self::Paused, _) => Ok(Self::Active),
            (other, _) => Err(invalid(other, "resume")),
        }
    }

    /// Credentials were rejected mid-warmup; they must be re-checked.
    pub fn demote(self) -> Result<Self, StateError> {
        match self {
            Self::Active | Self::Completed | Self::Verified => Ok(Self::Verified),
            other => Err(invalid(other, "demote")),
        }
    }

    /// Warmup finished: enough elapsed days, each with recorded metrics.
    pub fn complete(self, days_elapsed: u32, days_with_metrics: u32, warmup_days: u32) -> Self {
        match self {
            Self::Active if days_elapsed >= warmup_days && days_with_metrics >= warmup_days => {
                Self::Completed
            }
            other => other,
        }
    }
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn invalid(from: AccountState, action: &'static str) -> StateError {
    StateError::InvalidTransition {
        from: from.to_string(),
        action,
    }
}
