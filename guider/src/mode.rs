//! Guide modes and the transition table

use crate::error::GuideError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operating mode of a telescope unit's guider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuideMode {
    Idle,
    Starting,
    Stopping,
    Paused,
    Guiding,
    Focusing,
}

impl GuideMode {
    pub const ALL: [GuideMode; 6] = [
        GuideMode::Idle,
        GuideMode::Starting,
        GuideMode::Stopping,
        GuideMode::Paused,
        GuideMode::Guiding,
        GuideMode::Focusing,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            GuideMode::Idle => "IDLE",
            GuideMode::Starting => "STARTING",
            GuideMode::Stopping => "STOPPING",
            GuideMode::Paused => "PAUSED",
            GuideMode::Guiding => "GUIDING",
            GuideMode::Focusing => "FOCUSING",
        }
    }

    /// Busy with something that `stop` can end
    pub fn is_active(&self) -> bool {
        !matches!(self, GuideMode::Idle | GuideMode::Stopping)
    }

    /// Modes in which the guide loop keeps iterating
    pub fn is_looping(&self) -> bool {
        matches!(self, GuideMode::Guiding | GuideMode::Paused)
    }

    /// Whether moving from `self` to `target` is allowed
    pub fn can_transition_to(&self, target: GuideMode) -> bool {
        use GuideMode::*;

        if *self == target || target == Idle {
            return true;
        }
        if target == Stopping {
            return self.is_active();
        }
        matches!(
            (self, target),
            (Idle, Starting)
                | (Idle, Focusing)
                | (Starting, Guiding)
                | (Starting, Paused)
                | (Guiding, Paused)
                | (Paused, Guiding)
        )
    }
}

impl fmt::Display for GuideMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for GuideMode {
    type Err = GuideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        GuideMode::ALL
            .iter()
            .copied()
            .find(|m| m.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| GuideError::InvalidStateValue(s.to_string()))
    }
}
