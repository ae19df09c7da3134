//! Lifecycle state machine.
//!
//! Two states: an agent is either DORMANT (no session) or ACTIVE (summoned,
//! holding a session). `summon` is the only way in, `dismiss` the only way
//! out, and steps are only legal while ACTIVE.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    #[default]
    Dormant,
    Active,
}

impl LifecycleState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Dormant => "DORMANT",
            Self::Active => "ACTIVE",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check that `operation` may run from this state.
    ///
    /// Returns the state the agent will be in afterwards.
    pub fn transition(self, operation: Operation) -> Result<LifecycleState, EngineError> {
        let (required, next) = match operation {
            Operation::Summon => (Self::Dormant, Self::Active),
            Operation::Dismiss => (Self::Active, Self::Dormant),
            Operation::Step => (Self::Active, Self::Active),
        };
        if self != required {
            return Err(EngineError::InvalidTransition {
                operation: operation.label().into(),
                required,
                actual: self,
            });
        }
        Ok(next)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Operations gated by the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Summon,
    Dismiss,
    Step,
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Summon => "summon",
            Self::Dismiss => "dismiss",
            Self::Step => "step",
        }
    }
}
