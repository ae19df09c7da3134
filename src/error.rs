//! Rich diagnostic error types for the SRIA runtime.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so callers know exactly
//! what went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

use crate::sria::LifecycleState;

/// Top-level error type for the SRIA runtime.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, sources) through to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum SriaError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] crate::paths::PathError),
}

impl SriaError {
    /// Whether this error is an expected runtime divergence (unknown id,
    /// wrong lifecycle state) rather than a programmer error.
    ///
    /// Routine errors are reported as `{success: false, error}` by the action
    /// layer; everything else propagates to the caller.
    pub fn is_routine(&self) -> bool {
        match self {
            Self::Engine(EngineError::InvalidTransition { .. }) => true,
            Self::Registry(e) => e.is_not_found(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("cannot {operation}: agent is {actual}, requires {required}")]
    #[diagnostic(
        code(sria::engine::invalid_transition),
        help(
            "Summon moves DORMANT → ACTIVE, dismiss moves ACTIVE → DORMANT, and \
             steps require ACTIVE. Check the agent's lifecycle state first."
        )
    )]
    InvalidTransition {
        operation: String,
        required: LifecycleState,
        actual: LifecycleState,
    },

    #[error("unknown perception layer: \"{layer}\"")]
    #[diagnostic(
        code(sria::engine::unknown_layer),
        help("Known layers are: data, semantic, symbolic, meta.")
    )]
    UnknownLayer { layer: String },

    #[error("no candidate actions to decide between")]
    #[diagnostic(
        code(sria::engine::no_candidates),
        help(
            "Pass at least one action that is not listed in the agent's \
             safety_constraints.forbidden_actions."
        )
    )]
    NoCandidateActions,

    #[error("invalid argument: {message}")]
    #[diagnostic(code(sria::engine::invalid_argument))]
    InvalidArgument { message: String },
}

// ---------------------------------------------------------------------------
// Registry errors (agents, templates, teams, runs)
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("agent not found: \"{id}\"")]
    #[diagnostic(
        code(sria::registry::agent_not_found),
        help("List registered agents with `sria agent list`.")
    )]
    AgentNotFound { id: String },

    #[error("team not found: \"{id}\"")]
    #[diagnostic(
        code(sria::registry::team_not_found),
        help("List teams with `sria team list`.")
    )]
    TeamNotFound { id: String },

    #[error("unknown template: \"{template}\"")]
    #[diagnostic(
        code(sria::registry::unknown_template),
        help("List templates with `sria template list`, or register one with `template.add`.")
    )]
    UnknownTemplate { template: String },

    #[error("invalid body primes: {message}")]
    #[diagnostic(
        code(sria::registry::invalid_body_primes),
        help("Body primes must be a non-empty list of distinct prime numbers.")
    )]
    InvalidBodyPrimes { message: String },

    #[error("member index {index} out of range (network has {len} members)")]
    #[diagnostic(code(sria::registry::member_out_of_range))]
    MemberOutOfRange { index: usize, len: usize },

    #[error("no run loop for agent \"{id}\"")]
    #[diagnostic(
        code(sria::registry::run_not_found),
        help("Start one with `agent.run` first.")
    )]
    RunNotFound { id: String },

    #[error("agent \"{id}\" already has a running loop")]
    #[diagnostic(
        code(sria::registry::already_running),
        help("Stop the existing loop with `agent.stop` before starting another.")
    )]
    AlreadyRunning { id: String },
}

impl RegistryError {
    /// Lookups that missed.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::AgentNotFound { .. } | Self::TeamNotFound { .. } | Self::RunNotFound { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(sria::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(sria::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             Try running with a fresh data directory."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(sria::store::serde),
        help(
            "Failed to serialize or deserialize a stored entity. \
             The stored format may have changed between versions."
        )
    )]
    Serialization { message: String },
}

/// Convenience alias used throughout the crate.
pub type SriaResult<T> = std::result::Result<T, SriaError>;
