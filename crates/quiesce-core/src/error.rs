//! Error handling for the quiesce core engine
//!
//! Structured error types for rule compilation, memory bookkeeping and agent
//! control. Impasses are deliberately absent: they are ordinary decision
//! outcomes (see [`crate::decide::Resolution`]), never errors.

use std::fmt;
use thiserror::Error;

/// Hard architectural bounds that can be exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Resource {
    GoalDepth,
    NetworkNodes,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::GoalDepth => write!(f, "goal-stack depth"),
            Resource::NetworkNodes => write!(f, "network node count"),
        }
    }
}

/// Error type for quiesce engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Malformed condition/action tree, rejected before any network node exists
    #[error("Structural error in rule '{rule}': {message}")]
    Structural { rule: String, message: String },

    /// Rule identical to one already in the network; nothing was changed
    #[error("Rule '{rule}' duplicates existing rule '{existing}'")]
    DuplicateRule { rule: String, existing: String },

    /// A hard architectural bound was exceeded; fatal to the owning agent
    #[error("Resource exhausted: {resource} exceeded limit {limit}")]
    ResourceExhaustion { resource: Resource, limit: usize },

    /// Reference- or link-count inconsistency found by the collector
    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    /// Network image save/load failures
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Runtime parameter read/write failures
    #[error("Parameter error: {message}")]
    Parameter { message: String },

    /// Configuration file or environment errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Unknown rule '{name}'")]
    UnknownRule { name: String },

    #[error("Unknown agent '{name}'")]
    UnknownAgent { name: String },
}

impl EngineError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Structural { .. } => "structural",
            EngineError::DuplicateRule { .. } => "duplicate_rule",
            EngineError::ResourceExhaustion { .. } => "resource_exhaustion",
            EngineError::InvariantViolation { .. } => "invariant_violation",
            EngineError::Persistence { .. } => "persistence",
            EngineError::Parameter { .. } => "parameter",
            EngineError::Configuration { .. } => "configuration",
            EngineError::UnknownRule { .. } => "unknown_rule",
            EngineError::UnknownAgent { .. } => "unknown_agent",
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EngineError::Structural { .. } => ErrorSeverity::Medium,
            EngineError::DuplicateRule { .. } => ErrorSeverity::Low,
            EngineError::ResourceExhaustion { .. } => ErrorSeverity::Critical,
            EngineError::InvariantViolation { .. } => ErrorSeverity::Critical,
            EngineError::Persistence { .. } => ErrorSeverity::Medium,
            EngineError::Parameter { .. } => ErrorSeverity::Low,
            EngineError::Configuration { .. } => ErrorSeverity::High,
            EngineError::UnknownRule { .. } => ErrorSeverity::Low,
            EngineError::UnknownAgent { .. } => ErrorSeverity::Low,
        }
    }

    /// Fatal errors halt the owning agent's scheduler
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ResourceExhaustion { .. } | EngineError::InvariantViolation { .. }
        )
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    pub fn structural(rule: &str, message: impl Into<String>) -> Self {
        Self::Structural { rule: rule.to_string(), message: message.into() }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation { message: message.into() }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence { message: message.into() }
    }

    pub fn parameter(message: impl Into<String>) -> Self {
        Self::Parameter { message: message.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result type alias for core engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Report a bookkeeping inconsistency.
///
/// Debug builds surface it as an error so the agent halts; release builds log
/// it and carry on.
pub(crate) fn invariant_check(message: impl Into<String>) -> EngineResult<()> {
    let message = message.into();
    if cfg!(debug_assertions) {
        Err(EngineError::InvariantViolation { message })
    } else {
        tracing::error!(%message, "invariant violation ignored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let exhausted = EngineError::ResourceExhaustion { resource: Resource::GoalDepth, limit: 3 };
        assert!(exhausted.is_fatal());
        assert_eq!(exhausted.severity(), ErrorSeverity::Critical);

        let duplicate =
            EngineError::DuplicateRule { rule: "b".to_string(), existing: "a".to_string() };
        assert!(duplicate.is_recoverable());
        assert_eq!(duplicate.category(), "duplicate_rule");
    }

    #[test]
    fn test_display_messages() {
        let err = EngineError::structural("p1", "empty condition list");
        assert_eq!(err.to_string(), "Structural error in rule 'p1': empty condition list");
        let err = EngineError::ResourceExhaustion { resource: Resource::GoalDepth, limit: 100 };
        assert_eq!(err.to_string(), "Resource exhausted: goal-stack depth exceeded limit 100");
    }

    #[test]
    fn test_invariant_check_in_debug() {
        let outcome = invariant_check("refcount below zero");
        if cfg!(debug_assertions) {
            assert!(matches!(outcome, Err(EngineError::InvariantViolation { .. })));
        } else {
            assert!(outcome.is_ok());
        }
    }
}
