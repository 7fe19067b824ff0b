use crate::core::analyze::Finding;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Core error types for FireFlow
#[derive(Debug, Error)]
pub enum Error {
    /// A single rule failed validation
    #[error("{0}")]
    InvalidRule(#[from] InvalidRuleError),

    /// A policy could not be compiled
    #[error("{0}")]
    Compile(#[from] CompileError),

    /// Target unreachable or timed out; retried by the orchestrator
    #[error("Transient apply error: {0}")]
    TransientApply(String),

    /// Target rejected the instructions; never retried
    #[error("Fatal apply error: {0}")]
    FatalApply(String),

    /// Lost update detected on save; reload and retry the whole operation
    #[error("Concurrent modification of {entity} {id}")]
    ConcurrencyConflict { entity: &'static str, id: Uuid },

    /// Entity does not exist in the store
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// Firewall lifecycle transition not permitted
    #[error("Invalid firewall state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Input validation failed (names, descriptions, positions)
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns `true` when retrying the same operation after a reload can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConcurrencyConflict { .. } | Error::TransientApply(_)
        )
    }
}

/// One problem found in a rule field
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuleViolation {
    pub field: String,
    pub reason: String,
}

impl RuleViolation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Every violation found in a single rule, collected in one pass
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("Rule {rule_id} is invalid: {}", format_violations(.violations))]
pub struct InvalidRuleError {
    pub rule_id: Uuid,
    pub violations: Vec<RuleViolation>,
}

fn format_violations(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CompileErrorKind {
    #[strum(serialize = "invalid rule")]
    InvalidRule,
    #[strum(serialize = "fatal conflict")]
    FatalConflict,
}

/// Compilation failure. Carries everything found, not just the first problem.
#[derive(Debug, Clone, Error)]
#[error("Compile failed ({kind}): {}", .details.join("; "))]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub details: Vec<String>,
    pub invalid_rules: Vec<InvalidRuleError>,
    pub conflicts: Vec<Finding>,
}

impl CompileError {
    pub fn invalid_rules(invalid_rules: Vec<InvalidRuleError>, extra: Vec<String>) -> Self {
        let mut details = extra;
        details.extend(invalid_rules.iter().map(ToString::to_string));
        Self {
            kind: CompileErrorKind::InvalidRule,
            details,
            invalid_rules,
            conflicts: Vec::new(),
        }
    }

    pub fn fatal_conflicts(conflicts: Vec<Finding>) -> Self {
        Self {
            kind: CompileErrorKind::FatalConflict,
            details: conflicts.iter().map(ToString::to_string).collect(),
            invalid_rules: Vec::new(),
            conflicts,
        }
    }
}

/// Outcome of a failed target call, as seen by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ApplyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApplyError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ApplyError::Transient(m) | ApplyError::Fatal(m) => m,
        }
    }
}

impl From<ApplyError> for Error {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::Transient(m) => Error::TransientApply(m),
            ApplyError::Fatal(m) => Error::FatalApply(m),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub transient: bool,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>, transient: bool) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            transient,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Table of target error patterns and their translations
pub struct TargetErrorPattern;

impl TargetErrorPattern {
    /// Matches a raw target error message against known patterns.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorTranslation::new("Target did not answer in time", true)
                .with_suggestion("Check that the firewall host is reachable")
                .with_suggestion("Raise apply_timeout_secs if the target is slow");
        }

        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Target firewall resource is busy", true)
                .with_suggestion("Another process may be modifying the ruleset")
                .with_suggestion("The task will be retried automatically");
        }

        if lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("unreachable")
            || lower.contains("broken pipe")
        {
            return ErrorTranslation::new("Could not communicate with the target", true)
                .with_suggestion("Verify network connectivity to the firewall")
                .with_suggestion("The task will be retried automatically");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface", true)
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables");
        }

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules", false)
                .with_suggestion("Run the target command with CAP_NET_ADMIN")
                .with_suggestion("Check the configured target program and arguments");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("Target program is not installed or not in PATH", false)
                .with_suggestion("Install nftables or point target.program at the right binary");
        }

        if lower.contains("syntax error")
            || lower.contains("could not process rule")
            || lower.contains("invalid")
            || lower.contains("rejected")
        {
            return ErrorTranslation::new("Target rejected the instructions as invalid", false)
                .with_suggestion("Compile the policy again and inspect the rendered output")
                .with_suggestion("Ensure CIDRs and port ranges are supported by the target");
        }

        ErrorTranslation::new(format!("Target error: {msg}"), true)
            .with_suggestion("Check the detailed error message for more information")
    }

    /// Classifies a raw target message into a transient or fatal apply error.
    pub fn classify(msg: &str) -> ApplyError {
        if Self::match_error(msg).transient {
            ApplyError::Transient(msg.to_string())
        } else {
            ApplyError::Fatal(msg.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transient() {
        let err = TargetErrorPattern::classify("read timed out after 30s");
        assert!(err.is_transient());
    }

    #[test]
    fn test_syntax_error_is_fatal() {
        let err = TargetErrorPattern::classify("Error: syntax error, unexpected $end");
        assert_eq!(
            err,
            ApplyError::Fatal("Error: syntax error, unexpected $end".to_string())
        );
    }

    #[test]
    fn test_permission_translation_has_suggestions() {
        let translation = TargetErrorPattern::match_error("Operation not permitted");
        assert!(!translation.transient);
        assert!(translation.user_message.contains("permissions"));
        assert!(translation.suggestions.len() >= 2);
    }

    #[test]
    fn test_unknown_message_defaults_to_transient() {
        let translation = TargetErrorPattern::match_error("something odd happened");
        assert!(translation.transient);
        assert!(translation.user_message.contains("something odd"));
    }

    #[test]
    fn test_invalid_rule_error_lists_every_violation() {
        let err = InvalidRuleError {
            rule_id: Uuid::nil(),
            violations: vec![
                RuleViolation::new("sources[0]", "invalid CIDR"),
                RuleViolation::new("protocol", "icmp cannot carry ports"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("sources[0]: invalid CIDR"));
        assert!(msg.contains("protocol: icmp cannot carry ports"));
    }

    #[test]
    fn test_apply_error_converts_to_taxonomy() {
        let err: Error = ApplyError::Fatal("bad".into()).into();
        assert!(matches!(err, Error::FatalApply(_)));
        assert!(!err.is_retryable());

        let err: Error = ApplyError::Transient("slow".into()).into();
        assert!(err.is_retryable());
    }
}
