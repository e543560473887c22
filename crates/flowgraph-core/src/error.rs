use thiserror::Error;

use crate::port::Port;

/// A structured wiring problem found by [`crate::Subgraph::validate`].
///
/// Each variant carries the identifiers involved rather than a
/// pre-formatted string, so a caller can report, filter, or recover
/// from specific issues without re-parsing a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("duplicate node `{0}`")]
    DuplicateNode(String),

    #[error("edge references unknown node `{0}`")]
    UnknownNode(String),

    #[error("node `{node}` has no output port `{port}`")]
    NoSourcePort { node: String, port: String },

    #[error("node `{node}` has no input port `{port}`")]
    NoDestPort { node: String, port: String },

    #[error("edge capacity must be greater than zero, got {0}")]
    BadCapacity(usize),

    #[error("duplicate edge `{0}`")]
    DuplicateEdge(String),

    #[error("input `{0}` already exposed")]
    DuplicateExposedInput(String),

    #[error("output `{0}` already exposed")]
    DuplicateExposedOutput(String),

    #[error("exposed input `{0}` does not name a real input port")]
    BadExposedInput(String),

    #[error("exposed output `{0}` does not name a real output port")]
    BadExposedOutput(String),
}

/// Raised when an operation references a node, port, or edge that the
/// graph or runtime plan has no knowledge of, or that is wired
/// inconsistently, after initial construction (i.e. not caught by
/// `validate()` up front — for example a runtime mutator naming an
/// edge id that never existed).
#[derive(Debug, Error)]
pub enum WiringError {
    #[error("graph failed validation with {0} issue(s)")]
    Invalid(Vec<ValidationIssue>),

    #[error("unknown edge `{0}`")]
    UnknownEdge(String),

    #[error("unknown node `{0}`")]
    UnknownNode(String),

    #[error(transparent)]
    RejectedType(#[from] TypeError),
}

/// Raised when a message's payload does not satisfy a port's
/// validator.
#[derive(Debug, Error)]
#[error("payload rejected by port `{port}`")]
pub struct TypeError {
    pub port: Port,
}

/// Raised when a node callback is invoked outside of the lifecycle
/// state that permits it (e.g. `on_message` called before `on_start`).
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("node `{node}` is in state {state:?}, which does not permit {operation}")]
    InvalidTransition { node: String, state: &'static str, operation: &'static str },
}

/// Raised when a [`crate::SchedulerConfig`] or edge configuration value
/// is out of range.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero, got {value}")]
    NotPositive { field: &'static str, value: i64 },

    #[error("fairness ratio bands must all be greater than zero")]
    BadFairnessRatio,
}

/// A node handler's own failure, opaque to the runtime beyond its
/// `Display`/`Error` impl. The scheduler isolates these per-node: one
/// node's error never unwinds another node's processing.
pub type UserError = Box<dyn std::error::Error + Send + Sync>;
