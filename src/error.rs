//! Error types for the plan/execution engine

use thiserror::Error;

use crate::tools::schema::FieldViolation;

/// Result type alias using the engine [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error taxonomy.
///
/// Per-action outcomes (timeouts, nonzero exits) are *not* errors: they are
/// recorded on the action and rendered into the session history as data.
/// Only registry misuse, schema violations, state-machine misuse and
/// infrastructure failures surface here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool already registered: {0}")]
    DuplicateTool(String),

    #[error("Schema violation for tool '{tool}': {}", format_violations(.violations))]
    SchemaViolation {
        tool: String,
        violations: Vec<FieldViolation>,
    },

    #[error("Invalid tool descriptor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[error("Plan {0} is executing; concurrent exec/append rejected")]
    ConcurrentExecution(String),

    #[error("Plan {0} is not executing")]
    NotExecuting(String),

    #[error("Invalid transition for plan {plan}: {reason}")]
    InvalidTransition { plan: String, reason: String },

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Session has no active plan")]
    NoActivePlan,

    #[error("Failed to start '{tool}': {reason}")]
    SpawnFailed { tool: String, reason: String },

    #[error("Incompatible session version: found {found}, supported {supported}")]
    IncompatibleSessionVersion { found: String, supported: u32 },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {session} is in use by running process {pid}")]
    SessionBusy { session: String, pid: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
