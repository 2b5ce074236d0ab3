//! Error types for chatroute.

use std::fmt;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// Optimistic-concurrency check failed: the row moved on since it was read.
    #[error("Version conflict on {entity} {id}: expected {expected:?}")]
    Conflict {
        entity: String,
        id: String,
        expected: Option<i64>,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// One missing or malformed field of an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldProblem {
    /// Dotted path of the field, e.g. `data.text.message`.
    pub field: String,
    pub message: String,
}

impl FieldProblem {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Malformed inbound payload. Carries every problem found, not just the first.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid inbound payload ({})", join_problems(.problems))]
pub struct ValidationError {
    pub problems: Vec<FieldProblem>,
}

impl ValidationError {
    /// Whether a specific field was reported.
    pub fn has_field(&self, field: &str) -> bool {
        self.problems.iter().any(|p| p.field == field)
    }
}

fn join_problems(problems: &[FieldProblem]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Transport / channel errors (outbound sends and human-support forwarding).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Unsupported message type: {0}")]
    UnsupportedMessageType(String),

    #[error("Invalid {message_type} intent: {reason}")]
    InvalidIntent {
        message_type: String,
        reason: String,
    },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Routing and processing errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("State lookup failed: {0}")]
    StateLookup(#[source] DatabaseError),

    #[error("Enqueue failed: {0}")]
    Enqueue(#[source] DatabaseError),

    #[error("Malformed job payload for job {job_id}: {reason}")]
    Payload { job_id: String, reason: String },

    #[error("Human support forward failed: {0}")]
    HumanForward(#[source] ChannelError),

    #[error("State persistence failed: {0}")]
    StatePersist(#[source] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
