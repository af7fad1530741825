//! Error types for Taskpilot.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Approval gate error: {0}")]
    Gate(#[from] GateError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
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

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is in status {status}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        status: String,
        target: String,
    },

    #[error("Task {id} is terminal ({status}); operation not allowed")]
    Terminal { id: Uuid, status: String },

    #[error("Task {id} state error: {reason}")]
    State { id: Uuid, reason: String },

    #[error("Invalid poll frequency: {0}")]
    InvalidPollFrequency(String),

    #[error("Decomposition rejected: {0}")]
    BadDecomposition(String),
}

/// Pending-message gate errors.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Pending message {id} not found on task {task_id}")]
    MessageNotFound { task_id: Uuid, id: Uuid },

    #[error("Send failed for pending message {id}: {reason}")]
    SendFailed { id: Uuid, reason: String },

    #[error("Pending message {id} was already resolved")]
    AlreadyResolved { id: Uuid },
}

/// Chat workflow errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("No active workflow for conversation {conversation}")]
    NoActiveWorkflow { conversation: String },

    #[error("Workflow slot for conversation {conversation} is occupied by {kind}")]
    SlotOccupied { conversation: String, kind: String },
}

/// External collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Decomposer failed: {0}")]
    Decomposer(String),

    #[error("Fact extractor failed: {0}")]
    Extractor(String),

    #[error("Step executor failed: {0}")]
    Executor(String),

    #[error("Message send failed on {platform} to {recipient}: {reason}")]
    Send {
        platform: String,
        recipient: String,
        reason: String,
    },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
