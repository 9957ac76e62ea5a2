//! Unified error types for Stagehand

use thiserror::Error;

use crate::types::StageId;

/// Unified error type for all Stagehand operations
#[derive(Error, Debug)]
pub enum StagehandError {
    // Workspace pool errors
    #[error("Workspace capacity exceeded: {active} of {ceiling} slots in use")]
    CapacityExceeded { active: usize, ceiling: usize },

    #[error("Workspace provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Workspace removal failed: {0}")]
    RemovalFailed(String),

    // Checkout primitive errors
    #[error("Checkout command failed: {0}")]
    Checkout(String),

    // Stage errors
    #[error("{stage} executor failed: {message}")]
    ExecutorFailed { stage: StageId, message: String },

    #[error("{stage} stage timed out: {message}")]
    StageTimeout { stage: StageId, message: String },

    #[error("Max retries exceeded for {stage} stage ({retries} revisions)")]
    MaxRetriesExceeded { stage: StageId, retries: u32 },

    // Quality gate errors
    #[error("Quality gate output could not be parsed: {0}")]
    EvaluationUnparseable(String),

    #[error("Workflow escalated at {stage} stage (score {score})")]
    Escalated { stage: StageId, score: u8 },

    #[error("Workflow rejected at {stage} stage (score {score})")]
    Rejected { stage: StageId, score: u8 },

    // Critic API errors
    #[error("API error: {0}")]
    Api(String),

    #[error("API rate limit: {0}")]
    ApiLimit(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using StagehandError
pub type Result<T> = std::result::Result<T, StagehandError>;
