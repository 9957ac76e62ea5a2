//! # stagehand-core
//!
//! Core types for the Stagehand staged change pipeline.
//!
//! A task description flows through fixed stages (explore, plan, implement,
//! test, review). Each stage attempt runs in its own isolated workspace and
//! its output is judged by a quality gate that approves, asks for a
//! revision, escalates, or rejects.
//!
//! This crate holds the shared vocabulary: runs, stage records, gate
//! decisions, workspaces, tagged stage payloads, configuration and the
//! unified error type.

mod error;
mod payload;
mod types;

pub mod config;
pub mod fail_open;

pub use config::{
    CriticConfig, PipelineConfig, QualityGatesConfig, StageConfig, StagesConfig, WorkspaceConfig,
};
pub use error::{Result, StagehandError};
pub use payload::{StagePayload, PAYLOAD_SCHEMA_VERSION};
pub use types::*;
