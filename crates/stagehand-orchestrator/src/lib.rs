//! # stagehand-orchestrator
//!
//! Drives a task through the Stagehand stages.
//!
//! This crate provides:
//! - [`WorkspacePool`]: bounded allocation and reclamation of isolated
//!   workspaces, with deadline and age based reclaim
//! - The pure per-stage state machine ([`transition`])
//! - [`StageExecutor`] and the shell-command based [`CommandExecutor`]
//! - [`PipelineEngine`], which sequences stages, consults the quality gate
//!   and applies the retry / escalation policy
//! - [`ActivityLogger`] for a human-readable `activity.md` per run

mod activity_logger;
mod engine;
mod executor;
mod stages;
mod state_machine;
mod workspace;

pub use activity_logger::ActivityLogger;
pub use engine::PipelineEngine;
pub use executor::{CommandExecutor, CommandResult, StageExecutor, StageInput, ARTIFACT_DIR};
pub use stages::StagePlan;
pub use state_machine::{transition, StageAction, StageEvent, StageState};
pub use workspace::{ReleaseReport, WorkspacePool};
