//! The text-producing collaborator behind the quality gate

use async_trait::async_trait;
use stagehand_core::{Result, StageId};

/// A review request sent to a critic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CritiqueRequest {
    pub stage: StageId,
    pub system: String,
    pub prompt: String,
}

/// Produces a free-text critique for a stage output (usually a language model)
///
/// Calls may fail transiently; the quality gate absorbs those failures.
#[async_trait]
pub trait Critic: Send + Sync {
    async fn critique(&self, request: &CritiqueRequest) -> Result<String>;
}
