//! Tagged payloads handed from one stage to the next
//!
//! Each stage produces a [`StagePayload`] whose `stage` tag and
//! `schema_version` let the consumer validate the shape before using it.
//! The payload is also persisted into the producing workspace as the
//! stage's artifact document (see [`StageId::artifact_name`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Result, StageId, StagehandError};

/// Current payload schema version
pub const PAYLOAD_SCHEMA_VERSION: u32 = 1;

/// Self-describing output of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePayload {
    pub schema_version: u32,
    pub stage: StageId,
    pub body: serde_json::Value,
    pub produced_at: DateTime<Utc>,
}

impl StagePayload {
    pub fn new(stage: StageId, body: serde_json::Value) -> Self {
        Self {
            schema_version: PAYLOAD_SCHEMA_VERSION,
            stage,
            body,
            produced_at: Utc::now(),
        }
    }

    /// Check that this payload came from `stage` with a schema we understand
    pub fn expect_stage(&self, stage: StageId) -> Result<&serde_json::Value> {
        if self.schema_version != PAYLOAD_SCHEMA_VERSION {
            return Err(StagehandError::Other(format!(
                "Unsupported {} payload schema version {} (expected {})",
                self.stage, self.schema_version, PAYLOAD_SCHEMA_VERSION
            )));
        }
        if self.stage != stage {
            return Err(StagehandError::Other(format!(
                "Expected {} payload, got {}",
                stage, self.stage
            )));
        }
        Ok(&self.body)
    }

    /// Decode the body into a typed structure
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Write this payload as the stage artifact inside `dir`
    pub async fn write_artifact(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(dir.join(self.stage.artifact_name()), content).await?;
        Ok(())
    }

    /// Read the artifact `stage` left in `dir`
    pub async fn read_artifact(dir: &Path, stage: StageId) -> Result<Self> {
        let content = tokio::fs::read_to_string(dir.join(stage.artifact_name())).await?;
        let payload: Self = serde_json::from_str(&content)?;
        payload.expect_stage(stage)?;
        Ok(payload)
    }
}
