//! Configuration management for Stagehand
//!
//! Pipeline settings live in `.stagehand/config.toml` at the repository root:
//! per-stage enablement, timeouts and retry ceilings, the workspace pool,
//! the quality gate, and the critic model.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, StageId, StagehandError};

/// Path of the configuration file relative to the repository root
pub const CONFIG_PATH: &str = ".stagehand/config.toml";

/// Repository-level pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-stage settings
    #[serde(default)]
    pub stages: StagesConfig,

    /// Workspace pool settings
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Quality gate settings
    #[serde(default)]
    pub quality_gates: QualityGatesConfig,

    /// Critic (language model) settings
    #[serde(default)]
    pub critic: CriticConfig,
}

/// Settings for every stage, keyed by stage name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default = "default_explore")]
    pub explore: StageConfig,
    #[serde(default = "default_plan")]
    pub plan: StageConfig,
    #[serde(default = "default_implement")]
    pub implement: StageConfig,
    #[serde(default = "default_test")]
    pub test: StageConfig,
    #[serde(default = "default_review")]
    pub review: StageConfig,
}

/// Settings for a single stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bound on workspace provisioning, execution and evaluation
    pub timeout_secs: u64,

    /// Revision ceiling; the run fails when this many revisions are requested
    pub max_retries: u32,

    /// Shell commands run by the command executor for this stage
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Workspace pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory holding workspaces, relative to the repository root unless absolute
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Maximum simultaneously active workspaces
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Reclaim workspaces automatically after `auto_reclaim_timeout_secs`
    #[serde(default = "default_true")]
    pub auto_reclaim: bool,

    #[serde(default = "default_auto_reclaim_timeout")]
    pub auto_reclaim_timeout_secs: u64,

    /// How long reclaimed entries stay queryable before they are purged
    #[serde(default = "default_reclaimed_grace")]
    pub reclaimed_grace_secs: u64,

    /// Age after which `prune` reclaims an active workspace
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Bound on a single checkout removal
    #[serde(default = "default_removal_timeout")]
    pub removal_timeout_secs: u64,

    /// Write a metadata snapshot for each workspace on release
    #[serde(default = "default_true")]
    pub snapshots: bool,

    /// Where metadata snapshots are written, relative to the repository root unless absolute
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
}

/// Quality gate settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGatesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum score (0-100) an approval needs to stand
    #[serde(default = "default_required_score")]
    pub required_score: u8,

    /// A critical finding alone blocks approval
    #[serde(default = "default_true")]
    pub critical_issue_block: bool,
}

/// Critic model settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticConfig {
    /// opus, sonnet or haiku
    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable containing the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

// Default value providers
fn default_true() -> bool {
    true
}

fn stage(timeout_mins: u64, max_retries: u32) -> StageConfig {
    StageConfig {
        enabled: true,
        timeout_secs: timeout_mins * 60,
        max_retries,
        commands: Vec::new(),
    }
}

fn default_explore() -> StageConfig {
    stage(10, 2)
}

fn default_plan() -> StageConfig {
    stage(15, 3)
}

fn default_implement() -> StageConfig {
    stage(30, 3)
}

fn default_test() -> StageConfig {
    stage(20, 2)
}

fn default_review() -> StageConfig {
    stage(10, 1)
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".worktrees")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_auto_reclaim_timeout() -> u64 {
    60 * 60
}

fn default_reclaimed_grace() -> u64 {
    60
}

fn default_max_age() -> u64 {
    24 * 60 * 60
}

fn default_removal_timeout() -> u64 {
    120
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from(".worktree-logs")
}

fn default_required_score() -> u8 {
    80
}

fn default_model() -> String {
    "opus".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_max_tokens() -> usize {
    4096
}

impl PipelineConfig {
    /// Load configuration from `.stagehand/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(CONFIG_PATH);

        let config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| StagehandError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Render configuration as TOML text
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| StagehandError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Write default configuration to `.stagehand/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<PathBuf> {
        let config_path = repo_root.join(CONFIG_PATH);
        if let Some(dir) = config_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        std::fs::write(&config_path, Self::default().to_toml()?)?;
        Ok(config_path)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.quality_gates.required_score > 100 {
            return Err(StagehandError::Config(format!(
                "quality_gates.required_score must be 0-100, got {}",
                self.quality_gates.required_score
            )));
        }

        if self.workspace.max_concurrent == 0 {
            return Err(StagehandError::Config(
                "workspace.max_concurrent must be at least 1".to_string(),
            ));
        }

        for stage in StageId::ALL {
            let config = self.stages.get(stage);
            if config.enabled && config.timeout_secs == 0 {
                return Err(StagehandError::Config(format!(
                    "stages.{}.timeout_secs must be greater than zero",
                    stage
                )));
            }
        }

        if self.stages.enabled().is_empty() {
            return Err(StagehandError::Config(
                "at least one stage must be enabled".to_string(),
            ));
        }

        if self.workspace.removal_timeout_secs == 0 {
            return Err(StagehandError::Config(
                "workspace.removal_timeout_secs must be greater than zero".to_string(),
            ));
        }

        // An attempt holds its workspace through execution and evaluation,
        // each bounded by the stage timeout
        if self.workspace.auto_reclaim {
            for stage in self.stages.enabled() {
                let stage_timeout = self.stages.get(stage).timeout_secs;
                if self.workspace.auto_reclaim_timeout_secs < stage_timeout.saturating_mul(2) {
                    return Err(StagehandError::Config(format!(
                        "workspace.auto_reclaim_timeout_secs ({}) must be at least twice stages.{}.timeout_secs ({})",
                        self.workspace.auto_reclaim_timeout_secs,
                        stage,
                        stage_timeout
                    )));
                }
            }
        }

        Ok(())
    }
}

impl StagesConfig {
    pub fn get(&self, stage: StageId) -> &StageConfig {
        match stage {
            StageId::Explore => &self.explore,
            StageId::Plan => &self.plan,
            StageId::Implement => &self.implement,
            StageId::Test => &self.test,
            StageId::Review => &self.review,
        }
    }

    pub fn get_mut(&mut self, stage: StageId) -> &mut StageConfig {
        match stage {
            StageId::Explore => &mut self.explore,
            StageId::Plan => &mut self.plan,
            StageId::Implement => &mut self.implement,
            StageId::Test => &mut self.test,
            StageId::Review => &mut self.review,
        }
    }

    /// Enabled stages in execution order
    pub fn enabled(&self) -> Vec<StageId> {
        StageId::ALL
            .into_iter()
            .filter(|stage| self.get(*stage).enabled)
            .collect()
    }
}

impl StageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl WorkspaceConfig {
    pub fn auto_reclaim_timeout(&self) -> Duration {
        Duration::from_secs(self.auto_reclaim_timeout_secs)
    }

    pub fn reclaimed_grace(&self) -> Duration {
        Duration::from_secs(self.reclaimed_grace_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn removal_timeout(&self) -> Duration {
        Duration::from_secs(self.removal_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: StagesConfig::default(),
            workspace: WorkspaceConfig::default(),
            quality_gates: QualityGatesConfig::default(),
            critic: CriticConfig::default(),
        }
    }
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            explore: default_explore(),
            plan: default_plan(),
            implement: default_implement(),
            test: default_test(),
            review: default_review(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            max_concurrent: default_max_concurrent(),
            auto_reclaim: true,
            auto_reclaim_timeout_secs: default_auto_reclaim_timeout(),
            reclaimed_grace_secs: default_reclaimed_grace(),
            max_age_secs: default_max_age(),
            removal_timeout_secs: default_removal_timeout(),
            snapshots: true,
            snapshot_dir: default_snapshot_dir(),
        }
    }
}

impl Default for QualityGatesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required_score: default_required_score(),
            critical_issue_block: true,
        }
    }
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.workspace.max_concurrent, 3);
        assert_eq!(config.stages.implement.timeout_secs, 1800);
        assert_eq!(config.stages.review.max_retries, 1);
        assert_eq!(config.quality_gates.required_score, 80);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [stages.test]
            enabled = false
            timeout_secs = 60
            max_retries = 1

            [workspace]
            max_concurrent = 8
            "#,
        )
        .unwrap();

        assert!(!config.stages.test.enabled);
        assert_eq!(config.workspace.max_concurrent, 8);
        assert_eq!(config.workspace.base_dir, PathBuf::from(".worktrees"));
        assert_eq!(config.stages.plan, default_plan());
        assert_eq!(
            config.stages.enabled(),
            vec![StageId::Explore, StageId::Plan, StageId::Implement, StageId::Review]
        );
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = PipelineConfig::from_toml("stages = 3").unwrap_err();
        assert!(matches!(err, StagehandError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.quality_gates.required_score = 101;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.workspace.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        for stage in StageId::ALL {
            config.stages.get_mut(stage).enabled = false;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_deadline_shorter_than_an_attempt() {
        let mut config = PipelineConfig::default();
        config.workspace.auto_reclaim_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.stages.implement.timeout_secs = 1800;
        config.workspace.auto_reclaim_timeout_secs = 3599;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stages.implement.timeout_secs"));

        // Only enabled stages count
        config.stages.implement.enabled = false;
        assert!(config.validate().is_ok());

        let mut config = PipelineConfig::default();
        config.workspace.auto_reclaim = false;
        config.workspace.auto_reclaim_timeout_secs = 0;
        assert!(config.validate().is_ok());

        let mut config = PipelineConfig::default();
        config.workspace.removal_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_write_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = PipelineConfig::write_default(dir.path()).unwrap();
        assert!(path.ends_with(CONFIG_PATH));

        let loaded = PipelineConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, PipelineConfig::default());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = PipelineConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, PipelineConfig::default());
    }
}
