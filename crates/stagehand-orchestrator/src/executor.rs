//! Stage executors
//!
//! An executor does one stage's work inside the workspace it is handed and
//! returns a tagged [`StagePayload`]. The engine calls it once per attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_core::{Result, StageId, StagePayload, StagehandError, StagesConfig};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, instrument};

/// Directory inside a workspace holding stage artifacts
pub const ARTIFACT_DIR: &str = ".stagehand";

/// Output kept from each command, in characters
const OUTPUT_TAIL_CHARS: usize = 2000;

/// Everything a stage attempt is given
#[derive(Debug, Clone)]
pub struct StageInput {
    pub run_id: String,
    pub stage: StageId,
    pub task_description: String,
    pub workspace_path: PathBuf,
    /// Output of the previous enabled stage, `None` for the first one
    pub previous_output: Option<StagePayload>,
}

impl StageInput {
    pub fn artifact_dir(&self) -> PathBuf {
        self.workspace_path.join(ARTIFACT_DIR)
    }
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Identifier recorded as the owner of the stage's workspace
    fn id(&self, stage: StageId) -> String {
        stage.executor_name()
    }

    async fn execute(&self, input: &StageInput) -> Result<StagePayload>;
}

/// Result of one configured command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

fn tail(text: &str) -> String {
    let count = text.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        text.to_string()
    } else {
        text.chars().skip(count - OUTPUT_TAIL_CHARS).collect()
    }
}

/// Runs the shell commands configured for each stage inside the workspace
///
/// Commands see `STAGEHAND_RUN_ID`, `STAGEHAND_STAGE`, `STAGEHAND_TASK` and
/// `STAGEHAND_ARTIFACTS` in their environment. The previous stage's payload
/// is written into the artifact directory before the first command runs.
pub struct CommandExecutor {
    stages: StagesConfig,
}

impl CommandExecutor {
    pub fn new(stages: StagesConfig) -> Self {
        Self { stages }
    }

    async fn run(&self, input: &StageInput, command: &str) -> Result<CommandResult> {
        debug!("Running `{}` in {}", command, input.workspace_path.display());

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&input.workspace_path)
            .env("STAGEHAND_RUN_ID", &input.run_id)
            .env("STAGEHAND_STAGE", input.stage.as_str())
            .env("STAGEHAND_TASK", &input.task_description)
            .env("STAGEHAND_ARTIFACTS", input.artifact_dir())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StagehandError::ExecutorFailed {
                stage: input.stage,
                message: format!("failed to spawn `{}`: {}", command, e),
            })?;

        Ok(CommandResult {
            command: command.to_string(),
            exit_code: output.status.code(),
            success: output.status.success(),
            stdout_tail: tail(&String::from_utf8_lossy(&output.stdout)),
            stderr_tail: tail(&String::from_utf8_lossy(&output.stderr)),
        })
    }
}

#[async_trait]
impl StageExecutor for CommandExecutor {
    #[instrument(skip(self, input), fields(stage = %input.stage, run_id = %input.run_id))]
    async fn execute(&self, input: &StageInput) -> Result<StagePayload> {
        let artifact_dir = input.artifact_dir();
        if let Some(previous) = &input.previous_output {
            previous.write_artifact(&artifact_dir).await?;
        }

        let commands = &self.stages.get(input.stage).commands;
        let mut results = Vec::with_capacity(commands.len());

        for command in commands {
            let result = self.run(input, command).await?;
            if !result.success {
                let code = result
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                return Err(StagehandError::ExecutorFailed {
                    stage: input.stage,
                    message: format!(
                        "`{}` exited with {}: {}",
                        command,
                        code,
                        result.stderr_tail.trim()
                    ),
                });
            }
            results.push(result);
        }

        info!("{} stage ran {} commands", input.stage, results.len());

        let payload = StagePayload::new(
            input.stage,
            serde_json::json!({
                "task": input.task_description,
                "previous_stage": input.previous_output.as_ref().map(|p| p.stage),
                "commands": results,
            }),
        );
        payload.write_artifact(&artifact_dir).await?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn input(dir: &TempDir, stage: StageId, previous: Option<StagePayload>) -> StageInput {
        StageInput {
            run_id: "run-1".to_string(),
            stage,
            task_description: "Add a health endpoint".to_string(),
            workspace_path: dir.path().to_path_buf(),
            previous_output: previous,
        }
    }

    fn executor_with(stage: StageId, commands: &[&str]) -> CommandExecutor {
        let mut stages = StagesConfig::default();
        stages.get_mut(stage).commands = commands.iter().map(|c| c.to_string()).collect();
        CommandExecutor::new(stages)
    }

    #[test]
    fn test_default_executor_id() {
        let executor = CommandExecutor::new(StagesConfig::default());
        assert_eq!(executor.id(StageId::Implement), "implement-agent");
    }

    #[test]
    fn test_tail_keeps_end_of_output() {
        let long = format!("{}END", "x".repeat(OUTPUT_TAIL_CHARS));
        let kept = tail(&long);
        assert_eq!(kept.chars().count(), OUTPUT_TAIL_CHARS);
        assert!(kept.ends_with("END"));
    }

    #[tokio::test]
    async fn test_commands_run_in_workspace_and_write_artifacts() {
        let dir = TempDir::new().unwrap();
        let executor = executor_with(StageId::Plan, &["echo \"$STAGEHAND_STAGE\" > stage.txt", "echo planned"]);
        let previous = StagePayload::new(StageId::Explore, json!({"files": ["src/lib.rs"]}));

        let payload = executor
            .execute(&input(&dir, StageId::Plan, Some(previous.clone())))
            .await
            .unwrap();

        assert_eq!(payload.stage, StageId::Plan);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("stage.txt")).unwrap().trim(),
            "plan"
        );

        let commands: Vec<CommandResult> =
            serde_json::from_value(payload.body["commands"].clone()).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].stdout_tail.trim(), "planned");
        assert_eq!(payload.body["previous_stage"], "explore");

        let artifacts = dir.path().join(ARTIFACT_DIR);
        let handed_over = StagePayload::read_artifact(&artifacts, StageId::Explore).await.unwrap();
        assert_eq!(handed_over, previous);
        assert!(artifacts.join("plan.json").exists());
    }

    #[tokio::test]
    async fn test_failing_command_is_executor_failure() {
        let dir = TempDir::new().unwrap();
        let executor = executor_with(StageId::Test, &["echo broken >&2; exit 3", "echo never"]);

        let err = executor
            .execute(&input(&dir, StageId::Test, None))
            .await
            .unwrap_err();

        match err {
            StagehandError::ExecutorFailed { stage, message } => {
                assert_eq!(stage, StageId::Test);
                assert!(message.contains("exited with 3"));
                assert!(message.contains("broken"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!dir.path().join(ARTIFACT_DIR).join("test-summary.json").exists());
    }

    #[tokio::test]
    async fn test_no_commands_still_produces_payload() {
        let dir = TempDir::new().unwrap();
        let executor = CommandExecutor::new(StagesConfig::default());

        let payload = executor
            .execute(&input(&dir, StageId::Explore, None))
            .await
            .unwrap();
        assert_eq!(payload.body["commands"], json!([]));
        assert!(payload.body["previous_stage"].is_null());
    }
}
