//! Human-readable run log written to `activity.md`
//!
//! Every write is fail-open: a full disk or missing directory never
//! affects the run.

use chrono::Utc;
use stagehand_core::fail_open::fail_open;
use stagehand_core::{GateDecision, Result, StageId, WorkflowRun, Workspace};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

pub struct ActivityLogger {
    output_path: PathBuf,
}

impl ActivityLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            output_path: dir.into().join("activity.md"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.output_path
    }

    pub async fn log_run_start(&self, run: &WorkflowRun, stages: &[StageId]) {
        fail_open("activity_logger::log_run_start", || async {
            let stage_list: Vec<&str> = stages.iter().map(|s| s.as_str()).collect();
            let content = format!(
                "# Stagehand Activity Log\n\n## Task: {}\n**Run**: {}\n**Started**: {}\n**Stages**: {}\n\n---\n\n",
                run.task_description
                    .lines()
                    .next()
                    .unwrap_or(&run.task_description),
                run.id,
                run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                stage_list.join(" → ")
            );

            if let Some(parent) = self.output_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.output_path)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
        .await;
    }

    pub async fn log_stage_dispatch(&self, stage: StageId, attempt: u32, workspace: &Workspace) {
        fail_open("activity_logger::log_stage_dispatch", || async {
            let content = format!(
                "### {} (attempt {})\n**Time**: {}\n**Workspace**: `{}`\n\n",
                stage,
                attempt,
                Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
                workspace.id
            );
            self.append_internal(&content).await
        })
        .await;
    }

    pub async fn log_decision(&self, decision: &GateDecision) {
        fail_open("activity_logger::log_decision", || async {
            let mut content = format!(
                "**Gate**: {} (score {}, {}ms)\n\n",
                decision.decision, decision.score, decision.duration_ms
            );

            if !decision.feedback.is_empty() {
                content.push_str("> ");
                content.push_str(&decision.feedback.replace('\n', "\n> "));
                content.push_str("\n\n");
            }

            if !decision.findings.is_empty() {
                content.push_str("**Findings**:\n");
                for finding in &decision.findings {
                    content.push_str(&format!(
                        "- [{}] {}: {}",
                        finding.severity, finding.category, finding.description
                    ));
                    if let Some(location) = &finding.location {
                        content.push_str(&format!(" ({})", location));
                    }
                    content.push('\n');
                }
                content.push('\n');
            }

            self.append_internal(&content).await
        })
        .await;
    }

    pub async fn log_run_complete(&self, run: &WorkflowRun) {
        fail_open("activity_logger::log_run_complete", || async {
            let mut content = format!(
                "---\n\n## Run Summary\n\n**Status**: {}\n**Workspaces**: {}\n**Decisions**: {}\n",
                run.status,
                run.workspaces.len(),
                run.decisions.len()
            );

            if let Some(ended) = run.ended_at {
                content.push_str(&format!(
                    "**Finished**: {} ({}s)\n",
                    ended.format("%Y-%m-%d %H:%M:%S UTC"),
                    (ended - run.started_at).num_seconds()
                ));
            }
            if let Some(failure) = &run.failure {
                content.push_str(&format!("\n**Failure**:\n```\n{}\n```\n", failure));
            }
            if !run.cleanup_errors.is_empty() {
                content.push_str("\n**Cleanup errors**:\n");
                for error in &run.cleanup_errors {
                    content.push_str(&format!("- {}\n", error));
                }
            }
            content.push('\n');

            self.append_internal(&content).await
        })
        .await;
    }

    async fn append_internal(&self, content: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
