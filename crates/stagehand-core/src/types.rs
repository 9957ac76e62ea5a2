//! Core type definitions for Stagehand pipelines

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::payload::StagePayload;
use crate::StagehandError;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    Explore,
    Plan,
    Implement,
    Test,
    Review,
}

impl StageId {
    /// All stages in their fixed execution order
    pub const ALL: [StageId; 5] = [
        StageId::Explore,
        StageId::Plan,
        StageId::Implement,
        StageId::Test,
        StageId::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explore => "explore",
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Test => "test",
            Self::Review => "review",
        }
    }

    /// File name of the handoff document this stage writes into its workspace
    pub fn artifact_name(&self) -> &'static str {
        match self {
            Self::Explore => "analysis.json",
            Self::Plan => "plan.json",
            Self::Implement => "build-summary.json",
            Self::Test => "test-summary.json",
            Self::Review => "review-report.json",
        }
    }

    /// Default executor identifier for this stage
    pub fn executor_name(&self) -> String {
        format!("{}-agent", self.as_str())
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "explore" | "scout" => Ok(Self::Explore),
            "plan" => Ok(Self::Plan),
            "implement" | "build" => Ok(Self::Implement),
            "test" => Ok(Self::Test),
            "review" => Ok(Self::Review),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

/// Overall status of a workflow run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status of a single stage within a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    RevisionRequested,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::RevisionRequested => write!(f, "revision_requested"),
        }
    }
}

/// Quality gate verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    RequestRevision,
    Escalate,
    Reject,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::RequestRevision => write!(f, "request_revision"),
            Self::Escalate => write!(f, "escalate"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "request_revision" | "request-revision" | "revise" => Ok(Self::RequestRevision),
            "escalate" => Ok(Self::Escalate),
            "reject" => Ok(Self::Reject),
            _ => Err(format!("Invalid decision: {}", s)),
        }
    }
}

/// Severity of a quality gate finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
    Suggestion,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::Major => write!(f, "major"),
            Self::Minor => write!(f, "minor"),
            Self::Suggestion => write!(f, "suggestion"),
        }
    }
}

/// A single issue reported by the quality gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    /// technical_debt, performance, security, ...
    pub category: String,
    pub description: String,
    /// file:line, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub recommendation: String,
}

impl Finding {
    pub fn new(
        severity: Severity,
        category: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category: category.into(),
            description: description.into(),
            location: None,
            recommendation: String::new(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendation = recommendation.into();
        self
    }
}

/// A decision issued by the quality gate for one stage attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub stage: StageId,
    pub decision: Decision,
    /// Bounded 0-100
    pub score: u8,
    pub feedback: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    pub timestamp: DateTime<Utc>,
    /// Evaluation time in milliseconds
    #[serde(default)]
    pub duration_ms: u64,
}

impl GateDecision {
    /// Create a decision; scores above 100 are clamped
    pub fn new(stage: StageId, decision: Decision, score: u32, feedback: impl Into<String>) -> Self {
        Self {
            stage,
            decision,
            score: score.min(100) as u8,
            feedback: feedback.into(),
            findings: Vec::new(),
            timestamp: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Safe default when an evaluation cannot produce a usable verdict.
    ///
    /// Escalates with score 0 so a human looks at it instead of the
    /// pipeline looping on garbage.
    pub fn fallback(stage: StageId, reason: impl std::fmt::Display) -> Self {
        Self::new(
            stage,
            Decision::Escalate,
            0,
            format!("Quality gate evaluation failed: {}", reason),
        )
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn has_critical(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.severity == Severity::Critical)
    }
}

/// Lifecycle status of a workspace. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Reclaiming,
    Reclaimed,
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Reclaiming => write!(f, "reclaiming"),
            Self::Reclaimed => write!(f, "reclaimed"),
        }
    }
}

/// An isolated checkout assigned to one stage attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub run_id: String,
    pub stage: StageId,
    pub path: PathBuf,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaimed_at: Option<DateTime<Utc>>,
    pub executor_id: String,
}

/// Snapshot of workspace pool usage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Utilization {
    pub active: usize,
    pub ceiling: usize,
    pub rate: f64,
}

impl Utilization {
    pub fn new(active: usize, ceiling: usize) -> Self {
        let rate = if ceiling > 0 {
            active as f64 / ceiling as f64
        } else {
            0.0
        };
        Self {
            active,
            ceiling,
            rate,
        }
    }
}

/// Per-stage execution record within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StagePayload>,
    /// Last decision issued for this stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<GateDecision>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    pub fn new(max_retries: u32) -> Self {
        Self {
            status: StageStatus::Pending,
            workspace_id: None,
            workspace_path: None,
            output: None,
            decision: None,
            retry_count: 0,
            max_retries,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Why a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CapacityExceeded,
    ProvisionFailed,
    ExecutorFailed,
    Timeout,
    MaxRetriesExceeded,
    Escalated,
    Rejected,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapacityExceeded => write!(f, "capacity exceeded"),
            Self::ProvisionFailed => write!(f, "workspace provisioning failed"),
            Self::ExecutorFailed => write!(f, "executor failed"),
            Self::Timeout => write!(f, "timed out"),
            Self::MaxRetriesExceeded => write!(f, "max retries exceeded"),
            Self::Escalated => write!(f, "escalated"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// User-visible failure of a run: stage, cause and the triggering decision if any
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub stage: StageId,
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<GateDecision>,
    /// (active, ceiling) of the pool when it had no free slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<(usize, usize)>,
}

impl FailureCause {
    pub fn new(stage: StageId, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            decision: None,
            capacity: None,
        }
    }

    pub fn with_decision(mut self, decision: GateDecision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_capacity(mut self, active: usize, ceiling: usize) -> Self {
        self.capacity = Some((active, ceiling));
        self
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} stage {}: {}", self.stage, self.kind, self.message)?;
        if let Some(decision) = &self.decision {
            write!(
                f,
                "\n  decision: {} (score {})\n  feedback: {}",
                decision.decision, decision.score, decision.feedback
            )?;
            for finding in &decision.findings {
                write!(
                    f,
                    "\n  - [{}] {}: {}",
                    finding.severity, finding.category, finding.description
                )?;
                if let Some(location) = &finding.location {
                    write!(f, " ({})", location)?;
                }
            }
        }
        Ok(())
    }
}

/// One end-to-end execution of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub task_description: String,
    pub status: RunStatus,
    pub current_stage: Option<StageId>,
    pub stages: BTreeMap<StageId, StageRecord>,
    /// Every decision issued during the run, in order
    pub decisions: Vec<GateDecision>,
    /// Every workspace allocated during the run, in order
    pub workspaces: Vec<Workspace>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_errors: Vec<String>,
}

impl WorkflowRun {
    /// Create a new run; `max_retries` supplies each stage's revision ceiling
    pub fn new(task_description: impl Into<String>, max_retries: impl Fn(StageId) -> u32) -> Self {
        let stages = StageId::ALL
            .iter()
            .map(|stage| (*stage, StageRecord::new(max_retries(*stage))))
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            task_description: task_description.into(),
            status: RunStatus::Running,
            current_stage: None,
            stages,
            decisions: Vec::new(),
            workspaces: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            failure: None,
            cleanup_errors: Vec::new(),
        }
    }

    pub fn stage(&self, stage: StageId) -> &StageRecord {
        // Every StageId is inserted at construction
        &self.stages[&stage]
    }

    pub fn stage_mut(&mut self, stage: StageId) -> &mut StageRecord {
        self.stages
            .entry(stage)
            .or_insert_with(|| StageRecord::new(0))
    }

    /// Stages currently marked running (at most one while the engine is sound)
    pub fn running_stages(&self) -> Vec<StageId> {
        self.stages
            .iter()
            .filter(|(_, record)| record.status == StageStatus::Running)
            .map(|(stage, _)| *stage)
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The failure cause as an error, `None` unless the run failed
    pub fn error(&self) -> Option<StagehandError> {
        let failure = self.failure.as_ref()?;
        let stage = failure.stage;
        let score = failure.decision.as_ref().map(|d| d.score).unwrap_or(0);

        Some(match failure.kind {
            FailureKind::CapacityExceeded => match failure.capacity {
                Some((active, ceiling)) => StagehandError::CapacityExceeded { active, ceiling },
                None => StagehandError::Other(failure.message.clone()),
            },
            FailureKind::ProvisionFailed => StagehandError::ProvisionFailed(failure.message.clone()),
            FailureKind::ExecutorFailed => StagehandError::ExecutorFailed {
                stage,
                message: failure.message.clone(),
            },
            FailureKind::Timeout => StagehandError::StageTimeout {
                stage,
                message: failure.message.clone(),
            },
            FailureKind::MaxRetriesExceeded => StagehandError::MaxRetriesExceeded {
                stage,
                retries: self.stage(stage).retry_count,
            },
            FailureKind::Escalated => StagehandError::Escalated { stage, score },
            FailureKind::Rejected => StagehandError::Rejected { stage, score },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_fixed() {
        let mut stages = vec![StageId::Review, StageId::Explore, StageId::Test, StageId::Plan, StageId::Implement];
        stages.sort();
        assert_eq!(stages, StageId::ALL.to_vec());
    }

    #[test]
    fn test_stage_aliases() {
        assert_eq!("scout".parse::<StageId>().unwrap(), StageId::Explore);
        assert_eq!("BUILD".parse::<StageId>().unwrap(), StageId::Implement);
        assert!("deploy".parse::<StageId>().is_err());
    }

    #[test]
    fn test_decision_serde_snake_case() {
        let json = serde_json::to_string(&Decision::RequestRevision).unwrap();
        assert_eq!(json, "\"request_revision\"");
        let parsed: Decision = serde_json::from_str("\"escalate\"").unwrap();
        assert_eq!(parsed, Decision::Escalate);
    }

    #[test]
    fn test_gate_decision_score_clamped() {
        let decision = GateDecision::new(StageId::Plan, Decision::Approve, 250, "great");
        assert_eq!(decision.score, 100);
    }

    #[test]
    fn test_fallback_escalates_with_zero_score() {
        let decision = GateDecision::fallback(StageId::Test, "bad json");
        assert_eq!(decision.decision, Decision::Escalate);
        assert_eq!(decision.score, 0);
        assert!(decision.feedback.contains("bad json"));
    }

    #[test]
    fn test_has_critical() {
        let decision = GateDecision::new(StageId::Implement, Decision::Approve, 90, "ok")
            .with_findings(vec![
                Finding::new(Severity::Minor, "style", "naming"),
                Finding::new(Severity::Critical, "security", "secret in repo"),
            ]);
        assert!(decision.has_critical());
    }

    #[test]
    fn test_utilization_rate() {
        assert_eq!(Utilization::new(3, 4).rate, 0.75);
        assert_eq!(Utilization::new(0, 0).rate, 0.0);
    }

    #[test]
    fn test_new_run_has_all_stages_pending() {
        let run = WorkflowRun::new("Add login", |stage| match stage {
            StageId::Review => 1,
            _ => 3,
        });
        assert_eq!(run.stages.len(), 5);
        assert!(run
            .stages
            .values()
            .all(|record| record.status == StageStatus::Pending));
        assert_eq!(run.stage(StageId::Review).max_retries, 1);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.running_stages().is_empty());
    }

    #[test]
    fn test_failure_cause_display_includes_decision() {
        let decision = GateDecision::new(StageId::Plan, Decision::Reject, 12, "plan ignores the task")
            .with_findings(vec![Finding::new(Severity::Critical, "scope", "wrong feature")
                .with_location("plan.json:1")]);
        let cause = FailureCause::new(StageId::Plan, FailureKind::Rejected, "Workflow rejected")
            .with_decision(decision);

        let text = cause.to_string();
        assert!(text.contains("plan stage rejected"));
        assert!(text.contains("score 12"));
        assert!(text.contains("[critical] scope: wrong feature (plan.json:1)"));
    }

    #[test]
    fn test_run_error_reflects_failure() {
        let mut run = WorkflowRun::new("task", |_| 2);
        assert!(run.error().is_none());

        run.stage_mut(StageId::Implement).retry_count = 2;
        run.failure = Some(FailureCause::new(
            StageId::Implement,
            FailureKind::MaxRetriesExceeded,
            "revision requested 2 times (limit 2)",
        ));
        match run.error() {
            Some(StagehandError::MaxRetriesExceeded { stage, retries }) => {
                assert_eq!(stage, StageId::Implement);
                assert_eq!(retries, 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        run.failure = Some(
            FailureCause::new(StageId::Review, FailureKind::Escalated, "escalated").with_decision(
                GateDecision::new(StageId::Review, Decision::Escalate, 35, "needs a human"),
            ),
        );
        assert!(matches!(
            run.error(),
            Some(StagehandError::Escalated { score: 35, .. })
        ));
    }

    #[test]
    fn test_run_error_keeps_capacity_counts() {
        let mut run = WorkflowRun::new("task", |_| 2);
        run.failure = Some(
            FailureCause::new(StageId::Plan, FailureKind::CapacityExceeded, "pool full")
                .with_capacity(1, 1),
        );

        match run.error() {
            Some(StagehandError::CapacityExceeded { active, ceiling }) => {
                assert_eq!((active, ceiling), (1, 1));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
