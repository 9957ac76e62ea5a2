//! Pipeline engine
//!
//! Drives one [`WorkflowRun`] through the enabled stages. Each attempt gets
//! a fresh workspace from the pool, runs the stage executor, and (when
//! quality gates are on) asks the gate for a verdict. The per-stage status
//! changes go through the pure [`transition`] function.
//!
//! Whatever path ends the run, the run's workspaces are released exactly
//! once before the terminal status is recorded.

use chrono::Utc;
use stagehand_core::{
    FailureCause, FailureKind, GateDecision, PipelineConfig, RunStatus, StageId, StagePayload,
    StagehandError, WorkflowRun, Workspace,
};
use stagehand_gate::{GateContext, GateEvaluator};
use stagehand_vcs::Checkout;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::activity_logger::ActivityLogger;
use crate::executor::{StageExecutor, StageInput};
use crate::stages::StagePlan;
use crate::state_machine::{transition, StageAction, StageEvent, StageState};
use crate::workspace::WorkspacePool;

type StageOutcome<T> = std::result::Result<T, FailureCause>;

pub struct PipelineEngine<C: Checkout> {
    config: PipelineConfig,
    plan: StagePlan,
    pool: WorkspacePool<C>,
    gate: Arc<dyn GateEvaluator>,
    executors: HashMap<StageId, Arc<dyn StageExecutor>>,
    default_executor: Option<Arc<dyn StageExecutor>>,
    activity: Option<ActivityLogger>,
    run: WorkflowRun,
    updates: watch::Sender<WorkflowRun>,
}

impl<C: Checkout> PipelineEngine<C> {
    pub fn new(
        task_description: impl Into<String>,
        config: PipelineConfig,
        pool: WorkspacePool<C>,
        gate: Arc<dyn GateEvaluator>,
    ) -> Self {
        let run = WorkflowRun::new(task_description, |stage| {
            config.stages.get(stage).max_retries
        });
        let (updates, _) = watch::channel(run.clone());

        Self {
            plan: StagePlan::from_config(&config.stages),
            config,
            pool,
            gate,
            executors: HashMap::new(),
            default_executor: None,
            activity: None,
            run,
            updates,
        }
    }

    /// Use `executor` for one stage
    pub fn with_executor(mut self, stage: StageId, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.insert(stage, executor);
        self
    }

    /// Use `executor` for every stage without a dedicated one
    pub fn with_default_executor(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.default_executor = Some(executor);
        self
    }

    /// Write `activity.md` into `dir`
    pub fn with_activity_logging(mut self, dir: impl Into<PathBuf>) -> Self {
        self.activity = Some(ActivityLogger::new(dir));
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run.id
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    /// Receive a snapshot of the run after every change
    pub fn subscribe(&self) -> watch::Receiver<WorkflowRun> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> WorkflowRun {
        self.run.clone()
    }

    fn publish(&self) {
        self.updates.send_replace(self.run.clone());
    }

    fn executor_for(&self, stage: StageId) -> Option<Arc<dyn StageExecutor>> {
        self.executors
            .get(&stage)
            .or(self.default_executor.as_ref())
            .cloned()
    }

    /// Run every enabled stage and return the final run
    ///
    /// Calling this again after the run finished returns the same snapshot.
    #[instrument(skip(self), fields(run_id = %self.run.id))]
    pub async fn execute(&mut self) -> WorkflowRun {
        if self.run.is_terminal() {
            return self.snapshot();
        }

        info!(
            "Starting run: {}",
            self.run
                .task_description
                .lines()
                .next()
                .unwrap_or_default()
        );
        if let Some(activity) = &self.activity {
            activity.log_run_start(&self.run, self.plan.stages()).await;
        }

        let outcome = self.run_stages().await;

        let report = self.pool.release_run(&self.run.id).await;
        for (workspace_id, e) in report.failures {
            warn!(workspace_id = %workspace_id, "Cleanup failed: {}", e);
            self.run
                .cleanup_errors
                .push(format!("{}: {}", workspace_id, e));
        }
        self.refresh_workspaces();

        match outcome {
            Ok(()) => {
                info!("Run completed");
                self.run.status = RunStatus::Completed;
            }
            Err(cause) => {
                error!("Run failed: {}", cause);
                self.run.status = RunStatus::Failed;
                self.run.failure = Some(cause);
            }
        }
        self.run.ended_at = Some(Utc::now());
        self.publish();

        if let Some(activity) = &self.activity {
            activity.log_run_complete(&self.run).await;
        }

        self.snapshot()
    }

    async fn run_stages(&mut self) -> StageOutcome<()> {
        let stages = self.plan.stages().to_vec();

        for stage in stages {
            // The output travels in the run record, so the checkout can go
            // before the next stage takes a slot
            let workspace_id = self.run_stage(stage).await?;
            self.release_quietly(&workspace_id).await;
        }

        Ok(())
    }

    /// Run one stage until it is approved; returns the approved attempt's workspace id
    async fn run_stage(&mut self, stage: StageId) -> StageOutcome<String> {
        let timeout = self.config.stages.get(stage).timeout();
        let Some(executor) = self.executor_for(stage) else {
            return Err(self.abort(
                stage,
                FailureKind::ExecutorFailed,
                "no executor registered for this stage".to_string(),
            ));
        };

        loop {
            let attempt = self.run.stage(stage).retry_count + 1;
            self.dispatch(stage)?;

            let workspace = self
                .acquire_workspace(stage, &executor.id(stage), timeout)
                .await?;
            if let Some(activity) = &self.activity {
                activity.log_stage_dispatch(stage, attempt, &workspace).await;
            }

            let input = StageInput {
                run_id: self.run.id.clone(),
                stage,
                task_description: self.run.task_description.clone(),
                workspace_path: workspace.path.clone(),
                previous_output: self.plan.input_for(&self.run, stage),
            };
            let payload = self.execute_stage(executor.as_ref(), &input, timeout).await?;

            let (action, decision) = if self.config.quality_gates.enabled {
                let decision = self
                    .evaluate(stage, attempt, &payload, &workspace, timeout)
                    .await?;
                (
                    self.step(stage, StageEvent::Verdict(decision.decision)),
                    Some(decision),
                )
            } else {
                (self.step(stage, StageEvent::GateSkipped), None)
            };

            match action {
                StageAction::Advance => {
                    self.run.stage_mut(stage).ended_at = Some(Utc::now());
                    self.publish();
                    info!(stage = %stage, attempt, "Stage approved");
                    return Ok(workspace.id);
                }
                StageAction::Redispatch => {
                    let record = self.run.stage_mut(stage);
                    record.output = None;
                    record.ended_at = Some(Utc::now());
                    info!(
                        stage = %stage,
                        "Revision requested ({}/{}), dispatching again",
                        record.retry_count,
                        record.max_retries
                    );
                    self.publish();
                    self.release_quietly(&workspace.id).await;
                }
                StageAction::FailRun(kind) => {
                    let record = self.run.stage_mut(stage);
                    record.ended_at = Some(Utc::now());
                    let message = match kind {
                        FailureKind::MaxRetriesExceeded => format!(
                            "revision requested {} times (limit {})",
                            record.retry_count, record.max_retries
                        ),
                        FailureKind::Escalated => {
                            "quality gate escalated for human review".to_string()
                        }
                        FailureKind::Rejected => "quality gate rejected the output".to_string(),
                        other => other.to_string(),
                    };
                    self.publish();

                    let cause = FailureCause::new(stage, kind, message);
                    return Err(match decision {
                        Some(decision) => cause.with_decision(decision),
                        None => cause,
                    });
                }
                other => return Err(self.unexpected(stage, other)),
            }
        }
    }

    fn dispatch(&mut self, stage: StageId) -> StageOutcome<()> {
        match self.step(stage, StageEvent::Dispatch) {
            StageAction::Execute => {
                let record = self.run.stage_mut(stage);
                record.started_at = Some(Utc::now());
                record.ended_at = None;
                record.output = None;
                record.workspace_id = None;
                record.workspace_path = None;
                self.run.current_stage = Some(stage);
                self.publish();
                debug!(stage = %stage, "Stage dispatched");
                Ok(())
            }
            other => Err(self.unexpected(stage, other)),
        }
    }

    async fn acquire_workspace(
        &mut self,
        stage: StageId,
        executor_id: &str,
        timeout: Duration,
    ) -> StageOutcome<Workspace> {
        let acquired = tokio::time::timeout(
            timeout,
            self.pool.acquire(&self.run.id, stage, executor_id),
        )
        .await;

        let workspace = match acquired {
            Ok(Ok(workspace)) => workspace,
            Ok(Err(StagehandError::CapacityExceeded { active, ceiling })) => {
                let message = StagehandError::CapacityExceeded { active, ceiling }.to_string();
                let cause = self.abort(stage, FailureKind::CapacityExceeded, message);
                return Err(cause.with_capacity(active, ceiling));
            }
            Ok(Err(e)) => {
                return Err(self.abort(stage, FailureKind::ProvisionFailed, e.to_string()));
            }
            Err(_) => {
                return Err(self.abort(
                    stage,
                    FailureKind::Timeout,
                    format!(
                        "workspace acquisition exceeded the {}s stage timeout",
                        timeout.as_secs()
                    ),
                ))
            }
        };

        let record = self.run.stage_mut(stage);
        record.workspace_id = Some(workspace.id.clone());
        record.workspace_path = Some(workspace.path.clone());
        self.run.workspaces.push(workspace.clone());
        self.publish();
        Ok(workspace)
    }

    async fn execute_stage(
        &mut self,
        executor: &dyn StageExecutor,
        input: &StageInput,
        timeout: Duration,
    ) -> StageOutcome<StagePayload> {
        let stage = input.stage;
        let payload = match tokio::time::timeout(timeout, executor.execute(input)).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => return Err(self.abort(stage, FailureKind::ExecutorFailed, e.to_string())),
            Err(_) => {
                return Err(self.abort(
                    stage,
                    FailureKind::Timeout,
                    format!("stage execution exceeded {}s", timeout.as_secs()),
                ))
            }
        };

        if let Err(e) = payload.expect_stage(stage) {
            return Err(self.abort(
                stage,
                FailureKind::ExecutorFailed,
                format!("invalid stage output: {}", e),
            ));
        }

        match self.step(stage, StageEvent::ExecutionSucceeded) {
            StageAction::Evaluate => {
                self.run.stage_mut(stage).output = Some(payload.clone());
                self.publish();
                Ok(payload)
            }
            other => Err(self.unexpected(stage, other)),
        }
    }

    async fn evaluate(
        &mut self,
        stage: StageId,
        attempt: u32,
        payload: &StagePayload,
        workspace: &Workspace,
        timeout: Duration,
    ) -> StageOutcome<GateDecision> {
        let ctx = GateContext {
            run_id: self.run.id.clone(),
            stage,
            task_description: self.run.task_description.clone(),
            attempt,
            workspace_path: Some(workspace.path.clone()),
        };

        let decision = match tokio::time::timeout(timeout, self.gate.evaluate(Some(payload), &ctx))
            .await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!(stage = %stage, "Quality gate failed, escalating: {}", e);
                GateDecision::fallback(stage, e)
            }
            Err(_) => {
                return Err(self.abort(
                    stage,
                    FailureKind::Timeout,
                    format!("quality gate evaluation exceeded {}s", timeout.as_secs()),
                ))
            }
        };

        info!(
            stage = %stage,
            attempt,
            "Gate decision: {} (score {})",
            decision.decision,
            decision.score
        );
        self.run.stage_mut(stage).decision = Some(decision.clone());
        self.run.decisions.push(decision.clone());
        self.publish();

        if let Some(activity) = &self.activity {
            activity.log_decision(&decision).await;
        }
        Ok(decision)
    }

    fn step(&mut self, stage: StageId, event: StageEvent) -> StageAction {
        let record = self.run.stage_mut(stage);
        let state = StageState {
            status: record.status,
            retry_count: record.retry_count,
            max_retries: record.max_retries,
        };
        let (next, action) = transition(state, event);
        record.status = next.status;
        record.retry_count = next.retry_count;

        debug!(stage = %stage, "{} -> {} ({:?})", state.status, next.status, event);
        action
    }

    /// Fail the current attempt and build the run's failure cause
    fn abort(&mut self, stage: StageId, kind: FailureKind, message: String) -> FailureCause {
        if let StageAction::Invalid(reason) = self.step(stage, StageEvent::Aborted(kind)) {
            warn!(stage = %stage, "{}", reason);
        }
        self.run.stage_mut(stage).ended_at = Some(Utc::now());
        self.publish();
        FailureCause::new(stage, kind, message)
    }

    fn unexpected(&mut self, stage: StageId, action: StageAction) -> FailureCause {
        let message = match action {
            StageAction::Invalid(reason) => reason,
            other => format!("unexpected stage action {:?}", other),
        };
        error!(stage = %stage, "{}", message);
        self.run.stage_mut(stage).ended_at = Some(Utc::now());
        self.publish();
        FailureCause::new(stage, FailureKind::ExecutorFailed, message)
    }

    async fn release_quietly(&mut self, workspace_id: &str) {
        if let Err(e) = self.pool.release(workspace_id).await {
            warn!(workspace_id, "Releasing workspace mid-run failed: {}", e);
            self.run
                .cleanup_errors
                .push(format!("{}: {}", workspace_id, e));
        }
        self.refresh_workspaces();
    }

    fn refresh_workspaces(&mut self) {
        for workspace in &mut self.run.workspaces {
            if let Some(current) = self.pool.get(&workspace.id) {
                *workspace = current;
            }
        }
    }
}
