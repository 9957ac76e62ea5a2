//! Quality gate evaluation

use async_trait::async_trait;
use stagehand_core::{GateDecision, Result, StageId, StagePayload};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::critic::{Critic, CritiqueRequest};
use crate::parse::parse_critique;
use crate::policy::GatePolicy;

/// What the gate knows about the attempt it is judging
#[derive(Debug, Clone)]
pub struct GateContext {
    pub run_id: String,
    pub stage: StageId,
    pub task_description: String,
    /// 1 for the first attempt
    pub attempt: u32,
    pub workspace_path: Option<PathBuf>,
}

/// Judges a stage output
///
/// Implementations should return a decision for anything they can make sense
/// of; the engine treats an `Err` the same as an unparseable critique.
#[async_trait]
pub trait GateEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        output: Option<&StagePayload>,
        ctx: &GateContext,
    ) -> Result<GateDecision>;
}

const SYSTEM_PROMPT: &str = "You are the quality gate of a staged software change pipeline. \
Review the stage output against the task. Respond with a single JSON object in a ```json fence \
with fields: decision (approve | request_revision | escalate | reject), score (0-100), \
feedback (string), findings (array of {severity: critical|major|minor|suggestion, category, \
description, location, recommendation}).";

/// Critic-backed quality gate
pub struct QualityGate<C: Critic> {
    critic: C,
    policy: GatePolicy,
}

impl<C: Critic> QualityGate<C> {
    pub fn new(critic: C) -> Self {
        Self {
            critic,
            policy: GatePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: GatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> GatePolicy {
        self.policy
    }

    fn build_request(&self, output: Option<&StagePayload>, ctx: &GateContext) -> CritiqueRequest {
        let output_text = match output {
            Some(payload) => serde_json::to_string_pretty(&payload.body)
                .unwrap_or_else(|_| payload.body.to_string()),
            None => "(the stage produced no output)".to_string(),
        };

        let mut prompt = format!(
            "## Task\n{}\n\n## Stage\n{} (attempt {})\n\n## Output\n```json\n{}\n```\n",
            ctx.task_description, ctx.stage, ctx.attempt, output_text
        );
        if let Some(path) = &ctx.workspace_path {
            prompt.push_str(&format!("\nWorkspace: {}\n", path.display()));
        }
        prompt.push_str(&format!(
            "\nApprovals need a score of at least {}.\n",
            self.policy.required_score
        ));

        CritiqueRequest {
            stage: ctx.stage,
            system: SYSTEM_PROMPT.to_string(),
            prompt,
        }
    }
}

#[async_trait]
impl<C: Critic> GateEvaluator for QualityGate<C> {
    #[instrument(skip(self, output, ctx), fields(stage = %ctx.stage, attempt = ctx.attempt))]
    async fn evaluate(
        &self,
        output: Option<&StagePayload>,
        ctx: &GateContext,
    ) -> Result<GateDecision> {
        let started = Instant::now();
        let request = self.build_request(output, ctx);

        let decision = match self.critic.critique(&request).await {
            Ok(text) => match parse_critique(&text) {
                Ok(parsed) => self.policy.apply(parsed.into_decision(ctx.stage)),
                Err(e) => {
                    warn!("Could not parse critique for {}: {}", ctx.stage, e);
                    GateDecision::fallback(ctx.stage, e)
                }
            },
            Err(e) => {
                warn!("Critic failed for {}: {}", ctx.stage, e);
                GateDecision::fallback(ctx.stage, e)
            }
        };

        let decision = decision.with_duration_ms(started.elapsed().as_millis() as u64);
        info!(
            "Gate decision for {}: {} (score {})",
            ctx.stage, decision.decision, decision.score
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stagehand_core::{Decision, StagehandError};
    use std::sync::Mutex;

    struct ScriptedCritic {
        response: std::result::Result<String, String>,
        seen: Mutex<Vec<CritiqueRequest>>,
    }

    impl ScriptedCritic {
        fn ok(text: &str) -> Self {
            Self {
                response: Ok(text.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn err(message: &str) -> Self {
            Self {
                response: Err(message.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Critic for ScriptedCritic {
        async fn critique(&self, request: &CritiqueRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            self.response.clone().map_err(StagehandError::Api)
        }
    }

    fn ctx(stage: StageId) -> GateContext {
        GateContext {
            run_id: "run-1".to_string(),
            stage,
            task_description: "Add a health endpoint".to_string(),
            attempt: 1,
            workspace_path: None,
        }
    }

    #[tokio::test]
    async fn test_gate_returns_parsed_decision() {
        let gate = QualityGate::new(ScriptedCritic::ok(
            r#"```json
{"decision": "approve", "score": 88, "feedback": "solid plan"}
```"#,
        ));
        let payload = StagePayload::new(StageId::Plan, json!({"steps": ["add route"]}));

        let decision = gate.evaluate(Some(&payload), &ctx(StageId::Plan)).await.unwrap();
        assert_eq!(decision.decision, Decision::Approve);
        assert_eq!(decision.score, 88);
        assert_eq!(decision.stage, StageId::Plan);

        let seen = gate.critic.seen.lock().unwrap();
        assert!(seen[0].prompt.contains("add route"));
        assert!(seen[0].prompt.contains("Add a health endpoint"));
    }

    #[tokio::test]
    async fn test_unparseable_critique_escalates() {
        let gate = QualityGate::new(ScriptedCritic::ok("Looks great to me!"));
        let decision = gate.evaluate(None, &ctx(StageId::Review)).await.unwrap();
        assert_eq!(decision.decision, Decision::Escalate);
        assert_eq!(decision.score, 0);
        assert!(decision.feedback.starts_with("Quality gate evaluation failed"));
    }

    #[tokio::test]
    async fn test_critic_failure_escalates() {
        let gate = QualityGate::new(ScriptedCritic::err("connection reset"));
        let decision = gate.evaluate(None, &ctx(StageId::Test)).await.unwrap();
        assert_eq!(decision.decision, Decision::Escalate);
        assert_eq!(decision.score, 0);
        assert!(decision.feedback.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_policy_applies_to_weak_approval() {
        let gate = QualityGate::new(ScriptedCritic::ok(
            r#"{"decision": "approve", "score": 60, "feedback": "thin"}"#,
        ))
        .with_policy(GatePolicy {
            required_score: 75,
            critical_blocks: true,
        });

        let decision = gate.evaluate(None, &ctx(StageId::Implement)).await.unwrap();
        assert_eq!(decision.decision, Decision::RequestRevision);
        assert_eq!(decision.score, 60);
    }
}
