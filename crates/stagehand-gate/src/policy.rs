//! Score and critical-finding policy applied on top of the critic's verdict

use stagehand_core::{Decision, GateDecision, QualityGatesConfig};
use tracing::debug;

/// Thresholds an approval must meet to stand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatePolicy {
    pub required_score: u8,
    pub critical_blocks: bool,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            required_score: 80,
            critical_blocks: true,
        }
    }
}

impl From<&QualityGatesConfig> for GatePolicy {
    fn from(config: &QualityGatesConfig) -> Self {
        Self {
            required_score: config.required_score.min(100),
            critical_blocks: config.critical_issue_block,
        }
    }
}

impl GatePolicy {
    /// Downgrade an approval that falls short to a revision request
    ///
    /// Other decisions pass through untouched.
    pub fn apply(&self, mut decision: GateDecision) -> GateDecision {
        if decision.decision != Decision::Approve {
            return decision;
        }

        let reason = if self.critical_blocks && decision.has_critical() {
            Some("critical findings block approval".to_string())
        } else if decision.score < self.required_score {
            Some(format!(
                "score {} is below the required {}",
                decision.score, self.required_score
            ))
        } else {
            None
        };

        if let Some(reason) = reason {
            debug!("Downgrading {} approval: {}", decision.stage, reason);
            decision.decision = Decision::RequestRevision;
            if decision.feedback.is_empty() {
                decision.feedback = format!("Revision required: {}", reason);
            } else {
                decision.feedback = format!("{}\n\nRevision required: {}", decision.feedback, reason);
            }
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::{Finding, Severity, StageId};

    #[test]
    fn test_approval_above_threshold_stands() {
        let policy = GatePolicy::default();
        let decision = policy.apply(GateDecision::new(StageId::Plan, Decision::Approve, 85, "good"));
        assert_eq!(decision.decision, Decision::Approve);
        assert_eq!(decision.feedback, "good");
    }

    #[test]
    fn test_low_score_downgrades() {
        let policy = GatePolicy::default();
        let decision = policy.apply(GateDecision::new(StageId::Plan, Decision::Approve, 79, "meh"));
        assert_eq!(decision.decision, Decision::RequestRevision);
        assert!(decision.feedback.contains("below the required 80"));
    }

    #[test]
    fn test_critical_finding_blocks_only_when_enabled() {
        let decision = GateDecision::new(StageId::Implement, Decision::Approve, 95, "")
            .with_findings(vec![Finding::new(Severity::Critical, "security", "sql injection")]);

        let blocked = GatePolicy::default().apply(decision.clone());
        assert_eq!(blocked.decision, Decision::RequestRevision);

        let lenient = GatePolicy {
            required_score: 80,
            critical_blocks: false,
        };
        assert_eq!(lenient.apply(decision).decision, Decision::Approve);
    }

    #[test]
    fn test_non_approvals_pass_through() {
        let policy = GatePolicy::default();
        let decision = policy.apply(GateDecision::new(StageId::Review, Decision::Reject, 10, "no"));
        assert_eq!(decision.decision, Decision::Reject);
        assert_eq!(decision.feedback, "no");
    }
}
