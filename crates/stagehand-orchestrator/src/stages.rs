//! Stage ordering for a run

use stagehand_core::{StageId, StagePayload, StagesConfig, WorkflowRun};

/// The enabled stages of a run, in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<StageId>,
}

impl StagePlan {
    pub fn from_config(config: &StagesConfig) -> Self {
        Self {
            stages: config.enabled(),
        }
    }

    pub fn stages(&self) -> &[StageId] {
        &self.stages
    }

    pub fn is_enabled(&self, stage: StageId) -> bool {
        self.stages.contains(&stage)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The enabled stage that runs right before `stage`
    pub fn previous(&self, stage: StageId) -> Option<StageId> {
        self.stages.iter().copied().take_while(|s| *s < stage).last()
    }

    pub fn next(&self, stage: StageId) -> Option<StageId> {
        self.stages.iter().copied().find(|s| *s > stage)
    }

    /// Output a dispatched `stage` receives: that of the previous enabled stage
    pub fn input_for(&self, run: &WorkflowRun, stage: StageId) -> Option<StagePayload> {
        self.previous(stage)
            .and_then(|prev| run.stages.get(&prev))
            .and_then(|record| record.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan_without(disabled: &[StageId]) -> StagePlan {
        let mut config = StagesConfig::default();
        for stage in disabled {
            config.get_mut(*stage).enabled = false;
        }
        StagePlan::from_config(&config)
    }

    #[test]
    fn test_all_stages_in_order() {
        let plan = plan_without(&[]);
        assert_eq!(plan.stages(), &StageId::ALL);
        assert_eq!(plan.previous(StageId::Explore), None);
        assert_eq!(plan.previous(StageId::Test), Some(StageId::Implement));
        assert_eq!(plan.next(StageId::Review), None);
    }

    #[test]
    fn test_disabled_stage_is_skipped() {
        let plan = plan_without(&[StageId::Plan]);
        assert!(!plan.is_enabled(StageId::Plan));
        assert_eq!(plan.previous(StageId::Implement), Some(StageId::Explore));
        assert_eq!(plan.next(StageId::Explore), Some(StageId::Implement));
    }

    #[test]
    fn test_input_comes_from_previous_enabled_stage() {
        let plan = plan_without(&[StageId::Test]);
        let mut run = WorkflowRun::new("task", |_| 2);

        assert_eq!(plan.input_for(&run, StageId::Explore), None);

        let output = StagePayload::new(StageId::Implement, json!({"files": 3}));
        run.stage_mut(StageId::Implement).output = Some(output.clone());

        assert_eq!(plan.input_for(&run, StageId::Review), Some(output));
    }
}
