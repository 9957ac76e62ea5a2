//! Pure per-stage state machine
//!
//! `transition(state, event) -> (state, action)` has no I/O and never
//! panics. The engine performs the returned action; invalid transitions
//! fail the stage instead of being ignored.

use stagehand_core::{Decision, FailureKind, StageStatus};

/// The slice of a stage record the state machine reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageState {
    pub status: StageStatus,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl StageState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            status: StageStatus::Pending,
            retry_count: 0,
            max_retries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    /// The engine starts an attempt
    Dispatch,
    /// The executor returned an output
    ExecutionSucceeded,
    /// The attempt could not finish (executor error, timeout, no workspace)
    Aborted(FailureKind),
    /// The quality gate ruled on the output
    Verdict(Decision),
    /// Quality gates are disabled
    GateSkipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageAction {
    /// Run the executor
    Execute,
    /// Ask the quality gate
    Evaluate,
    /// Stage is done, move to the next one
    Advance,
    /// Discard this attempt and dispatch the stage again
    Redispatch,
    /// Fail the whole run
    FailRun(FailureKind),
    /// The event makes no sense in this state
    Invalid(String),
}

pub fn transition(state: StageState, event: StageEvent) -> (StageState, StageAction) {
    use StageStatus::*;

    match (state.status, event) {
        (Pending | RevisionRequested, StageEvent::Dispatch) => (
            StageState {
                status: Running,
                ..state
            },
            StageAction::Execute,
        ),

        (Running, StageEvent::ExecutionSucceeded) => (
            StageState {
                status: Completed,
                ..state
            },
            StageAction::Evaluate,
        ),

        // Gate evaluation can also time out after the stage completed
        (Running | Completed, StageEvent::Aborted(kind)) => (
            StageState {
                status: Failed,
                ..state
            },
            StageAction::FailRun(kind),
        ),

        (Completed, StageEvent::GateSkipped) => (state, StageAction::Advance),

        (Completed, StageEvent::Verdict(decision)) => match decision {
            Decision::Approve => (state, StageAction::Advance),
            Decision::RequestRevision => {
                let retry_count = state.retry_count.saturating_add(1);
                if retry_count >= state.max_retries {
                    (
                        StageState {
                            status: Failed,
                            retry_count,
                            ..state
                        },
                        StageAction::FailRun(FailureKind::MaxRetriesExceeded),
                    )
                } else {
                    (
                        StageState {
                            status: RevisionRequested,
                            retry_count,
                            ..state
                        },
                        StageAction::Redispatch,
                    )
                }
            }
            Decision::Escalate => (
                StageState {
                    status: Failed,
                    ..state
                },
                StageAction::FailRun(FailureKind::Escalated),
            ),
            Decision::Reject => (
                StageState {
                    status: Failed,
                    ..state
                },
                StageAction::FailRun(FailureKind::Rejected),
            ),
        },

        (status, event) => (
            StageState {
                status: Failed,
                ..state
            },
            StageAction::Invalid(format!("{:?} is not valid while {}", event, status)),
        ),
    }
}
