//! # stagehand-gate
//!
//! Quality gate for Stagehand stages.
//!
//! This crate provides:
//! - The [`GateEvaluator`] trait the pipeline engine calls after each stage
//! - [`QualityGate`], which asks a [`Critic`] for a review and turns the
//!   text into a [`stagehand_core::GateDecision`]
//! - Critique parsing and the score / critical-finding policy
//!
//! Evaluation never fails on bad critic output: anything that cannot be
//! turned into a decision becomes an `escalate` with score 0.

mod critic;
mod gate;
mod parse;
mod policy;

pub use critic::{Critic, CritiqueRequest};
pub use gate::{GateContext, GateEvaluator, QualityGate};
pub use parse::{extract_json, parse_critique, ParsedCritique};
pub use policy::GatePolicy;
