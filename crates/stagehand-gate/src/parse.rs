//! Turning critic text into a structured verdict

use regex::Regex;
use serde::Deserialize;
use stagehand_core::{Decision, Finding, GateDecision, Result, Severity, StageId, StagehandError};
use std::sync::OnceLock;

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?[ \t]*\r?\n(.*?)```").expect("fence pattern is valid")
    })
}

/// Pull the JSON document out of a critic response
///
/// Prefers the first fenced block, then the outermost `{...}` span, then the
/// whole text.
pub fn extract_json(text: &str) -> &str {
    if let Some(body) = fence_regex().captures(text).and_then(|c| c.get(1)) {
        return body.as_str().trim();
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text.trim(),
    }
}

#[derive(Debug, Deserialize)]
struct RawCritique {
    decision: String,
    score: f64,
    #[serde(default)]
    feedback: String,
    #[serde(default, alias = "issues")]
    findings: Vec<RawFinding>,
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    severity: String,
    #[serde(default, alias = "type")]
    category: String,
    description: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    recommendation: String,
}

/// A critique that parsed cleanly
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCritique {
    pub decision: Decision,
    pub score: u8,
    pub feedback: String,
    pub findings: Vec<Finding>,
}

impl ParsedCritique {
    pub fn into_decision(self, stage: StageId) -> GateDecision {
        GateDecision::new(stage, self.decision, u32::from(self.score), self.feedback)
            .with_findings(self.findings)
    }
}

fn parse_severity(raw: &str) -> Result<Severity> {
    match raw.trim().to_lowercase().as_str() {
        "critical" | "blocker" => Ok(Severity::Critical),
        "major" | "high" => Ok(Severity::Major),
        "minor" | "medium" | "low" => Ok(Severity::Minor),
        "suggestion" | "info" => Ok(Severity::Suggestion),
        other => Err(StagehandError::EvaluationUnparseable(format!(
            "unknown severity '{}'",
            other
        ))),
    }
}

/// Parse a critic response into a decision, score and findings
///
/// Scores are rounded and clamped to 0-100. Anything that does not carry a
/// recognizable decision and numeric score is `EvaluationUnparseable`.
pub fn parse_critique(text: &str) -> Result<ParsedCritique> {
    let json = extract_json(text);
    let raw: RawCritique = serde_json::from_str(json)
        .map_err(|e| StagehandError::EvaluationUnparseable(format!("invalid critique JSON: {}", e)))?;

    let decision = raw
        .decision
        .parse::<Decision>()
        .map_err(StagehandError::EvaluationUnparseable)?;

    if !raw.score.is_finite() {
        return Err(StagehandError::EvaluationUnparseable(
            "score is not a finite number".to_string(),
        ));
    }
    let score = raw.score.round().clamp(0.0, 100.0) as u8;

    let findings = raw
        .findings
        .into_iter()
        .map(|f| {
            let mut finding = Finding::new(parse_severity(&f.severity)?, f.category, f.description)
                .with_recommendation(f.recommendation);
            if let Some(location) = f.location {
                finding = finding.with_location(location);
            }
            Ok(finding)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ParsedCritique {
        decision,
        score,
        feedback: raw.feedback,
        findings,
    })
}
