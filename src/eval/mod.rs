use serde::{Deserialize, Serialize};

pub mod engine;
pub mod judge;
pub mod report;

pub use engine::Evaluator;
pub use judge::{Judge, JudgeResponseFormat, JudgeVerdict, LlmJudge, VerdictError};
pub use report::{CaseReport, RunSummary};

/// Fixed pass mark applied to every criterion.
pub const PASS_THRESHOLD: f64 = 0.7;

/// A named natural-language rubric a finished call is graded against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub name: String,
    pub prompt: String,
}

impl Evaluation {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub name: String,
    pub passed: bool,
    pub score: f64,
    pub reason: String,
}

impl EvaluationResult {
    /// Derives `passed` from the score and [`PASS_THRESHOLD`].
    pub fn from_score(name: impl Into<String>, score: f64, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: score >= PASS_THRESHOLD,
            score,
            reason: reason.into(),
        }
    }

    pub fn failure(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            score: 0.0,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_inclusive() {
        assert!(EvaluationResult::from_score("a", 0.7, "").passed);
        assert!(!EvaluationResult::from_score("a", 0.69, "").passed);
        assert!(EvaluationResult::from_score("a", 1.0, "").passed);
    }

    #[test]
    fn failure_scores_zero() {
        let result = EvaluationResult::failure("menu", "judge unavailable");
        assert_eq!(result.score, 0.0);
        assert!(!result.passed);
    }
}
