use std::sync::Arc;

use futures_util::future::join_all;

use crate::{
    eval::{
        judge::{parse_verdict, Judge, JudgeResponseFormat, LlmJudge},
        Evaluation, EvaluationResult, PASS_THRESHOLD,
    },
    LLMProvider,
};

/// Grades a finished transcript against a list of criteria, one judge call
/// per criterion, all in flight at once.
#[derive(Clone)]
pub struct Evaluator {
    judge: Arc<dyn Judge>,
}

impl Evaluator {
    pub fn new(judge: Arc<dyn Judge>) -> Self {
        Self { judge }
    }

    pub fn with_llm_judge(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self::new(Arc::new(LlmJudge::new(provider, model)))
    }

    pub fn with_llm_judge_format(
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
        response_format: JudgeResponseFormat,
    ) -> Self {
        Self::new(Arc::new(
            LlmJudge::new(provider, model).with_response_format(response_format),
        ))
    }

    /// Returns exactly one result per criterion, in input order. Judge
    /// failures and unparsable verdicts become zero-score failures.
    pub async fn evaluate(&self, transcript: &str, evaluations: &[Evaluation]) -> Vec<EvaluationResult> {
        let pending = evaluations
            .iter()
            .map(|evaluation| self.evaluate_one(transcript, evaluation));

        join_all(pending).await
    }

    async fn evaluate_one(&self, transcript: &str, evaluation: &Evaluation) -> EvaluationResult {
        let raw = match self.judge.judge(transcript, &evaluation.prompt).await {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(evaluation = %evaluation.name, %error, "judge call failed");
                return EvaluationResult::failure(
                    &evaluation.name,
                    format!("Evaluation call failed: {error}"),
                );
            }
        };

        match parse_verdict(&raw) {
            Ok(verdict) => {
                let result = EvaluationResult::from_score(&evaluation.name, verdict.score, verdict.reason);
                if result.passed != verdict.passed {
                    tracing::debug!(
                        evaluation = %evaluation.name,
                        score = verdict.score,
                        judge_passed = verdict.passed,
                        threshold = PASS_THRESHOLD,
                        "judge pass flag disagrees with score; using score"
                    );
                }
                result
            }
            Err(error) => {
                tracing::warn!(evaluation = %evaluation.name, %error, "unparsable judge verdict");
                EvaluationResult::failure(
                    &evaluation.name,
                    format!("Failed to parse evaluation result: {error}"),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use async_trait::async_trait;
    use tokio::time::sleep;

    use super::*;
    use crate::LLMError;

    /// Answers by criterion prompt, after an optional delay.
    struct TableJudge {
        answers: HashMap<String, (Result<String, String>, u64)>,
    }

    impl TableJudge {
        fn new(entries: Vec<(&str, Result<&str, &str>, u64)>) -> Self {
            let answers = entries
                .into_iter()
                .map(|(prompt, answer, delay)| {
                    (
                        prompt.to_string(),
                        (answer.map(str::to_string).map_err(str::to_string), delay),
                    )
                })
                .collect();
            Self { answers }
        }
    }

    #[async_trait]
    impl Judge for TableJudge {
        async fn judge(&self, _transcript: &str, criterion: &str) -> Result<String, LLMError> {
            let (answer, delay) = self
                .answers
                .get(criterion)
                .cloned()
                .unwrap_or_else(|| (Err("no answer".to_string()), 0));
            sleep(Duration::from_millis(delay)).await;
            answer.map_err(LLMError::Provider)
        }
    }

    fn criteria() -> Vec<Evaluation> {
        vec![
            Evaluation::new("menu", "slow"),
            Evaluation::new("empathy", "fast"),
            Evaluation::new("broken", "garbage"),
            Evaluation::new("offline", "down"),
        ]
    }

    fn judge() -> Evaluator {
        Evaluator::new(Arc::new(TableJudge::new(vec![
            ("slow", Ok(r#"{"score": 0.9, "passed": true, "reason": "structured"}"#), 40),
            ("fast", Ok(r#"{"score": 0.4, "passed": false, "reason": "cold"}"#), 1),
            ("garbage", Ok("I think it went well."), 5),
            ("down", Err("upstream 503"), 0),
        ])))
    }

    #[tokio::test]
    async fn results_are_index_aligned_with_failures_substituted() {
        let results = judge().evaluate("Customer: hi", &criteria()).await;

        let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["menu", "empathy", "broken", "offline"]);

        assert!(results[0].passed);
        assert!(!results[1].passed);

        assert_eq!(results[2].score, 0.0);
        assert!(!results[2].passed);
        assert!(results[2].reason.starts_with("Failed to parse evaluation result"));

        assert_eq!(results[3].score, 0.0);
        assert!(results[3].reason.contains("upstream 503"));
    }

    #[tokio::test]
    async fn passed_follows_score_not_judge_flag() {
        let evaluator = Evaluator::new(Arc::new(TableJudge::new(vec![
            ("a", Ok(r#"{"score": 0.75, "passed": false, "reason": "x"}"#), 0),
            ("b", Ok(r#"{"score": 0.5, "passed": true, "reason": "y"}"#), 0),
        ])));
        let results = evaluator
            .evaluate("t", &[Evaluation::new("a", "a"), Evaluation::new("b", "b")])
            .await;

        for result in &results {
            assert_eq!(result.passed, result.score >= PASS_THRESHOLD);
        }
        assert!(results[0].passed);
        assert!(!results[1].passed);
    }

    #[tokio::test]
    async fn repeated_runs_are_identical() {
        let evaluator = judge();
        let first = evaluator.evaluate("Customer: hi", &criteria()).await;
        let second = evaluator.evaluate("Customer: hi", &criteria()).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_criteria_yield_no_results() {
        assert!(judge().evaluate("t", &[]).await.is_empty());
    }
}
