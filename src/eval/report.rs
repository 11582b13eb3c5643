use serde::Serialize;

use crate::runner::{RunAggregate, TestStatus};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Completed tests where every criterion passed.
    pub passed: usize,
    pub cases: Vec<CaseReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub test_id: u64,
    pub pass: bool,
    pub failures: Vec<String>,
}

impl RunSummary {
    pub fn from_aggregate(aggregate: &RunAggregate) -> Self {
        let cases: Vec<CaseReport> = aggregate
            .values()
            .map(|result| {
                let mut failures = Vec::new();
                if result.status == TestStatus::Failed {
                    failures.push(
                        result
                            .error
                            .clone()
                            .unwrap_or_else(|| "test failed".to_string()),
                    );
                }
                failures.extend(
                    result
                        .evaluation_results
                        .iter()
                        .filter(|evaluation| !evaluation.passed)
                        .map(|evaluation| {
                            format!("{} ({:.2}): {}", evaluation.name, evaluation.score, evaluation.reason)
                        }),
                );

                CaseReport {
                    test_id: result.test_id,
                    pass: failures.is_empty(),
                    failures,
                }
            })
            .collect();

        let completed = aggregate.values().filter(|result| result.is_completed()).count();

        Self {
            total: aggregate.len(),
            completed,
            failed: aggregate.len() - completed,
            passed: cases.iter().filter(|case| case.pass).count(),
            cases,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}
