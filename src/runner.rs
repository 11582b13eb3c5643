use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::{
    agents::AgentConfig,
    conversation::{CallType, Conversation, ConversationSpec, EndReason, DEFAULT_MAX_TURNS},
    eval::{Evaluation, EvaluationResult, Evaluator},
    persistence::{default_logs_dir, CsvResultLog, JsonRunLog, ResultStore, RunRecord},
};

/// Results of one run keyed by test id.
pub type RunAggregate = BTreeMap<u64, TestResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[default]
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: u64,
    pub call_type: CallType,
    #[serde(default)]
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub transcript: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    pub evaluation_results: Vec<EvaluationResult>,
    #[serde(default)]
    pub evaluations: Vec<Evaluation>,
    pub service_config: AgentConfig,
    pub customer_config: AgentConfig,
}

impl TestResult {
    pub fn is_completed(&self) -> bool {
        self.status == TestStatus::Completed
    }

    /// True when the call completed and every criterion passed.
    pub fn all_passed(&self) -> bool {
        self.is_completed() && self.evaluation_results.iter().all(|result| result.passed)
    }

    fn failed(snapshot: &SpecSnapshot, test_id: u64, transcript: String, error: String) -> Self {
        Self {
            test_id,
            call_type: snapshot.call_type,
            status: TestStatus::Failed,
            error: Some(error),
            transcript,
            end_reason: Some(EndReason::Error),
            evaluation_results: Vec::new(),
            evaluations: snapshot.evaluations.clone(),
            service_config: snapshot.service_config.clone(),
            customer_config: snapshot.customer_config.clone(),
        }
    }
}

/// Config copies taken before dispatch so a crashed task still gets a slot.
#[derive(Debug, Clone)]
struct SpecSnapshot {
    call_type: CallType,
    evaluations: Vec<Evaluation>,
    service_config: AgentConfig,
    customer_config: AgentConfig,
}

impl From<&ConversationSpec> for SpecSnapshot {
    fn from(spec: &ConversationSpec) -> Self {
        Self {
            call_type: spec.call_type,
            evaluations: spec.evaluations.clone(),
            service_config: spec.service_config.as_ref().clone(),
            customer_config: spec.customer_config.as_ref().clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_turns: usize,
    pub persist: bool,
    pub logs_dir: PathBuf,
    /// Also append legacy per-test CSV rows when persisting.
    pub csv_log: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            persist: false,
            logs_dir: default_logs_dir(),
            csv_log: false,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_logs_dir(mut self, logs_dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = logs_dir.into();
        self
    }

    pub fn with_csv_log(mut self, csv_log: bool) -> Self {
        self.csv_log = csv_log;
        self
    }
}

/// Runs many simulated calls concurrently and grades each one.
///
/// Every spec becomes its own task. A task that errors or panics only
/// affects its own slot in the returned aggregate; siblings always finish.
pub struct TestRunner {
    evaluator: Evaluator,
    stores: Vec<Arc<dyn ResultStore>>,
}

impl TestRunner {
    pub fn new(evaluator: Evaluator) -> Self {
        Self {
            evaluator,
            stores: Vec::new(),
        }
    }

    /// Persist through `store` instead of the default log writers.
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.stores.push(store);
        self
    }

    pub async fn run_tests(&self, specs: Vec<ConversationSpec>, options: &RunOptions) -> RunAggregate {
        tracing::info!(tests = specs.len(), max_turns = options.max_turns, "starting test run");

        let mut snapshots = Vec::with_capacity(specs.len());
        let mut handles = Vec::with_capacity(specs.len());

        for (index, spec) in specs.into_iter().enumerate() {
            let test_id = index as u64 + 1;
            snapshots.push(SpecSnapshot::from(&spec));

            let evaluator = self.evaluator.clone();
            let span = tracing::info_span!("test", test_id);
            handles.push(tokio::spawn(
                run_single_test(evaluator, test_id, spec, options.max_turns).instrument(span),
            ));
        }

        // Join barrier: nothing touches the aggregate until every task is done.
        let outcomes = join_all(handles).await;

        let mut aggregate = RunAggregate::new();
        for ((index, outcome), snapshot) in outcomes.into_iter().enumerate().zip(&snapshots) {
            let test_id = index as u64 + 1;
            let result = match outcome {
                Ok(result) => result,
                Err(join_error) => {
                    tracing::error!(test_id, error = %join_error, "test task crashed");
                    TestResult::failed(
                        snapshot,
                        test_id,
                        String::new(),
                        format!("test task crashed: {join_error}"),
                    )
                }
            };
            aggregate.insert(test_id, result);
        }

        let completed = aggregate.values().filter(|result| result.is_completed()).count();
        tracing::info!(
            tests = aggregate.len(),
            completed,
            failed = aggregate.len() - completed,
            "test run finished"
        );

        if options.persist {
            self.persist(&aggregate, options).await;
        }

        aggregate
    }

    /// Stores write synchronously, so they run on the blocking pool.
    async fn persist(&self, aggregate: &RunAggregate, options: &RunOptions) {
        let record = RunRecord::new(aggregate.clone());

        let stores: Vec<Arc<dyn ResultStore>> = if self.stores.is_empty() {
            let mut defaults: Vec<Arc<dyn ResultStore>> =
                vec![Arc::new(JsonRunLog::new(&options.logs_dir))];
            if options.csv_log {
                defaults.push(Arc::new(CsvResultLog::new(&options.logs_dir)));
            }
            defaults
        } else {
            self.stores.clone()
        };

        let written = tokio::task::spawn_blocking(move || {
            stores
                .iter()
                .map(|store| store.record_run(&record))
                .collect::<Vec<_>>()
        })
        .await;

        match written {
            Ok(outcomes) => {
                for outcome in outcomes {
                    match outcome {
                        Ok(path) => tracing::info!(path = %path.display(), "saved run results"),
                        Err(error) => tracing::error!(%error, "failed to save run results"),
                    }
                }
            }
            Err(error) => tracing::error!(%error, "result store task aborted"),
        }
    }
}

async fn run_single_test(
    evaluator: Evaluator,
    test_id: u64,
    spec: ConversationSpec,
    max_turns: usize,
) -> TestResult {
    let snapshot = SpecSnapshot::from(&spec);
    let mut conversation = Conversation::new(&spec).with_max_turns(max_turns);

    let run = match conversation.run().await {
        Ok(run) => run,
        Err(error) => {
            tracing::error!(%error, "conversation failed");
            let transcript = error
                .partial_transcript()
                .map(|transcript| transcript.render())
                .unwrap_or_default();
            return TestResult::failed(&snapshot, test_id, transcript, error.to_string());
        }
    };

    let transcript = run.transcript.render();
    let evaluation_results = evaluator.evaluate(&transcript, &spec.evaluations).await;

    tracing::info!(
        turns = run.transcript.len(),
        end_reason = %run.end_reason,
        passed = evaluation_results.iter().filter(|result| result.passed).count(),
        evaluations = evaluation_results.len(),
        "test finished"
    );

    TestResult {
        test_id,
        call_type: spec.call_type,
        status: TestStatus::Completed,
        error: None,
        transcript,
        end_reason: Some(run.end_reason),
        evaluation_results,
        evaluations: snapshot.evaluations,
        service_config: snapshot.service_config,
        customer_config: snapshot.customer_config,
    }
}
