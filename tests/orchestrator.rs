use std::{fs, sync::Arc, time::Duration};

use async_trait::async_trait;
use callsim::{
    eval::{Judge, RunSummary},
    persistence::JsonRunLog,
    providers::scripted::{ScriptedProvider, ScriptedReply},
    AgentConfig, CallType, ChatMessage, CompletionRequest, CompletionResponse, ConversationSpec,
    EndReason, Evaluator, LLMError, LLMProvider, RunOptions, TestRunner, TestStatus,
};

/// Scores any criterion containing "polite" high and everything else low.
struct KeywordJudge;

#[async_trait]
impl Judge for KeywordJudge {
    async fn judge(&self, transcript: &str, criterion: &str) -> Result<String, LLMError> {
        if transcript.is_empty() {
            return Err(LLMError::Provider("empty transcript".into()));
        }
        let score = if criterion.contains("polite") { 0.95 } else { 0.1 };
        Ok(format!(r#"{{"score": {score}, "passed": {}, "reason": "keyword"}}"#, score >= 0.7))
    }
}

/// Fails every call after a short delay.
struct FlakyProvider;

#[async_trait]
impl LLMProvider for FlakyProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Err(LLMError::Provider("503 service unavailable".into()))
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

/// Echoes how many turns it has seen.
struct CountingProvider;

#[async_trait]
impl LLMProvider for CountingProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let seen = request.messages.len() - 1;
        Ok(CompletionResponse::new(ChatMessage::assistant(format!("turn after {seen}"))))
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

fn spec(service: Arc<dyn LLMProvider>, call_type: CallType) -> ConversationSpec {
    ConversationSpec::new(
        AgentConfig::new("gpt-4o-mini", "You are a voice assistant for a pizzeria.").with_end_call(true),
        service,
        AgentConfig::new("gemini-2.0-flash", "You are a hungry customer.").with_end_call(true),
        Arc::new(CountingProvider),
        call_type,
        "Hi, what's on the menu today?",
    )
    .with_evaluation("politeness", "The agent should be polite.")
    .with_evaluation("Menu", "The menu should be itemised.")
}

fn runner() -> TestRunner {
    TestRunner::new(Evaluator::new(Arc::new(KeywordJudge)))
}

#[tokio::test]
async fn failing_provider_is_isolated_to_its_slot() {
    let specs = vec![
        spec(Arc::new(ScriptedProvider::constant("We have pizza.")), CallType::Inbound),
        spec(Arc::new(FlakyProvider), CallType::Inbound),
        spec(
            Arc::new(ScriptedProvider::new(vec![
                ScriptedReply::say("What would you like?"),
                ScriptedReply::hang_up("Great, see you!"),
            ])),
            CallType::Outbound,
        ),
    ];

    let results = runner().run_tests(specs, &RunOptions::new().with_max_turns(4)).await;
    assert_eq!(results.len(), 3);

    let a = &results[&1];
    assert_eq!(a.status, TestStatus::Completed);
    assert_eq!(a.transcript.split("\n\n").count(), 5);
    assert_eq!(a.end_reason, Some(EndReason::MaxTurns));
    assert!(a.evaluation_results[0].passed);
    assert!(!a.evaluation_results[1].passed);

    let b = &results[&2];
    assert_eq!(b.status, TestStatus::Failed);
    assert_eq!(b.end_reason, Some(EndReason::Error));
    assert!(b.error.as_deref().unwrap().contains("503"));
    assert_eq!(b.transcript, "Customer: Hi, what's on the menu today?");

    let c = &results[&3];
    assert_eq!(c.end_reason, Some(EndReason::EndCall));
    assert!(c.transcript.starts_with("Service: Hi, what's on the menu today?"));
    assert!(c.transcript.ends_with("Service: Great, see you!"));

    let summary = RunSummary::from_aggregate(&results);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn persisting_twice_writes_two_run_logs() {
    let dir = tempfile::TempDir::new().unwrap();
    let options = RunOptions::new()
        .with_max_turns(2)
        .with_persist(true)
        .with_csv_log(true)
        .with_logs_dir(dir.path());

    let runner = runner();
    for _ in 0..2 {
        let specs = vec![spec(Arc::new(ScriptedProvider::constant("Pizza.")), CallType::Inbound)];
        runner.run_tests(specs, &options).await;
    }

    let mut runs: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("run_"))
        })
        .collect();
    runs.sort();
    assert_eq!(runs.len(), 2);
    assert_ne!(runs[0], runs[1]);

    let record = JsonRunLog::load(&runs[0]).unwrap();
    assert_eq!(record.tests.len(), 1);
    assert_eq!(record.tests[&1].service_config.params.model, "gpt-4o-mini");

    let csv_logs = fs::read_dir(dir.path())
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .map(|entry| entry.file_name().to_string_lossy().starts_with("evaluation_results_"))
                .unwrap_or(false)
        })
        .count();
    assert_eq!(csv_logs, 2);
}

#[tokio::test]
async fn persistence_failure_still_returns_results() {
    let dir = tempfile::TempDir::new().unwrap();
    let blocker = dir.path().join("logs");
    fs::write(&blocker, "not a directory").unwrap();

    let results = runner()
        .run_tests(
            vec![spec(Arc::new(ScriptedProvider::constant("Pizza.")), CallType::Inbound)],
            &RunOptions::new().with_max_turns(1).with_persist(true).with_logs_dir(&blocker),
        )
        .await;

    assert_eq!(results.len(), 1);
    assert!(results[&1].is_completed());
}
