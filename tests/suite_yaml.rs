use std::{path::PathBuf, sync::Arc};

use callsim::{
    providers::scripted::ScriptedProvider, CallType, Evaluator, ProviderKind, ProviderRegistry,
    RunOptions, TestRunner, TestSuite,
};

fn demo_suite() -> TestSuite {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/suites/pizzeria.yaml");
    TestSuite::from_path(path).expect("failed to load demo suite")
}

#[test]
fn demo_suite_parses_and_renders() {
    let suite = demo_suite();

    assert_eq!(suite.run.max_turns, 12);
    assert_eq!(suite.agents.len(), 4);
    assert_eq!(suite.agents["pizzeria_outbound"].provider, ProviderKind::Anthropic);

    let agents = suite.rendered_agents().unwrap();
    assert!(agents["pizzeria"]
        .system_prompt
        .starts_with("You are a voice assistant for Vappy's Pizzeria"));
    assert!(!agents["pizzeria"].system_prompt.contains("{{"));
}

#[test]
fn demo_suite_builds_one_spec_per_repeat() {
    let suite = demo_suite();
    let registry = ProviderRegistry::new().with_fallback(Arc::new(ScriptedProvider::constant("ok")));

    let specs = suite.build_specs(&registry).unwrap();

    assert_eq!(specs.len(), 4);
    assert_eq!(specs[1].call_type, CallType::Outbound);
    assert_eq!(specs[1].first_message, "Hi, this is Vappy's Pizzeria. What would you like to order?");
    assert_eq!(specs[3].first_message, "Hi, I'm so hungry");
}

#[test]
fn live_suite_needs_api_keys() {
    let suite = demo_suite();
    assert!(suite.build_specs(&ProviderRegistry::new()).is_err());
}

#[tokio::test]
async fn demo_suite_runs_end_to_end_with_scripted_providers() {
    let suite = demo_suite();
    let registry =
        ProviderRegistry::new().with_fallback(Arc::new(ScriptedProvider::constant("Sure thing.")));
    let evaluator = Evaluator::with_llm_judge(
        Arc::new(ScriptedProvider::constant(
            r#"{"score": 0.8, "passed": true, "reason": "fine"}"#,
        )),
        suite.run.eval_model.clone(),
    );

    let specs = suite.build_specs(&registry).unwrap();
    let options = RunOptions::new().with_max_turns(3);
    let results = TestRunner::new(evaluator).run_tests(specs, &options).await;

    assert_eq!(results.len(), 4);
    for result in results.values() {
        assert!(result.is_completed());
        assert_eq!(result.transcript.split("\n\n").count(), 4);
        assert_eq!(result.evaluation_results.len(), 2);
        assert!(result.all_passed());
    }
}
