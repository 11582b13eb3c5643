use std::sync::Arc;

use crate::{
    agents::AgentConfig,
    conversation::ConversationSpec,
    eval::Evaluation,
    runner::TestResult,
    suite::ProviderRegistry,
    transcript::Transcript,
    LLMError,
};

#[derive(Debug, thiserror::Error)]
pub enum RerunError {
    #[error("test {test_id} has no first message in its transcript")]
    MissingFirstMessage { test_id: u64 },
    #[error(transparent)]
    Provider(#[from] LLMError),
}

/// Replays earlier tests against a new service agent. Customer side, call
/// type, opening line and criteria are taken from each prior result.
pub fn rerun_specs(
    service_config: &AgentConfig,
    prior: &[TestResult],
    registry: &ProviderRegistry,
) -> Result<Vec<ConversationSpec>, RerunError> {
    let service_provider = registry.resolve(service_config.provider)?;

    prior
        .iter()
        .map(|result| {
            let transcript = Transcript::parse(&result.transcript);
            let first_message = transcript
                .first_message()
                .filter(|message| !message.is_empty())
                .ok_or(RerunError::MissingFirstMessage {
                    test_id: result.test_id,
                })?
                .to_string();

            let customer_provider = registry.resolve(result.customer_config.provider)?;

            Ok(ConversationSpec::new(
                service_config.clone(),
                Arc::clone(&service_provider),
                result.customer_config.clone(),
                customer_provider,
                result.call_type,
                first_message,
            )
            .with_evaluations(prior_evaluations(result)))
        })
        .collect()
}

fn prior_evaluations(result: &TestResult) -> Vec<Evaluation> {
    if !result.evaluations.is_empty() {
        return result.evaluations.clone();
    }

    // Records written before criteria were stored only carry the judge's
    // reasons; reuse them as prompts.
    result
        .evaluation_results
        .iter()
        .map(|evaluation| Evaluation::new(&evaluation.name, &evaluation.reason))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conversation::{CallType, EndReason},
        eval::EvaluationResult,
        providers::{scripted::ScriptedProvider, ProviderKind},
        runner::TestStatus,
    };

    fn prior(test_id: u64, transcript: &str, evaluations: Vec<Evaluation>) -> TestResult {
        TestResult {
            test_id,
            call_type: CallType::Outbound,
            status: TestStatus::Completed,
            error: None,
            transcript: transcript.to_string(),
            end_reason: Some(EndReason::EndCall),
            evaluation_results: vec![EvaluationResult::from_score("Menu", 0.4, "Menu was not itemised.")],
            evaluations,
            service_config: AgentConfig::new("gpt-4o-mini", "old prompt"),
            customer_config: AgentConfig::new("llama-3.3-70b-versatile", "You are cheerful.")
                .with_provider(ProviderKind::Groq)
                .with_end_call(true),
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new().with_fallback(Arc::new(ScriptedProvider::constant("ok")))
    }

    #[test]
    fn keeps_customer_side_and_swaps_service() {
        let new_service = AgentConfig::new("claude-3-5-sonnet", "new prompt").with_provider(ProviderKind::Anthropic);
        let specs = rerun_specs(
            &new_service,
            &[prior(
                7,
                "Service: Hi, what would you like to order?\n\nCustomer: A large pizza.",
                vec![Evaluation::new("Menu", "List one item per line.")],
            )],
            &registry(),
        )
        .unwrap();

        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.service_config.system_prompt, "new prompt");
        assert_eq!(spec.customer_config.params.model, "llama-3.3-70b-versatile");
        assert_eq!(spec.call_type, CallType::Outbound);
        assert_eq!(spec.first_message, "Hi, what would you like to order?");
        assert_eq!(spec.evaluations[0].prompt, "List one item per line.");
    }

    #[test]
    fn legacy_records_fall_back_to_reasons() {
        let specs = rerun_specs(
            &AgentConfig::new("m", "p"),
            &[prior(1, "Customer: Hi", Vec::new())],
            &registry(),
        )
        .unwrap();

        assert_eq!(specs[0].evaluations, vec![Evaluation::new("Menu", "Menu was not itemised.")]);
    }

    #[test]
    fn empty_transcript_is_rejected() {
        let error = rerun_specs(&AgentConfig::new("m", "p"), &[prior(3, "", Vec::new())], &registry())
            .unwrap_err();
        assert!(matches!(error, RerunError::MissingFirstMessage { test_id: 3 }));
    }
}
