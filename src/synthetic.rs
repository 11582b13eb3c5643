//! Generates customer personas and opening lines for a given service agent.

use std::sync::Arc;

use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    agents::AgentConfig,
    conversation::{CallType, ConversationSpec},
    eval::judge::strip_code_fence,
    types::{ChatMessage, CompletionRequest},
    LLMError, LLMProvider,
};

/// Scenarios requested per model call.
pub const BATCH_SIZE: usize = 10;

const GENERATOR_SYSTEM_PROMPT: &str = r#"You are a synthetic data generator for customer service scenarios. Your task is to create diverse customer profiles and their initial messages for testing a customer service agent.

For each customer, provide a JSON object in the following format:
{
    "type": "<inbound or outbound>",
    "customer_prompt": "<system prompt for the customer agent>",
    "first_message": "<initial message from the customer>",
    "description": "<brief description of the customer persona and their situation>"
}

Consider diverse customer types:
1. Different emotional states (frustrated, happy, neutral, concerned)
2. Various issue complexities (simple queries to complex problems)
3. Different communication styles (direct, verbose, technical, non-technical)
4. Diverse backgrounds and needs
5. Different levels of urgency

The customer_prompt should follow this template:
"You are a customer <context>.
Your tone is <emotional state>.
Try to <objective>.
IMPORTANT: Use the tool end_call() only when you are satisfied with <success condition>."

Respond with ONLY a JSON array of objects, each representing a unique customer scenario."#;

#[derive(Debug, thiserror::Error)]
pub enum SyntheticError {
    #[error(transparent)]
    Provider(#[from] LLMError),
    #[error("generator returned no content")]
    EmptyResponse,
    #[error("could not parse generated scenarios: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("expected a JSON array of scenarios")]
    NotAnArray,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticDataConfig {
    pub service_prompt: String,
    pub model: String,
    pub num_tests: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_temperature() -> f32 {
    0.8
}

impl SyntheticDataConfig {
    pub fn new(service_prompt: impl Into<String>, model: impl Into<String>, num_tests: usize) -> Self {
        Self {
            service_prompt: service_prompt.into(),
            model: model.into(),
            num_tests,
            max_concurrency: default_max_concurrency(),
            temperature: default_temperature(),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn batch_sizes(&self) -> Vec<usize> {
        let mut remaining = self.num_tests;
        let mut sizes = Vec::new();
        while remaining > 0 {
            let size = remaining.min(BATCH_SIZE);
            sizes.push(size);
            remaining -= size;
        }
        sizes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticScenario {
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub customer_prompt: String,
    pub first_message: String,
    #[serde(default)]
    pub description: String,
}

impl SyntheticScenario {
    /// Builds a runnable spec. The customer inherits `customer_template`'s
    /// model settings with this scenario's prompt swapped in.
    pub fn into_spec(
        self,
        service_config: AgentConfig,
        service_provider: Arc<dyn LLMProvider>,
        customer_template: &AgentConfig,
        customer_provider: Arc<dyn LLMProvider>,
    ) -> ConversationSpec {
        let customer_config = AgentConfig {
            system_prompt: self.customer_prompt,
            ..customer_template.clone()
        };

        ConversationSpec::new(
            service_config,
            service_provider,
            customer_config,
            customer_provider,
            self.call_type,
            self.first_message,
        )
    }
}

pub struct SyntheticDataGenerator {
    config: SyntheticDataConfig,
    provider: Arc<dyn LLMProvider>,
}

impl SyntheticDataGenerator {
    pub fn new(config: SyntheticDataConfig, provider: Arc<dyn LLMProvider>) -> Self {
        Self { config, provider }
    }

    /// Requests scenarios in batches of [`BATCH_SIZE`], at most
    /// `max_concurrency` batches in flight. Failed batches are skipped.
    pub async fn generate(&self) -> Vec<SyntheticScenario> {
        let sizes = self.config.batch_sizes();
        tracing::info!(
            requested = self.config.num_tests,
            batches = sizes.len(),
            "generating synthetic scenarios"
        );

        let batches: Vec<_> = stream::iter(sizes)
            .map(|size| self.generate_batch(size))
            .buffered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let mut scenarios = Vec::with_capacity(self.config.num_tests);
        for (index, batch) in batches.into_iter().enumerate() {
            match batch {
                Ok(batch) => scenarios.extend(batch),
                Err(error) => tracing::warn!(batch = index, %error, "synthetic batch failed"),
            }
        }

        scenarios.truncate(self.config.num_tests);
        tracing::info!(generated = scenarios.len(), "synthetic generation finished");
        scenarios
    }

    pub async fn generate_batch(&self, batch_size: usize) -> Result<Vec<SyntheticScenario>, SyntheticError> {
        let request = CompletionRequest::new(
            self.config.model.clone(),
            vec![
                ChatMessage::system(GENERATOR_SYSTEM_PROMPT),
                ChatMessage::user(format!(
                    "Given this service agent prompt:\n\n{}\n\n\
                     Generate {batch_size} diverse customer scenarios that would interact with this service agent.\n\
                     Make sure the scenarios are realistic and test different aspects of the service agent's capabilities.\n\
                     Ensure the customer prompts align with the service context while maintaining diversity in customer needs and behaviors.",
                    self.config.service_prompt
                )),
            ],
        )
        .with_temperature(self.config.temperature);

        let response = self.provider.complete(request).await?;
        let content = response.message.text().ok_or(SyntheticError::EmptyResponse)?;
        parse_scenarios(content)
    }
}

/// Accepts a bare array, an object holding a `scenarios` array, or either
/// inside a fenced code block. Items that do not decode are skipped.
pub fn parse_scenarios(content: &str) -> Result<Vec<SyntheticScenario>, SyntheticError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(SyntheticError::EmptyResponse);
    }
    let body = strip_code_fence(trimmed).unwrap_or(trimmed);

    let value: Value = serde_json::from_str(body)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("scenarios") {
            Some(Value::Array(items)) => items,
            _ => return Err(SyntheticError::NotAnArray),
        },
        _ => return Err(SyntheticError::NotAnArray),
    };

    let total = items.len();
    let scenarios: Vec<SyntheticScenario> = items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value(item) {
            Ok(scenario) => Some(scenario),
            Err(error) => {
                tracing::warn!(item = index, %error, "skipping malformed scenario");
                None
            }
        })
        .collect();

    if total > 0 && scenarios.is_empty() {
        tracing::warn!(items = total, "no usable scenarios in batch");
    }

    Ok(scenarios)
}
