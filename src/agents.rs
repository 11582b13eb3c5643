use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    providers::ProviderKind,
    tools::{end_call_tool, ToolChoice, END_CALL_TOOL},
    transcript::{Speaker, Turn},
    types::{ChatMessage, CompletionRequest},
    LLMError, LLMProvider,
};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{speaker} agent returned an empty reply")]
    EmptyReply { speaker: Speaker },
    #[error(transparent)]
    Provider(#[from] LLMError),
}

/// Model parameters for one agent. The recognised options are typed; any
/// other provider-specific keys ride along in `extra` and are sent verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ModelParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Immutable configuration for one party of a simulated call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    pub params: ModelParams,
    pub system_prompt: String,
    #[serde(default)]
    pub end_call_enabled: bool,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self::from_params(ModelParams::new(model), system_prompt)
    }

    pub fn from_params(params: ModelParams, system_prompt: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::default(),
            params,
            system_prompt: system_prompt.into(),
            end_call_enabled: false,
        }
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_end_call(mut self, enabled: bool) -> Self {
        self.end_call_enabled = enabled;
        self
    }

    pub fn model(&self) -> &str {
        &self.params.model
    }
}

/// What an agent produced for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTurn {
    pub utterance: String,
    pub end_call: bool,
}

/// One simulated party: a provider plus the config it is driven with.
#[derive(Clone)]
pub struct Agent {
    speaker: Speaker,
    config: Arc<AgentConfig>,
    provider: Arc<dyn LLMProvider>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("speaker", &self.speaker)
            .field("provider", &self.provider.name())
            .field("model", &self.config.params.model)
            .field("end_call_enabled", &self.config.end_call_enabled)
            .finish()
    }
}

impl Agent {
    pub fn new(speaker: Speaker, config: Arc<AgentConfig>, provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            speaker,
            config,
            provider,
        }
    }

    pub fn speaker(&self) -> Speaker {
        self.speaker
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Produces the next utterance given everything said so far.
    pub async fn generate(&self, history: &[Turn]) -> Result<AgentTurn, AgentError> {
        let request = self.build_request(history);
        let response = self.provider.complete(request).await?;

        let utterance = response.message.text().unwrap_or_default().trim().to_string();
        let end_call = self.config.end_call_enabled && response.message.calls_tool(END_CALL_TOOL);

        if utterance.is_empty() && !end_call {
            return Err(AgentError::EmptyReply {
                speaker: self.speaker,
            });
        }

        Ok(AgentTurn { utterance, end_call })
    }

    fn build_request(&self, history: &[Turn]) -> CompletionRequest {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.config.system_prompt.clone()));
        messages.extend(history.iter().map(|turn| {
            if turn.speaker == self.speaker {
                ChatMessage::assistant(turn.text.clone())
            } else {
                ChatMessage::user(turn.text.clone())
            }
        }));

        let params = &self.config.params;
        let mut request =
            CompletionRequest::new(params.model.clone(), messages).with_extra(params.extra.clone());

        if let Some(max_tokens) = params.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        if let Some(temperature) = params.temperature {
            request = request.with_temperature(temperature);
        }

        if let Some(top_p) = params.top_p {
            request = request.with_top_p(top_p);
        }

        if self.config.end_call_enabled {
            request = request
                .with_tool(end_call_tool())
                .with_tool_choice(ToolChoice::auto());
        }

        request
    }
}
