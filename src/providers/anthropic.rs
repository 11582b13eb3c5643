use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::LLMError,
    providers::{LLMProvider, ProviderKind, ProviderSettings},
    tools::{FunctionCall, Tool, ToolCall},
    types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage},
};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;
/// Sent as the opening user turn when a history starts with the assistant,
/// since the messages API rejects that shape.
const CALL_CONNECTED: &str = "(call connected)";

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: ProviderKind::Anthropic.default_base_url().to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Anthropic {
    client: Client,
    config: AnthropicConfig,
}

impl Anthropic {
    pub fn new(api_key: impl Into<String>) -> Result<Self, LLMError> {
        Self::from_config(AnthropicConfig::new(api_key))
    }

    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, LLMError> {
        Self::from_config(AnthropicConfig {
            api_key: settings.api_key.clone(),
            base_url: settings.base_url().to_string(),
            request_timeout: settings.request_timeout,
        })
    }

    pub fn from_config(config: AnthropicConfig) -> Result<Self, LLMError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequestBody {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: Value,
}

impl From<Tool> for AnthropicTool {
    fn from(tool: Tool) -> Self {
        Self {
            input_schema: tool.function.parameters.to_value(),
            name: tool.function.name,
            description: tool.function.description,
        }
    }
}

impl From<CompletionRequest> for MessagesRequestBody {
    fn from(request: CompletionRequest) -> Self {
        let (system, messages) = split_messages(request.messages);
        Self {
            model: request.model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages,
            temperature: request.temperature,
            top_p: request.top_p,
            tools: request.tools.into_iter().map(AnthropicTool::from).collect(),
            extra: request.extra,
        }
    }
}

/// Pulls system prompts out of the history and folds the rest into the
/// strictly alternating user/assistant shape the messages API expects.
fn split_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_parts = Vec::new();
    let mut folded: Vec<AnthropicMessage> = Vec::new();

    for message in messages {
        let text = message.content.unwrap_or_default();
        let role = match message.role {
            MessageRole::System => {
                system_parts.push(text);
                continue;
            }
            MessageRole::Assistant => "assistant",
            MessageRole::User | MessageRole::Tool => "user",
        };

        if text.trim().is_empty() {
            continue;
        }

        match folded.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&text);
            }
            _ => folded.push(AnthropicMessage { role, content: text }),
        }
    }

    if folded.first().map_or(true, |first| first.role != "user") {
        folded.insert(
            0,
            AnthropicMessage {
                role: "user",
                content: CALL_CONNECTED.to_string(),
            },
        );
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    (system, folded)
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, #[serde(default)] input: Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorEnvelope {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    message: String,
}

impl MessagesResponse {
    fn into_completion(self) -> CompletionResponse {
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        for block in self.content {
            match block {
                ContentBlock::Text { text: chunk } => text.push_str(&chunk),
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall::new(FunctionCall::new(name, input)).with_id(id));
                }
                ContentBlock::Other => {}
            }
        }

        let mut message = ChatMessage::assistant(text).with_tool_calls(tool_calls);
        if message.text().map_or(false, str::is_empty) {
            message.content = None;
        }

        CompletionResponse {
            message,
            usage: self.usage.map(|usage| TokenUsage {
                prompt_tokens: usage.input_tokens,
                completion_tokens: usage.output_tokens,
                total_tokens: usage.input_tokens + usage.output_tokens,
            }),
        }
    }
}

#[async_trait]
impl LLMProvider for Anthropic {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let body = MessagesRequestBody::from(request);

        let builder = self
            .with_default_headers(self.client.post(self.endpoint("messages")))
            .json(&body);

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await?;
            if let Ok(error) = serde_json::from_str::<AnthropicErrorEnvelope>(&text) {
                return Err(LLMError::Provider(error.error.message));
            }

            return Err(LLMError::Provider(format!("unexpected status {status}: {text}")));
        }

        let parsed: MessagesResponse = response.json().await?;
        Ok(parsed.into_completion())
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}
