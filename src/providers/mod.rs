use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{CompletionRequest, CompletionResponse};
use crate::LLMError;

pub mod anthropic;
pub mod openai;
pub mod scripted;

/// One LLM backend. Implementations must be stateless between calls so a
/// single instance can serve many concurrent conversations.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    #[serde(alias = "togetherai")]
    Together,
    Groq,
    DeepSeek,
    Cerebras,
    #[serde(alias = "grok")]
    XAI,
    Gemini,
    OpenRouter,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 9] = [
        ProviderKind::OpenAI,
        ProviderKind::Anthropic,
        ProviderKind::Together,
        ProviderKind::Groq,
        ProviderKind::DeepSeek,
        ProviderKind::Cerebras,
        ProviderKind::XAI,
        ProviderKind::Gemini,
        ProviderKind::OpenRouter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Together => "together",
            ProviderKind::Groq => "groq",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Cerebras => "cerebras",
            ProviderKind::XAI => "xai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenRouter => "openrouter",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Together => "https://api.together.xyz/v1",
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::Cerebras => "https://api.cerebras.ai/v1",
            ProviderKind::XAI => "https://api.x.ai/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }

    /// Environment variable the binaries read this provider's key from.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::Together => "TOGETHER_API_KEY",
            ProviderKind::Groq => "GROQ_API_KEY",
            ProviderKind::DeepSeek => "DEEPSEEK_API_KEY",
            ProviderKind::Cerebras => "CEREBRAS_API_KEY",
            ProviderKind::XAI => "XAI_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::OpenRouter => "OPENROUTER_API_KEY",
        }
    }
}

impl Default for ProviderKind {
    fn default() -> Self {
        ProviderKind::OpenAI
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = LLMError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .or(match normalized.as_str() {
                "togetherai" => Some(ProviderKind::Together),
                "grok" => Some(ProviderKind::XAI),
                _ => None,
            })
            .ok_or_else(|| LLMError::Provider(format!("unknown provider '{value}'")))
    }
}

/// Everything needed to construct a provider client. Credentials are passed
/// in explicitly; nothing here reads the process environment.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: Option<String>,
    pub request_timeout: Duration,
}

impl ProviderSettings {
    pub fn new(kind: ProviderKind, api_key: impl Into<String>) -> Self {
        Self {
            kind,
            api_key: api_key.into(),
            base_url: None,
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_base_url())
    }
}

pub fn build_provider(settings: ProviderSettings) -> Result<Arc<dyn LLMProvider>, LLMError> {
    if settings.api_key.trim().is_empty() {
        return Err(LLMError::MissingApiKey(settings.kind.api_key_env()));
    }

    match settings.kind {
        ProviderKind::Anthropic => {
            Ok(Arc::new(anthropic::Anthropic::from_settings(&settings)?) as Arc<dyn LLMProvider>)
        }
        _ => Ok(Arc::new(openai::OpenAI::from_settings(&settings)?) as Arc<dyn LLMProvider>),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_names_and_aliases() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAI);
        assert_eq!("togetherai".parse::<ProviderKind>().unwrap(), ProviderKind::Together);
        assert_eq!("grok".parse::<ProviderKind>().unwrap(), ProviderKind::XAI);
        assert!("watson".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn serde_names_match_display() {
        for kind in ProviderKind::ALL {
            let encoded = serde_json::to_value(kind).unwrap();
            assert_eq!(encoded, serde_json::Value::String(kind.to_string()));
        }
    }

    #[test]
    fn refuses_to_build_without_key() {
        let error = build_provider(ProviderSettings::new(ProviderKind::Groq, "  ")).err().unwrap();
        assert!(matches!(error, LLMError::MissingApiKey("GROQ_API_KEY")));
    }
}
