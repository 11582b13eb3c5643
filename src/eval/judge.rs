use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    providers::ProviderKind,
    types::{ChatMessage, CompletionRequest},
    LLMError, LLMProvider,
};

const JUDGE_SYSTEM_PROMPT: &str = r#"You are an evaluator. Your task is to analyze transcripts and provide structured evaluations.

You must respond with ONLY a JSON object in the following format, with no additional text or explanation:
{
    "score": <float between 0.0 and 1.0>,
    "passed": <true if score >= 0.7, false otherwise>,
    "reason": "<detailed explanation for the score>"
}

Rules:
1. score must be a decimal number between 0.0 and 1.0 (1.0 is perfect, 0.0 is complete failure)
2. passed must be a boolean (true/false) based on whether score >= 0.7
3. reason must be a clear explanation justifying the score
4. Response must contain ONLY the JSON object - no other text
5. JSON must use double quotes and exact key names as shown above"#;

const DEFAULT_JUDGE_MAX_TOKENS: u32 = 1024;

/// Scores one transcript against one criterion. Returns the judge's raw
/// structured response; parsing is the caller's job.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, transcript: &str, criterion: &str) -> Result<String, LLMError>;
}

/// What the judge is required to answer with.
#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct JudgeVerdict {
    /// Between 0.0 (complete failure) and 1.0 (perfect).
    pub score: f64,
    pub passed: bool,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum VerdictError {
    #[error("empty response")]
    Empty,
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("score {0} is outside 0.0..=1.0")]
    ScoreOutOfRange(f64),
}

/// Parses a judge response. The response must be a single JSON object,
/// optionally wrapped in one fenced code block.
pub fn parse_verdict(raw: &str) -> Result<JudgeVerdict, VerdictError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(VerdictError::Empty);
    }

    let body = strip_code_fence(trimmed).unwrap_or(trimmed);
    let verdict: JudgeVerdict = serde_json::from_str(body)?;

    if !(0.0..=1.0).contains(&verdict.score) {
        return Err(VerdictError::ScoreOutOfRange(verdict.score));
    }

    Ok(verdict)
}

pub(crate) fn strip_code_fence(content: &str) -> Option<&str> {
    let rest = content.strip_prefix("```")?;
    let body_start = rest.find('\n')?;
    let body = rest[body_start + 1..].trim_end();
    let body = body.strip_suffix("```")?;
    Some(body.trim())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeResponseFormat {
    /// `json_schema` generated from [`JudgeVerdict`].
    #[default]
    JsonSchema,
    JsonObject,
    /// No response format; rely on the system prompt alone.
    Text,
}

impl JudgeResponseFormat {
    /// The strictest format `kind` accepts. DeepSeek only takes
    /// `json_object`; the Anthropic client sends no response format at all.
    pub fn for_provider(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::DeepSeek => JudgeResponseFormat::JsonObject,
            ProviderKind::Anthropic => JudgeResponseFormat::Text,
            _ => JudgeResponseFormat::JsonSchema,
        }
    }

    fn to_value(self) -> Option<Value> {
        match self {
            JudgeResponseFormat::JsonSchema => {
                let mut schema = serde_json::to_value(schemars::schema_for!(JudgeVerdict)).ok()?;
                if let Some(object) = schema.as_object_mut() {
                    object.remove("$schema");
                }
                Some(json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": "judge_verdict",
                        "schema": schema,
                        "strict": false
                    }
                }))
            }
            JudgeResponseFormat::JsonObject => Some(json!({ "type": "json_object" })),
            JudgeResponseFormat::Text => None,
        }
    }
}

/// A [`Judge`] backed by an LLM.
#[derive(Clone)]
pub struct LlmJudge {
    provider: Arc<dyn LLMProvider>,
    model: String,
    max_tokens: u32,
    response_format: JudgeResponseFormat,
}

impl LlmJudge {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens: DEFAULT_JUDGE_MAX_TOKENS,
            response_format: JudgeResponseFormat::default(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_response_format(mut self, response_format: JudgeResponseFormat) -> Self {
        self.response_format = response_format;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, transcript: &str, criterion: &str) -> CompletionRequest {
        let messages = vec![
            ChatMessage::system(JUDGE_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Evaluate this transcript for: {criterion}\n\nTranscript:\n{transcript}"
            )),
        ];

        let mut request = CompletionRequest::new(self.model.clone(), messages)
            .with_temperature(0.0)
            .with_max_tokens(self.max_tokens);

        if let Some(format) = self.response_format.to_value() {
            request = request.with_response_format(format);
        }

        request
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn judge(&self, transcript: &str, criterion: &str) -> Result<String, LLMError> {
        let response = self
            .provider
            .complete(self.build_request(transcript, criterion))
            .await?;

        response
            .message
            .text()
            .map(str::to_string)
            .ok_or(LLMError::InvalidResponse("judge response had no text content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::ScriptedProvider;

    #[test]
    fn parses_plain_and_fenced_verdicts() {
        let plain = parse_verdict(r#"{"score": 0.8, "passed": true, "reason": "clear menu"}"#).unwrap();
        assert_eq!(plain.score, 0.8);

        let fenced = parse_verdict("```json\n{\"score\": 0.2, \"passed\": false, \"reason\": \"rude\"}\n```").unwrap();
        assert_eq!(fenced.reason, "rude");
    }

    #[test]
    fn rejects_prose_missing_fields_and_bad_types() {
        assert!(matches!(
            parse_verdict("Sure! {\"score\": 1, \"passed\": true, \"reason\": \"ok\"}"),
            Err(VerdictError::Json(_))
        ));
        assert!(parse_verdict(r#"{"score": 0.9, "reason": "no passed"}"#).is_err());
        assert!(parse_verdict(r#"{"score": "0.9", "passed": true, "reason": "x"}"#).is_err());
        assert!(matches!(parse_verdict("  "), Err(VerdictError::Empty)));
    }

    #[test]
    fn rejects_scores_outside_unit_range() {
        assert!(matches!(
            parse_verdict(r#"{"score": 7, "passed": true, "reason": "x"}"#),
            Err(VerdictError::ScoreOutOfRange(_))
        ));
    }

    #[test]
    fn schema_format_names_required_fields() {
        let format = JudgeResponseFormat::JsonSchema.to_value().unwrap();
        let required = format["json_schema"]["schema"]["required"].as_array().unwrap();
        assert_eq!(required.len(), 3);
        assert!(format["json_schema"]["schema"].get("$schema").is_none());
        assert!(JudgeResponseFormat::Text.to_value().is_none());
    }

    #[test]
    fn format_defaults_follow_provider_and_parse_from_config() {
        assert_eq!(
            JudgeResponseFormat::for_provider(ProviderKind::DeepSeek),
            JudgeResponseFormat::JsonObject
        );
        assert_eq!(
            JudgeResponseFormat::for_provider(ProviderKind::OpenAI),
            JudgeResponseFormat::JsonSchema
        );
        let parsed: JudgeResponseFormat = serde_json::from_str(r#""json_object""#).unwrap();
        assert_eq!(parsed, JudgeResponseFormat::JsonObject);
    }

    #[test]
    fn request_is_deterministic_and_embeds_criterion() {
        let judge = LlmJudge::new(Arc::new(ScriptedProvider::constant("{}")), "gpt-4o-mini")
            .with_response_format(JudgeResponseFormat::JsonObject);
        let request = judge.build_request("Customer: hi", "Be polite.");

        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.messages.len(), 2);
        assert!(request.messages[1].text().unwrap().contains("Evaluate this transcript for: Be polite."));
        assert_eq!(request.response_format, Some(json!({ "type": "json_object" })));
    }

    #[tokio::test]
    async fn returns_raw_text_from_provider() {
        let judge = LlmJudge::new(
            Arc::new(ScriptedProvider::constant(r#"{"score": 1.0, "passed": true, "reason": "ok"}"#)),
            "m",
        );
        let raw = judge.judge("Customer: hi", "criterion").await.unwrap();
        assert!(parse_verdict(&raw).is_ok());
    }
}
