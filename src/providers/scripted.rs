use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    tools::{FunctionCall, ToolCall, END_CALL_TOOL},
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

/// One canned reply.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub text: String,
    pub end_call: bool,
}

impl ScriptedReply {
    pub fn say(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            end_call: false,
        }
    }

    pub fn hang_up(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            end_call: true,
        }
    }
}

/// Replays a fixed script, one reply per call. Once the script runs out it
/// either repeats the last reply or fails, depending on `repeat_last`.
pub struct ScriptedProvider {
    replies: Vec<ScriptedReply>,
    cursor: Mutex<usize>,
    repeat_last: bool,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies,
            cursor: Mutex::new(0),
            repeat_last: false,
        }
    }

    /// A provider that always answers with the same text.
    pub fn constant(text: impl Into<String>) -> Self {
        Self::new(vec![ScriptedReply::say(text)]).repeating()
    }

    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match self.replies.get(*cursor) {
            Some(reply) => {
                *cursor += 1;
                Some(reply.clone())
            }
            None if self.repeat_last => self.replies.last().cloned(),
            None => None,
        }
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let reply = self
            .next_reply()
            .ok_or_else(|| LLMError::Provider("no more scripted responses".to_string()))?;

        let mut message = ChatMessage::assistant(reply.text);
        if reply.end_call {
            message = message.with_tool_calls(vec![ToolCall::new(FunctionCall::new(
                END_CALL_TOOL,
                serde_json::json!({}),
            ))]);
        }

        Ok(CompletionResponse::new(message))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
