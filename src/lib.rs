pub mod error;
pub mod providers;
pub mod types;
pub mod tools;
pub mod agents;
pub mod transcript;
pub mod conversation;
pub mod eval;
pub mod runner;
pub mod persistence;
pub mod synthetic;
pub mod suite;
pub mod rerun;

pub use error::LLMError;
pub use providers::{build_provider, LLMProvider, ProviderKind, ProviderSettings};
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use tools::{
    end_call_tool, FunctionCall, FunctionDefinition, Tool, ToolCall, ToolChoice, END_CALL_TOOL,
};
pub use agents::{Agent, AgentConfig, AgentError, AgentTurn, ModelParams};
pub use transcript::{Speaker, Transcript, Turn, TURN_DELIMITER};
pub use conversation::{
    CallType,
    Conversation,
    ConversationError,
    ConversationEvent,
    ConversationRun,
    ConversationSpec,
    ConversationState,
    EndReason,
};
pub use eval::{
    Evaluation,
    EvaluationResult,
    Evaluator,
    Judge,
    LlmJudge,
    RunSummary,
    PASS_THRESHOLD,
};
pub use runner::{RunAggregate, RunOptions, TestResult, TestRunner, TestStatus};
pub use persistence::{CsvResultLog, JsonRunLog, PersistError, ResultStore, RunRecord};
pub use synthetic::{SyntheticDataConfig, SyntheticDataGenerator, SyntheticScenario};
pub use suite::{ProviderRegistry, SuiteError, TestSuite};
pub use rerun::{rerun_specs, RerunError};
