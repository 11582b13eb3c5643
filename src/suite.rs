//! YAML test-suite documents.
//!
//! A suite names its agents once and then lists the conversations to run
//! between them:
//!
//! ```yaml
//! run:
//!   eval_model: gpt-4o-mini
//!   max_turns: 10
//! vars:
//!   shop: Vappy's Pizzeria
//! agents:
//!   pizzeria:
//!     provider: openai
//!     params: { model: gpt-4o-mini, temperature: 0.7 }
//!     system_prompt: "You are a voice assistant for {{shop}}."
//!     end_call_enabled: true
//!   hungry:
//!     params: { model: gpt-4o-mini }
//!     system_prompt: "You are a hungry customer."
//! conversations:
//!   - service: pizzeria
//!     customer: hungry
//!     type: inbound
//!     first_message: "Hi, what's on the menu today?"
//!     evaluations:
//!       - name: Menu
//!         prompt: The menu should be listed one item per line.
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    agents::AgentConfig,
    conversation::{CallType, ConversationSpec, DEFAULT_MAX_TURNS},
    eval::{Evaluation, Evaluator, JudgeResponseFormat},
    persistence::default_logs_dir,
    providers::{build_provider, ProviderKind, ProviderSettings},
    runner::RunOptions,
    LLMError, LLMProvider,
};

#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error("failed to read suite {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse suite YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to render template: {0}")]
    Template(#[from] handlebars::RenderError),
    #[error("conversation {conversation} references unknown agent '{name}'")]
    UnknownAgent { conversation: usize, name: String },
    #[error(transparent)]
    Provider(#[from] LLMError),
}

fn default_eval_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_turns() -> usize {
    DEFAULT_MAX_TURNS
}

fn default_repeat() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    #[serde(default = "default_eval_model")]
    pub eval_model: String,
    #[serde(default)]
    pub judge_provider: ProviderKind,
    /// Defaults to what `judge_provider` supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_response_format: Option<JudgeResponseFormat>,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default)]
    pub persist: bool,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    #[serde(default)]
    pub csv_log: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            eval_model: default_eval_model(),
            judge_provider: ProviderKind::default(),
            judge_response_format: None,
            max_turns: default_max_turns(),
            persist: false,
            logs_dir: default_logs_dir(),
            csv_log: false,
        }
    }
}

impl RunSettings {
    pub fn judge_response_format(&self) -> JudgeResponseFormat {
        self.judge_response_format
            .unwrap_or_else(|| JudgeResponseFormat::for_provider(self.judge_provider))
    }

    pub fn to_options(&self) -> RunOptions {
        RunOptions::new()
            .with_max_turns(self.max_turns)
            .with_persist(self.persist)
            .with_logs_dir(&self.logs_dir)
            .with_csv_log(self.csv_log)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationDefinition {
    pub service: String,
    pub customer: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub first_message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evaluations: Vec<Evaluation>,
    /// Run this conversation several times.
    #[serde(default = "default_repeat")]
    pub repeat: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuite {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, Value>,
    pub agents: BTreeMap<String, AgentConfig>,
    #[serde(default)]
    pub conversations: Vec<ConversationDefinition>,
}

impl TestSuite {
    pub fn from_yaml_str(input: &str) -> Result<Self, SuiteError> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SuiteError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| SuiteError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_string(&self) -> Result<String, SuiteError> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn renderer() -> Handlebars<'static> {
        let mut hb = Handlebars::new();
        hb.set_strict_mode(true);
        hb.register_escape_fn(handlebars::no_escape);
        hb
    }

    /// Agent configs with `vars` rendered into their system prompts.
    pub fn rendered_agents(&self) -> Result<BTreeMap<String, AgentConfig>, SuiteError> {
        let hb = Self::renderer();
        self.agents
            .iter()
            .map(|(name, config)| -> Result<(String, AgentConfig), SuiteError> {
                let system_prompt = hb.render_template(&config.system_prompt, &self.vars)?;
                Ok((
                    name.clone(),
                    AgentConfig {
                        system_prompt,
                        ..config.clone()
                    },
                ))
            })
            .collect()
    }

    /// One spec per conversation (times its `repeat`), in document order.
    pub fn build_specs(&self, registry: &ProviderRegistry) -> Result<Vec<ConversationSpec>, SuiteError> {
        let hb = Self::renderer();
        let agents = self.rendered_agents()?;
        let lookup = |index: usize, name: &str| {
            agents.get(name).ok_or_else(|| SuiteError::UnknownAgent {
                conversation: index,
                name: name.to_string(),
            })
        };

        let mut specs = Vec::new();
        for (index, conversation) in self.conversations.iter().enumerate() {
            let service = lookup(index, &conversation.service)?;
            let customer = lookup(index, &conversation.customer)?;
            let service_provider = registry.resolve(service.provider)?;
            let customer_provider = registry.resolve(customer.provider)?;
            let first_message = hb.render_template(&conversation.first_message, &self.vars)?;

            for _ in 0..conversation.repeat {
                specs.push(
                    ConversationSpec::new(
                        service.clone(),
                        Arc::clone(&service_provider),
                        customer.clone(),
                        Arc::clone(&customer_provider),
                        conversation.call_type,
                        first_message.clone(),
                    )
                    .with_evaluations(conversation.evaluations.iter().cloned()),
                );
            }
        }

        Ok(specs)
    }

    pub fn evaluator(&self, registry: &ProviderRegistry) -> Result<Evaluator, SuiteError> {
        let provider = registry.resolve(self.run.judge_provider)?;
        Ok(Evaluator::with_llm_judge_format(
            provider,
            self.run.eval_model.clone(),
            self.run.judge_response_format(),
        ))
    }
}

/// Hands out one shared client per provider kind, built on first use.
pub struct ProviderRegistry {
    api_keys: HashMap<ProviderKind, String>,
    base_urls: HashMap<ProviderKind, String>,
    request_timeout: Option<Duration>,
    fallback: Option<Arc<dyn LLMProvider>>,
    clients: Mutex<HashMap<ProviderKind, Arc<dyn LLMProvider>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            api_keys: HashMap::new(),
            base_urls: HashMap::new(),
            request_timeout: None,
            fallback: None,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_api_key(mut self, kind: ProviderKind, api_key: impl Into<String>) -> Self {
        self.api_keys.insert(kind, api_key.into());
        self
    }

    pub fn with_base_url(mut self, kind: ProviderKind, base_url: impl Into<String>) -> Self {
        self.base_urls.insert(kind, base_url.into());
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    /// Use `provider` for `kind` instead of building a client.
    pub fn with_provider(self, kind: ProviderKind, provider: Arc<dyn LLMProvider>) -> Self {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind, provider);
        self
    }

    /// Serve every kind without a registered client from `provider`.
    pub fn with_fallback(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    pub fn resolve(&self, kind: ProviderKind) -> Result<Arc<dyn LLMProvider>, LLMError> {
        let mut clients = self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(&kind) {
            return Ok(Arc::clone(client));
        }
        if let Some(fallback) = &self.fallback {
            return Ok(Arc::clone(fallback));
        }

        let api_key = self
            .api_keys
            .get(&kind)
            .ok_or(LLMError::MissingApiKey(kind.api_key_env()))?;
        let mut settings = ProviderSettings::new(kind, api_key.clone());
        if let Some(base_url) = self.base_urls.get(&kind) {
            settings = settings.with_base_url(base_url.clone());
        }
        if let Some(timeout) = self.request_timeout {
            settings = settings.with_timeout(timeout);
        }

        let client = build_provider(settings)?;
        tracing::debug!(provider = %kind, "built provider client");
        clients.insert(kind, Arc::clone(&client));
        Ok(client)
    }
}
