use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    agents::{Agent, AgentConfig, AgentError},
    eval::Evaluation,
    transcript::{Speaker, Transcript},
    LLMProvider,
};

pub const DEFAULT_MAX_TURNS: usize = 20;

/// Who placed the call. Inbound calls open with the customer, outbound calls
/// with the service agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[serde(alias = "Inbound", alias = "INBOUND")]
    Inbound,
    #[serde(alias = "Outbound", alias = "OUTBOUND")]
    Outbound,
}

impl CallType {
    pub fn first_speaker(self) -> Speaker {
        match self {
            CallType::Inbound => Speaker::Customer,
            CallType::Outbound => Speaker::Service,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Inbound => "inbound",
            CallType::Outbound => "outbound",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to simulate and grade one call.
#[derive(Clone)]
pub struct ConversationSpec {
    pub service_config: Arc<AgentConfig>,
    pub service_provider: Arc<dyn LLMProvider>,
    pub customer_config: Arc<AgentConfig>,
    pub customer_provider: Arc<dyn LLMProvider>,
    pub call_type: CallType,
    pub first_message: String,
    pub evaluations: Vec<Evaluation>,
}

impl fmt::Debug for ConversationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationSpec")
            .field("service_model", &self.service_config.params.model)
            .field("service_provider", &self.service_provider.name())
            .field("customer_model", &self.customer_config.params.model)
            .field("customer_provider", &self.customer_provider.name())
            .field("call_type", &self.call_type)
            .field("first_message", &self.first_message)
            .field("evaluations", &self.evaluations.len())
            .finish()
    }
}

impl ConversationSpec {
    pub fn new(
        service_config: AgentConfig,
        service_provider: Arc<dyn LLMProvider>,
        customer_config: AgentConfig,
        customer_provider: Arc<dyn LLMProvider>,
        call_type: CallType,
        first_message: impl Into<String>,
    ) -> Self {
        Self {
            service_config: Arc::new(service_config),
            service_provider,
            customer_config: Arc::new(customer_config),
            customer_provider,
            call_type,
            first_message: first_message.into(),
            evaluations: Vec::new(),
        }
    }

    pub fn with_evaluation(mut self, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        self.evaluations.push(Evaluation::new(name, prompt));
        self
    }

    pub fn with_evaluations<I>(mut self, evaluations: I) -> Self
    where
        I: IntoIterator<Item = Evaluation>,
    {
        self.evaluations.extend(evaluations);
        self
    }

    pub fn service_agent(&self) -> Agent {
        Agent::new(
            Speaker::Service,
            Arc::clone(&self.service_config),
            Arc::clone(&self.service_provider),
        )
    }

    pub fn customer_agent(&self) -> Agent {
        Agent::new(
            Speaker::Customer,
            Arc::clone(&self.customer_config),
            Arc::clone(&self.customer_provider),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    MaxTurns,
    EndCall,
    Error,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EndReason::MaxTurns => "max_turns",
            EndReason::EndCall => "end_call",
            EndReason::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    NotStarted,
    InProgress,
    Ended(EndReason),
}

#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Turn { index: usize, speaker: Speaker, text: String },
    Ended { reason: EndReason },
}

#[derive(Debug, Clone)]
pub struct ConversationRun {
    pub transcript: Transcript,
    pub end_reason: EndReason,
    /// Agent turns generated after the seeded first message.
    pub turns_generated: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("{speaker} agent failed on turn {turn}: {source}")]
    Agent {
        speaker: Speaker,
        turn: usize,
        transcript: Transcript,
        #[source]
        source: AgentError,
    },
    #[error("conversation has already been run")]
    AlreadyStarted,
}

impl ConversationError {
    /// Whatever was said before the failure.
    pub fn partial_transcript(&self) -> Option<&Transcript> {
        match self {
            ConversationError::Agent { transcript, .. } => Some(transcript),
            ConversationError::AlreadyStarted => None,
        }
    }
}

/// Drives two agents through one call, strictly alternating speakers, until
/// an agent hangs up or the turn limit is hit.
pub struct Conversation {
    service: Agent,
    customer: Agent,
    call_type: CallType,
    first_message: String,
    max_turns: usize,
    state: ConversationState,
    transcript: Transcript,
    event_callback: Option<Arc<dyn Fn(&ConversationEvent) + Send + Sync>>,
}

impl Conversation {
    pub fn new(spec: &ConversationSpec) -> Self {
        Self::from_agents(
            spec.service_agent(),
            spec.customer_agent(),
            spec.call_type,
            spec.first_message.clone(),
        )
    }

    pub fn from_agents(
        service: Agent,
        customer: Agent,
        call_type: CallType,
        first_message: impl Into<String>,
    ) -> Self {
        Self {
            service,
            customer,
            call_type,
            first_message: first_message.into(),
            max_turns: DEFAULT_MAX_TURNS,
            state: ConversationState::NotStarted,
            transcript: Transcript::new(),
            event_callback: None,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_event_callback(
        mut self,
        callback: impl Fn(&ConversationEvent) + Send + Sync + 'static,
    ) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    fn emit_event(&self, event: &ConversationEvent) {
        if let Some(callback) = &self.event_callback {
            callback(event);
        }
    }

    fn agent_for(&self, speaker: Speaker) -> &Agent {
        match speaker {
            Speaker::Service => &self.service,
            Speaker::Customer => &self.customer,
        }
    }

    fn append(&mut self, speaker: Speaker, text: String) {
        tracing::debug!(turn = self.transcript.len(), %speaker, "turn");
        let event = ConversationEvent::Turn {
            index: self.transcript.len(),
            speaker,
            text: text.clone(),
        };
        self.transcript.push(speaker, text);
        self.emit_event(&event);
    }

    fn finish(&mut self, reason: EndReason) {
        self.state = ConversationState::Ended(reason);
        self.emit_event(&ConversationEvent::Ended { reason });
    }

    pub async fn run(&mut self) -> Result<ConversationRun, ConversationError> {
        if self.state != ConversationState::NotStarted {
            return Err(ConversationError::AlreadyStarted);
        }

        self.state = ConversationState::InProgress;

        let opener = self.call_type.first_speaker();
        let first_message = self.first_message.clone();
        self.append(opener, first_message);

        let mut speaker = opener.other();
        let mut generated = 0usize;

        let reason = loop {
            if generated >= self.max_turns {
                break EndReason::MaxTurns;
            }

            let result = self.agent_for(speaker).generate(self.transcript.turns()).await;
            let turn = match result {
                Ok(turn) => turn,
                Err(source) => {
                    self.finish(EndReason::Error);
                    return Err(ConversationError::Agent {
                        speaker,
                        turn: generated + 1,
                        transcript: self.transcript.clone(),
                        source,
                    });
                }
            };

            generated += 1;
            if !turn.utterance.is_empty() {
                self.append(speaker, turn.utterance);
            }

            if turn.end_call {
                tracing::debug!(%speaker, turn = generated, "agent ended the call");
                break EndReason::EndCall;
            }

            speaker = speaker.other();
        };

        self.finish(reason);

        Ok(ConversationRun {
            transcript: self.transcript.clone(),
            end_reason: reason,
            turns_generated: generated,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::providers::scripted::{ScriptedProvider, ScriptedReply};

    fn spec_with(
        service: ScriptedProvider,
        customer: ScriptedProvider,
        call_type: CallType,
        end_call_enabled: bool,
    ) -> ConversationSpec {
        ConversationSpec::new(
            AgentConfig::new("service-model", "You run a pizzeria.").with_end_call(end_call_enabled),
            Arc::new(service),
            AgentConfig::new("customer-model", "You are hungry.").with_end_call(end_call_enabled),
            Arc::new(customer),
            call_type,
            "Hi, what's on the menu today?",
        )
    }

    fn assert_alternates(transcript: &Transcript, opener: Speaker) {
        let mut expected = opener;
        for turn in transcript {
            assert_eq!(turn.speaker, expected);
            expected = expected.other();
        }
    }

    #[test]
    fn call_type_reads_capitalised_names_and_writes_lowercase() {
        let parsed: Vec<CallType> =
            serde_json::from_str(r#"["inbound", "Inbound", "OUTBOUND", "outbound"]"#).unwrap();
        assert_eq!(
            parsed,
            vec![CallType::Inbound, CallType::Inbound, CallType::Outbound, CallType::Outbound]
        );
        assert_eq!(serde_json::to_string(&CallType::Outbound).unwrap(), r#""outbound""#);
        assert!(serde_json::from_str::<CallType>(r#""walk-in""#).is_err());
    }

    #[tokio::test]
    async fn stops_at_max_turns_with_seed_plus_loop_turns() {
        let spec = spec_with(
            ScriptedProvider::constant("We have pizza."),
            ScriptedProvider::constant("Sounds good."),
            CallType::Inbound,
            true,
        );

        let mut conversation = Conversation::new(&spec).with_max_turns(4);
        let run = conversation.run().await.unwrap();

        assert_eq!(run.transcript.len(), 5);
        assert_eq!(run.end_reason, EndReason::MaxTurns);
        assert_eq!(run.turns_generated, 4);
        assert_eq!(conversation.state(), ConversationState::Ended(EndReason::MaxTurns));
        assert_eq!(run.transcript.first_message(), Some("Hi, what's on the menu today?"));
        assert_alternates(&run.transcript, Speaker::Customer);
    }

    #[tokio::test]
    async fn outbound_calls_open_with_the_service_agent() {
        let spec = spec_with(
            ScriptedProvider::constant("service"),
            ScriptedProvider::constant("customer"),
            CallType::Outbound,
            false,
        );

        let run = Conversation::new(&spec).with_max_turns(3).run().await.unwrap();

        assert_eq!(run.transcript.turns()[0].speaker, Speaker::Service);
        assert_eq!(run.transcript.turns()[1].text, "customer");
        assert_alternates(&run.transcript, Speaker::Service);
    }

    #[tokio::test]
    async fn end_call_signal_stops_early() {
        let spec = spec_with(
            ScriptedProvider::new(vec![
                ScriptedReply::say("Pizza, sides, drinks."),
                ScriptedReply::hang_up("Enjoy, bye!"),
            ]),
            ScriptedProvider::new(vec![
                ScriptedReply::say("One pepperoni."),
                ScriptedReply::say("Thanks, bye."),
            ]),
            CallType::Inbound,
            true,
        );

        let run = Conversation::new(&spec).with_max_turns(20).run().await.unwrap();

        assert_eq!(run.end_reason, EndReason::EndCall);
        assert_eq!(run.turns_generated, 3);
        assert_eq!(run.transcript.len(), 4);
        assert_eq!(run.transcript.last().unwrap().text, "Enjoy, bye!");
        assert_alternates(&run.transcript, Speaker::Customer);
    }

    #[tokio::test]
    async fn disabled_end_call_never_stops_early() {
        let spec = spec_with(
            ScriptedProvider::new(vec![ScriptedReply::hang_up("bye")]).repeating(),
            ScriptedProvider::new(vec![ScriptedReply::hang_up("bye")]).repeating(),
            CallType::Inbound,
            false,
        );

        let run = Conversation::new(&spec).with_max_turns(6).run().await.unwrap();

        assert_eq!(run.end_reason, EndReason::MaxTurns);
        assert_eq!(run.transcript.len(), 7);
    }

    #[tokio::test]
    async fn provider_failure_ends_with_error_and_partial_transcript() {
        let spec = spec_with(
            ScriptedProvider::new(vec![ScriptedReply::say("Pizza.")]),
            ScriptedProvider::constant("Okay."),
            CallType::Inbound,
            true,
        );

        let mut conversation = Conversation::new(&spec).with_max_turns(10);
        let error = conversation.run().await.unwrap_err();

        assert_eq!(conversation.state(), ConversationState::Ended(EndReason::Error));
        match &error {
            ConversationError::Agent {
                speaker,
                turn,
                transcript,
                ..
            } => {
                assert_eq!(*speaker, Speaker::Service);
                assert_eq!(*turn, 3);
                assert_eq!(transcript.len(), 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(error.partial_transcript().map(Transcript::len), Some(3));
    }

    #[tokio::test]
    async fn zero_max_turns_keeps_only_the_seed() {
        let spec = spec_with(
            ScriptedProvider::new(vec![]),
            ScriptedProvider::new(vec![]),
            CallType::Inbound,
            true,
        );

        let run = Conversation::new(&spec).with_max_turns(0).run().await.unwrap();
        assert_eq!(run.transcript.len(), 1);
        assert_eq!(run.end_reason, EndReason::MaxTurns);
    }

    #[tokio::test]
    async fn cannot_run_twice() {
        let spec = spec_with(
            ScriptedProvider::constant("a"),
            ScriptedProvider::constant("b"),
            CallType::Inbound,
            false,
        );

        let mut conversation = Conversation::new(&spec).with_max_turns(1);
        conversation.run().await.unwrap();
        assert!(matches!(
            conversation.run().await,
            Err(ConversationError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn emits_turn_and_end_events() {
        let spec = spec_with(
            ScriptedProvider::constant("a"),
            ScriptedProvider::constant("b"),
            CallType::Inbound,
            false,
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        Conversation::new(&spec)
            .with_max_turns(2)
            .with_event_callback(move |event| sink.lock().unwrap().push(event.clone()))
            .run()
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert!(matches!(
            events.last(),
            Some(ConversationEvent::Ended { reason: EndReason::MaxTurns })
        ));
    }
}
