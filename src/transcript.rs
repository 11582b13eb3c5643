use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Separator between rendered turns. Anything that re-reads a rendered
/// transcript must split on exactly this.
pub const TURN_DELIMITER: &str = "\n\n";

static RE_TURN_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^(Service|Customer): ?(.*)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Service,
    Customer,
}

impl Speaker {
    pub fn other(self) -> Self {
        match self {
            Speaker::Service => Speaker::Customer,
            Speaker::Customer => Speaker::Service,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Speaker::Service => "Service",
            Speaker::Customer => "Customer",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "Service" => Some(Speaker::Service),
            "Customer" => Some(Speaker::Customer),
            _ => None,
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

impl Turn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

/// Append-only record of a call. Turns can be added but never edited or
/// removed once pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self { turns: Vec::new() }
    }

    pub fn push(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.turns.push(Turn::new(speaker, text));
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn first_message(&self) -> Option<&str> {
        self.turns.first().map(|turn| turn.text.as_str())
    }

    /// `"<Label>: <utterance>"` blocks joined by [`TURN_DELIMITER`].
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .map(|turn| format!("{}: {}", turn.speaker.label(), turn.text))
            .collect::<Vec<_>>()
            .join(TURN_DELIMITER)
    }

    /// Inverse of [`Transcript::render`]. Blocks that do not start with a
    /// speaker label are treated as a continuation of the previous turn, and
    /// any such blocks before the first labelled one are skipped.
    pub fn parse(text: &str) -> Self {
        let mut transcript = Transcript::new();

        for block in text.split(TURN_DELIMITER) {
            if let Some(caps) = RE_TURN_HEADER.captures(block) {
                let speaker = caps.get(1).and_then(|m| Speaker::from_label(m.as_str()));
                if let Some(speaker) = speaker {
                    let body = caps.get(2).map_or("", |m| m.as_str());
                    transcript.push(speaker, body);
                    continue;
                }
            }

            if let Some(last) = transcript.turns.last_mut() {
                last.text.push_str(TURN_DELIMITER);
                last.text.push_str(block);
            }
        }

        transcript
    }
}

impl fmt::Display for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a Turn;
    type IntoIter = std::slice::Iter<'a, Turn>;

    fn into_iter(self) -> Self::IntoIter {
        self.turns.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transcript {
        let mut transcript = Transcript::new();
        transcript.push(Speaker::Customer, "Hi, what's on the menu today?");
        transcript.push(Speaker::Service, "Pizza, sides and drinks.");
        transcript.push(Speaker::Customer, "One pepperoni please.");
        transcript
    }

    #[test]
    fn renders_labelled_blocks() {
        assert_eq!(
            sample().render(),
            "Customer: Hi, what's on the menu today?\n\nService: Pizza, sides and drinks.\n\nCustomer: One pepperoni please."
        );
    }

    #[test]
    fn parse_recovers_first_message() {
        let parsed = Transcript::parse(&sample().render());
        assert_eq!(parsed, sample());
        assert_eq!(parsed.first_message(), Some("Hi, what's on the menu today?"));
    }

    #[test]
    fn parse_keeps_paragraphs_inside_a_turn() {
        let mut transcript = Transcript::new();
        transcript.push(Speaker::Service, "Menu:\n\n- pizza\n- sides");
        transcript.push(Speaker::Customer, "Thanks");

        assert_eq!(Transcript::parse(&transcript.render()), transcript);
    }

    #[test]
    fn parse_skips_leading_header_block() {
        let parsed = Transcript::parse("Call transcript\n\nService: Hello\n\nCustomer: Hi");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.first_message(), Some("Hello"));
    }

    #[test]
    fn empty_text_has_no_turns() {
        assert!(Transcript::parse("").is_empty());
        assert_eq!(Transcript::new().render(), "");
    }
}
