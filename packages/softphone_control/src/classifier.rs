//! Event Classifier
//!
//! Maps one output line to a [`DomainEvent`]. The softphone has no
//! structured output format, so classification is a heuristic over the
//! text of a single line.
//!
//! ## Rule order
//!
//! Rules are tried top to bottom and the first match wins. Matching is done
//! on the lower-cased line; values (numbers, endpoints) are taken from the
//! original text so their case is preserved.
//!
//! **Important:** hang-up and answer rules must come before the generic
//! `call` rule, since Twinkle reports them as "far end ended call" and
//! "far end answered call".

use tracing::trace;

use crate::line_channel::RawLine;
use crate::state::DomainEvent;

/// A line prepared for matching
struct Prepared<'a> {
    original: &'a str,
    lowered: String,
    /// For every byte of `lowered` (plus one past the end), the byte offset
    /// of the `original` char it came from
    origin: Vec<usize>,
}

impl<'a> Prepared<'a> {
    fn new(original: &'a str) -> Self {
        let mut lowered = String::with_capacity(original.len());
        let mut origin = Vec::with_capacity(original.len() + 1);
        for (at, c) in original.char_indices() {
            for lower in c.to_lowercase() {
                lowered.push(lower);
                origin.resize(lowered.len(), at);
            }
        }
        origin.push(original.len());
        Self {
            original,
            lowered,
            origin,
        }
    }

    /// Original text from the char that produced `lowered[offset..]`.
    ///
    /// Lower-casing can grow or shrink a char, so offsets found in the
    /// lowered text are mapped back rather than reused.
    fn original_from(&self, offset: usize) -> &'a str {
        let at = self
            .origin
            .get(offset)
            .copied()
            .unwrap_or(self.original.len());
        &self.original[at..]
    }
}

/// `(rule_name, matcher)`
type Rule = (&'static str, fn(&Prepared<'_>) -> Option<DomainEvent>);

const RULES: &[Rule] = &[
    ("hangup", match_hangup),
    ("answered", match_answered),
    ("call", match_call),
    ("registering", match_registering),
    ("registration_failed", match_registration_failed),
];

const HANGUP_PATTERNS: &[&str] = &["bye", "call ended", "ended call", "call released"];
const REGISTRATION_FAILED_PATTERNS: &[&str] = &["not registered", "registration failed"];
const REGISTERING_PHRASE: &str = "registering phone";

/// Classify a line read from the softphone
pub fn classify(line: &RawLine) -> DomainEvent {
    let prepared = Prepared::new(&line.text);
    for (name, matcher) in RULES {
        if let Some(event) = matcher(&prepared) {
            trace!(rule = *name, "'{}' -> {}", line.text, event.name());
            return event;
        }
    }
    DomainEvent::Unrecognized(line.clone())
}

/// Classify bare text (stamped with the current time if unrecognized)
pub fn classify_text(text: &str) -> DomainEvent {
    classify(&RawLine::new(text))
}

fn match_hangup(line: &Prepared<'_>) -> Option<DomainEvent> {
    HANGUP_PATTERNS
        .iter()
        .any(|p| line.lowered.contains(p))
        .then_some(DomainEvent::Ended)
}

fn match_answered(line: &Prepared<'_>) -> Option<DomainEvent> {
    line.lowered
        .contains("answered")
        .then_some(DomainEvent::Answered)
}

fn match_call(line: &Prepared<'_>) -> Option<DomainEvent> {
    let lowered = line.lowered.as_str();
    let start = lowered.find("call")?;
    if lowered.contains("called") || lowered.contains("calling") {
        return None;
    }

    let rest = line.original_from(start + "call".len());
    match trailing_token(rest).filter(|t| looks_like_address(t)) {
        Some(number) => Some(DomainEvent::Ringing { number }),
        None => Some(DomainEvent::Trying),
    }
}

fn match_registering(line: &Prepared<'_>) -> Option<DomainEvent> {
    let start = line.lowered.find(REGISTERING_PHRASE)?;
    let endpoint = line
        .original_from(start + REGISTERING_PHRASE.len())
        .split_whitespace()
        .next()
        .map(trim_punctuation)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    Some(DomainEvent::Registering { endpoint })
}

fn match_registration_failed(line: &Prepared<'_>) -> Option<DomainEvent> {
    REGISTRATION_FAILED_PATTERNS
        .iter()
        .any(|p| line.lowered.contains(p))
        .then_some(DomainEvent::RegistrationFailed)
}

fn trailing_token(text: &str) -> Option<String> {
    text.split_whitespace()
        .last()
        .map(trim_punctuation)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn trim_punctuation(token: &str) -> &str {
    token.trim_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '<' | '>' | '"' | '\''))
}

/// Phone numbers and SIP addresses; filters out words like "trying"
fn looks_like_address(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
        || token.contains('@')
        || token.to_lowercase().starts_with("sip:")
}
