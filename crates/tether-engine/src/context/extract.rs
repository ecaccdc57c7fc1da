//! Salient-unit extraction from free-form background text.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static ENTITY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][A-Za-z0-9]*(?:[ \-][A-Z][A-Za-z0-9]*)+\b|\b[A-Z][a-z0-9]+(?:[A-Z][a-z0-9]+)+\b").unwrap()
});

static CONSTRAINT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(must|must not|cannot|can't|shall|should not|never|mandatory|required to|limited to|at most|at least|no more than|only)\b",
    )
    .unwrap()
});

static DECISION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(selected|decided|chosen|chose|opted|adopted|agreed|settled on|went with)\b").unwrap()
});

static RELATIONSHIP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(depends on|uses|requires|calls|connects to|integrates with|extends|implements|reads from|writes to|talks to|wraps)\b",
    )
    .unwrap()
});

/// Longest passage, in bytes, kept as one piece when a sentence runs on.
pub const MAX_PASSAGE_BYTES: usize = 256;

/// Units pulled out of background material, each list in source order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SalientUnits {
    pub constraints: Vec<String>,
    pub decisions: Vec<String>,
    pub relationships: Vec<String>,
    pub entities: Vec<String>,
    /// Sentences that matched no category. Run-on sentences are split at
    /// word boundaries into pieces of at most [`MAX_PASSAGE_BYTES`].
    pub passages: Vec<String>,
}

impl SalientUnits {
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
            && self.decisions.is_empty()
            && self.relationships.is_empty()
            && self.entities.is_empty()
            && self.passages.is_empty()
    }
}

/// Classify each sentence of `background` as a constraint, decision or
/// relationship (first match wins, in that order) and collect distinct
/// multi-word or CamelCase entity names.
pub fn extract(background: &str) -> SalientUnits {
    let mut units = SalientUnits::default();
    let mut seen_sentences = HashSet::new();

    for sentence in split_sentences(background) {
        if !seen_sentences.insert(sentence.clone()) {
            continue;
        }
        if CONSTRAINT_PATTERN.is_match(&sentence) {
            units.constraints.push(sentence);
        } else if DECISION_PATTERN.is_match(&sentence) {
            units.decisions.push(sentence);
        } else if RELATIONSHIP_PATTERN.is_match(&sentence) {
            units.relationships.push(sentence);
        } else {
            units.passages.extend(split_words(&sentence, MAX_PASSAGE_BYTES));
        }
    }

    let mut seen_entities = HashSet::new();
    for m in ENTITY_PATTERN.find_iter(background) {
        let Some(name) = clean_entity(m.as_str()) else {
            continue;
        };
        if seen_entities.insert(name.clone()) {
            units.entities.push(name);
        }
    }

    units
}

const LEADING_STOPWORDS: &[&str] = &["The", "A", "An", "This", "That", "These", "Those", "Our", "We", "All", "Each", "Every"];

/// Drop sentence-initial articles ("The Payment Gateway" -> "Payment Gateway")
/// and anything left that is a single plain word.
fn clean_entity(raw: &str) -> Option<String> {
    let mut words: Vec<&str> = raw.split(' ').collect();
    while words.len() > 1 && LEADING_STOPWORDS.contains(&words[0]) {
        words.remove(0);
    }
    let name = words.join(" ");
    let camel = name.chars().skip(1).any(|c| c.is_ascii_uppercase()) && name.chars().any(|c| c.is_ascii_lowercase());
    (name.contains(' ') || name.contains('-') || camel).then_some(name)
}

/// Split on sentence terminators followed by whitespace, and on line breaks.
/// Fenced code and list markers are left to the caller; sentences are trimmed.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            push_sentence(&mut out, &mut current);
            continue;
        }
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().map_or(true, |n| n.is_whitespace()) {
            push_sentence(&mut out, &mut current);
        }
    }
    push_sentence(&mut out, &mut current);
    out
}

/// Break `text` at whitespace into pieces no longer than `max_bytes`. A single
/// word longer than that stays whole.
pub fn split_words(text: &str, max_bytes: usize) -> Vec<String> {
    if text.len() <= max_bytes {
        return vec![text.to_string()];
    }
    let mut out = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > max_bytes {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn push_sentence(out: &mut Vec<String>, current: &mut String) {
    let trimmed = current
        .trim()
        .trim_start_matches(|c: char| c == '-' || c == '*' || c == '•')
        .trim();
    if trimmed.chars().any(char::is_alphanumeric) {
        out.push(trimmed.to_string());
    }
    current.clear();
}
