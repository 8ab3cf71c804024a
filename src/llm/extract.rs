//! Response-shape rules for locating completion text.
//!
//! OpenAI-compatible servers put generated text in different places depending
//! on the mode and the vendor: `delta.content` for streamed chat chunks,
//! `message.content` for full chat responses, and `text` for the legacy
//! completion shape. Each shape is a [`ContentRule`]: a predicate ("the field
//! path is present") paired with an extractor ("a non-empty string lives
//! there"). Rules are tried in a fixed order and the first whose predicate
//! holds decides the outcome, even when its extractor then yields nothing.

use serde_json::Value;

/// One response shape, identified by a path of object keys below a choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRule {
    pub name: &'static str,
    path: &'static [&'static str],
}

impl ContentRule {
    const fn new(name: &'static str, path: &'static [&'static str]) -> Self {
        Self { name, path }
    }

    fn lookup<'a>(&self, choice: &'a Value) -> Option<&'a Value> {
        self.path
            .iter()
            .try_fold(choice, |node, key| node.as_object()?.get(*key))
    }

    /// Whether the field this rule reads is present (any value, including null).
    pub fn matches(&self, choice: &Value) -> bool {
        self.lookup(choice).is_some()
    }

    /// The string at this rule's path, empty strings included.
    pub fn text<'a>(&self, choice: &'a Value) -> Option<&'a str> {
        self.lookup(choice).and_then(Value::as_str)
    }

    /// The text at this rule's path, if it is a non-empty string.
    pub fn extract<'a>(&self, choice: &'a Value) -> Option<&'a str> {
        self.text(choice).filter(|s| !s.is_empty())
    }
}

pub const DELTA_CONTENT: ContentRule = ContentRule::new("delta.content", &["delta", "content"]);
pub const MESSAGE_CONTENT: ContentRule =
    ContentRule::new("message.content", &["message", "content"]);
pub const TEXT: ContentRule = ContentRule::new("text", &["text"]);

/// Rules for streamed chunks, in priority order.
pub const STREAM_RULES: &[ContentRule] = &[DELTA_CONTENT, MESSAGE_CONTENT, TEXT];

/// Rules for full (non-streamed) responses, in priority order.
pub const COMPLETION_RULES: &[ContentRule] = &[MESSAGE_CONTENT, TEXT];

/// The first entry of the payload's `choices` array. Later choices are ignored.
pub fn first_choice(payload: &Value) -> Option<&Value> {
    payload.get("choices")?.as_array()?.first()
}

/// Apply `rules` in order to `choice`; the first matching rule decides.
///
/// Returns `None` when no rule matches, or when the deciding rule's field is
/// null, empty, or not a string.
pub fn extract_content<'a>(choice: &'a Value, rules: &[ContentRule]) -> Option<&'a str> {
    let rule = rules.iter().find(|r| r.matches(choice))?;
    rule.extract(choice)
}
