//! Recovery of structured reports from free-form model output.
//!
//! Models wrap their answer in reasoning blocks and markdown fences often
//! enough that the raw text rarely parses as-is. [`sanitize`] strips those
//! artifacts; [`normalize`] then tries to read the remainder as a JSON object.
//! Text that still does not parse is kept verbatim: prose is a legitimate
//! answer, not a failure.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

lazy_static! {
    /// Paired reasoning blocks, matched non-greedily across lines.
    static ref REASONING_BLOCK: Regex =
        Regex::new(r"(?s)<think>.*?</think>|<thinking>.*?</thinking>").unwrap();
    /// Fence openers with an optional language tag.
    static ref FENCE_OPEN: Regex = Regex::new(r"```[a-zA-Z0-9]*").unwrap();
}

const FENCE: &str = "```";

/// Overall risk rating assigned by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            _ => Err(format!("unknown risk level: {}", s)),
        }
    }
}

/// One module entry of a report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSummary {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// The report schema the prompt asks for.
///
/// Every field is optional in practice; [`StructuredReport::from_document`]
/// reads whatever is present and well-typed and ignores the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub modules: Vec<ModuleSummary>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub top_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
}

impl StructuredReport {
    /// Best-effort view of a parsed document.
    pub fn from_document(doc: &Value) -> Self {
        Self {
            project_name: string_field(doc, "project_name"),
            summary: string_field(doc, "summary"),
            modules: doc
                .get("modules")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(module_entry).collect())
                .unwrap_or_default(),
            issues: string_list(doc, "issues"),
            suggestions: string_list(doc, "suggestions"),
            top_files: string_list(doc, "top_files"),
            risk_level: doc
                .get("risk_level")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok()),
        }
    }
}

fn string_field(doc: &Value, key: &str) -> Option<String> {
    doc.get(key).and_then(Value::as_str).map(str::to_string)
}

fn string_list(doc: &Value, key: &str) -> Vec<String> {
    doc.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn module_entry(item: &Value) -> Option<ModuleSummary> {
    match item {
        Value::Object(_) => Some(ModuleSummary {
            name: string_field(item, "name").unwrap_or_default(),
            description: string_field(item, "description").unwrap_or_default(),
        }),
        Value::String(name) => Some(ModuleSummary {
            name: name.clone(),
            description: String::new(),
        }),
        _ => None,
    }
}

/// A successfully parsed answer.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredDocument {
    /// The sanitized text the document was parsed from.
    pub text: String,
    /// The parsed JSON object, with every field the model produced.
    pub value: Value,
    /// Schema view of `value`.
    pub report: StructuredReport,
}

impl StructuredDocument {
    pub fn pretty(&self) -> String {
        serde_json::to_string_pretty(&self.value).unwrap_or_else(|_| self.text.clone())
    }
}

/// Result of normalizing one answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Structured(StructuredDocument),
    /// Sanitized text that is not a JSON object. An accepted outcome.
    Fallback(String),
}

impl Normalized {
    /// The sanitized text, whichever variant this is.
    pub fn text(&self) -> &str {
        match self {
            Normalized::Structured(doc) => &doc.text,
            Normalized::Fallback(text) => text,
        }
    }

    pub fn document(&self) -> Option<&StructuredDocument> {
        match self {
            Normalized::Structured(doc) => Some(doc),
            Normalized::Fallback(_) => None,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Normalized::Structured(_))
    }

    /// Text for display: the pretty-printed document or the raw text.
    pub fn display_text(&self) -> String {
        match self {
            Normalized::Structured(doc) => doc.pretty(),
            Normalized::Fallback(text) => text.clone(),
        }
    }
}

fn sanitize_once(raw: &str) -> String {
    let text = REASONING_BLOCK.replace_all(raw, "");
    let text = FENCE_OPEN.replace_all(&text, "");
    let text = text.replace(FENCE, "");
    text.trim().to_string()
}

/// Strip reasoning blocks and code fences, then trim.
///
/// Repeats until the text stops changing, so the result is a fixed point:
/// `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize(raw: &str) -> String {
    let mut current = sanitize_once(raw);
    loop {
        let next = sanitize_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Remove reasoning blocks only, leaving fences in place. Used for Markdown
/// answers, where code fences are content.
pub fn strip_reasoning(raw: &str) -> String {
    REASONING_BLOCK.replace_all(raw, "").trim().to_string()
}

/// Sanitize `raw` and attempt to read it as a JSON object.
pub fn normalize(raw: &str) -> Normalized {
    let text = sanitize(raw);
    match serde_json::from_str::<Value>(&text) {
        Ok(value) if value.is_object() => {
            let report = StructuredReport::from_document(&value);
            Normalized::Structured(StructuredDocument {
                text,
                value,
                report,
            })
        }
        _ => Normalized::Fallback(text),
    }
}
