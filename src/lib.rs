//! projlens - LLM-backed analysis of local project directories.
//!
//! projlens describes a project to an OpenAI-compatible chat model, streams
//! the model's review back as it is generated, and keeps the final answer in
//! a local history.
//!
//! # Architecture
//!
//! - `llm`: HTTP transport, stream decoding and response-shape rules
//! - `normalize`: recovery of structured reports from model output
//! - `prompt`: bounded, deterministic prompt assembly
//! - `analysis`: sequential batch orchestration with progress notifications
//! - `history`: persisted outcomes, listing and export
//! - `discover`: recursive project discovery
//! - `config`: YAML settings with environment fallbacks
//! - `report`: terminal output

pub mod analysis;
pub mod cli;
pub mod config;
pub mod discover;
pub mod history;
pub mod llm;
pub mod normalize;
pub mod prompt;
pub mod report;

pub use analysis::{
    AnalysisError, AnalysisOutcome, BatchReport, ContentSource, Orchestrator, ProjectOutcome,
    Progress, ResultKind,
};
pub use config::{AnalysisSettings, ConfigProvider, LlmSettings, Settings};
pub use discover::ProjectScanner;
pub use history::{HistoryError, HistoryRecord, HistoryStore, JsonlHistoryStore, MemoryHistoryStore};
pub use llm::{CompletionBackend, DeltaSource, LlmClient, LlmError, Timeouts};
pub use normalize::{normalize, sanitize, Normalized, StructuredDocument, StructuredReport};
pub use prompt::{PromptBuilder, PromptError};
