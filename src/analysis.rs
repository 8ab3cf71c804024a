//! Batch analysis of project directories.
//!
//! The [`Orchestrator`] walks an ordered list of projects one at a time. For
//! each project it builds a prompt, streams a preview of the answer, fetches
//! the authoritative answer, normalizes it and hands it to the history store.
//! Every step reports through a bounded [`Progress`] channel. A failure in one
//! project is reported and the batch moves on.

use chrono::{DateTime, Local};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::history::HistoryStore;
use crate::llm::{CompletionBackend, LlmError};
use crate::normalize::{normalize, Normalized};
use crate::prompt::{PromptBuilder, PromptError};

/// Default capacity of the progress channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("analysis panicked: {0}")]
    Panicked(String),
}

/// Which response produced the content of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentSource {
    /// The non-streamed final response.
    Final,
    /// The accumulated stream, used when the final fetch failed.
    Streamed,
}

/// The result of analyzing one project, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub project_path: PathBuf,
    /// Sanitized content of record.
    pub content: String,
    /// The parsed JSON object, when the content is one.
    pub document: Option<Value>,
    pub source: ContentSource,
    pub analyzed_at: DateTime<Local>,
}

/// Whether a result could be read as a structured document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Structured,
    Raw,
}

/// Notifications emitted while a batch runs, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// A project is about to be analyzed. `index` is zero-based.
    ProjectStarted {
        index: usize,
        total: usize,
        path: PathBuf,
    },
    /// A fragment of the streamed answer.
    Delta { text: String },
    /// The streaming call failed. The batch continues with the final fetch.
    StreamFailed { path: PathBuf, error: String },
    /// The final fetch failed. The streamed text becomes the content of record.
    FinalFetchFailed { path: PathBuf, error: String },
    /// The normalized answer, pretty-printed when structured.
    Result {
        path: PathBuf,
        kind: ResultKind,
        text: String,
    },
    Saved { path: PathBuf, id: u64 },
    SaveFailed { path: PathBuf, error: String },
    /// Analysis of this project was abandoned.
    AnalysisFailed { path: PathBuf, error: String },
    /// Emitted once after the last project.
    BatchComplete {
        total: usize,
        succeeded: usize,
        failed: usize,
    },
}

impl Progress {
    /// Stable label for this notification.
    pub fn kind(&self) -> &'static str {
        match self {
            Progress::ProjectStarted { .. } => "starting project",
            Progress::Delta { .. } => "delta",
            Progress::StreamFailed { .. } => "streaming failed",
            Progress::FinalFetchFailed { .. } => "final fetch failed",
            Progress::Result { .. } => "result",
            Progress::Saved { .. } => "saved",
            Progress::SaveFailed { .. } => "save failed",
            Progress::AnalysisFailed { .. } => "analysis failed",
            Progress::BatchComplete { .. } => "batch complete",
        }
    }
}

/// Terminal state of one project.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectOutcome {
    /// An answer was produced. `record_id` is `None` when saving failed.
    Completed {
        outcome: AnalysisOutcome,
        record_id: Option<u64>,
    },
    Failed { path: PathBuf, error: String },
}

impl ProjectOutcome {
    pub fn path(&self) -> &Path {
        match self {
            ProjectOutcome::Completed { outcome, .. } => &outcome.project_path,
            ProjectOutcome::Failed { path, .. } => path,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ProjectOutcome::Completed { .. })
    }
}

/// One outcome per started project, in processing order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub outcomes: Vec<ProjectOutcome>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }
}

/// Send a notification, ignoring a dropped receiver.
async fn emit(tx: &mpsc::Sender<Progress>, event: Progress) {
    if tx.send(event).await.is_err() {
        debug!("progress receiver dropped");
    }
}

/// Run filesystem work on the blocking pool. A panic inside `f` comes back
/// as [`AnalysisError::Panicked`].
async fn blocking<T, F>(f: F) -> Result<T, AnalysisError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        if e.is_panic() {
            AnalysisError::Panicked(panic_message(&*e.into_panic()))
        } else {
            AnalysisError::Panicked(e.to_string())
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs analysis batches against one backend and one history store.
pub struct Orchestrator {
    backend: Arc<dyn CompletionBackend>,
    prompts: PromptBuilder,
    store: Arc<dyn HistoryStore>,
    capacity: usize,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        prompts: PromptBuilder,
        store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            backend,
            prompts,
            store,
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set the progress channel capacity (at least 1).
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Run `projects` on a background task.
    ///
    /// The receiver yields notifications in emission order. Dropping it does
    /// not stop the batch.
    pub fn spawn(
        self,
        projects: Vec<PathBuf>,
    ) -> (JoinHandle<BatchReport>, mpsc::Receiver<Progress>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let handle = tokio::spawn(async move { self.run(&projects, &tx).await });
        (handle, rx)
    }

    /// Analyze `projects` in order, reporting through `progress`.
    pub async fn run(
        &self,
        projects: &[PathBuf],
        progress: &mpsc::Sender<Progress>,
    ) -> BatchReport {
        let total = projects.len();
        let mut report = BatchReport::default();
        info!(total, "starting analysis batch");

        for (index, path) in projects.iter().enumerate() {
            emit(
                progress,
                Progress::ProjectStarted {
                    index,
                    total,
                    path: path.clone(),
                },
            )
            .await;

            let attempt = AssertUnwindSafe(self.analyze_project(path, progress))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(AnalysisError::Panicked(panic_message(&*payload))));

            let outcome = match attempt {
                Ok((outcome, record_id)) => ProjectOutcome::Completed { outcome, record_id },
                Err(e) => {
                    error!(project = %path.display(), error = %e, "analysis failed");
                    emit(
                        progress,
                        Progress::AnalysisFailed {
                            path: path.clone(),
                            error: e.to_string(),
                        },
                    )
                    .await;
                    ProjectOutcome::Failed {
                        path: path.clone(),
                        error: e.to_string(),
                    }
                }
            };
            report.outcomes.push(outcome);
        }

        info!(
            total,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "analysis batch complete"
        );
        emit(
            progress,
            Progress::BatchComplete {
                total,
                succeeded: report.succeeded(),
                failed: report.failed(),
            },
        )
        .await;
        report
    }

    async fn analyze_project(
        &self,
        path: &Path,
        progress: &mpsc::Sender<Progress>,
    ) -> Result<(AnalysisOutcome, Option<u64>), AnalysisError> {
        let prompt = {
            let prompts = self.prompts.clone();
            let dir = path.to_path_buf();
            blocking(move || prompts.build(&dir)).await??
        };

        let mut streamed = String::new();
        if let Err(e) = self.stream_into(&prompt, &mut streamed, progress).await {
            warn!(project = %path.display(), error = %e, "streaming failed");
            emit(
                progress,
                Progress::StreamFailed {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                },
            )
            .await;
        }

        let (raw, source) = match self.backend.complete(&prompt).await {
            Ok(text) => (text, ContentSource::Final),
            Err(e) => {
                warn!(
                    project = %path.display(),
                    error = %e,
                    streamed_chars = streamed.chars().count(),
                    "final fetch failed, using streamed content"
                );
                emit(
                    progress,
                    Progress::FinalFetchFailed {
                        path: path.to_path_buf(),
                        error: e.to_string(),
                    },
                )
                .await;
                (streamed, ContentSource::Streamed)
            }
        };

        let normalized = normalize(&raw);
        let kind = match normalized {
            Normalized::Structured(_) => ResultKind::Structured,
            Normalized::Fallback(_) => ResultKind::Raw,
        };
        emit(
            progress,
            Progress::Result {
                path: path.to_path_buf(),
                kind,
                text: normalized.display_text(),
            },
        )
        .await;

        let outcome = AnalysisOutcome {
            project_path: path.to_path_buf(),
            content: normalized.text().to_string(),
            document: normalized.document().map(|d| d.value.clone()),
            source,
            analyzed_at: Local::now(),
        };

        let saved = {
            let store = Arc::clone(&self.store);
            let outcome = outcome.clone();
            match blocking(move || store.save(&outcome)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        };
        let record_id = match saved {
            Ok(record) => {
                emit(
                    progress,
                    Progress::Saved {
                        path: path.to_path_buf(),
                        id: record.id,
                    },
                )
                .await;
                Some(record.id)
            }
            Err(e) => {
                error!(project = %path.display(), error = %e, "failed to save analysis");
                emit(
                    progress,
                    Progress::SaveFailed {
                        path: path.to_path_buf(),
                        error: e,
                    },
                )
                .await;
                None
            }
        };

        Ok((outcome, record_id))
    }

    /// Forward every delta and append it to `buffer`. On error, what was
    /// received so far stays in `buffer`.
    async fn stream_into(
        &self,
        prompt: &str,
        buffer: &mut String,
        progress: &mpsc::Sender<Progress>,
    ) -> Result<(), LlmError> {
        let mut source = self.backend.stream(prompt).await?;
        while let Some(delta) = source.next_delta().await? {
            buffer.push_str(&delta);
            emit(progress, Progress::Delta { text: delta }).await;
        }
        Ok(())
    }
}
