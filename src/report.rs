//! Terminal output for analysis progress and history.
//!
//! Progress and results go to the writer handed in (stdout in the CLI);
//! logging stays on stderr.

use colored::*;
use std::io::{self, Write};

use crate::analysis::{BatchReport, ProjectOutcome, Progress, ResultKind};
use crate::history::HistoryRecord;

/// Renders [`Progress`] notifications as they arrive.
///
/// Deltas are written inline without line breaks; the next labelled line
/// starts on a fresh line.
pub struct ProgressPrinter<W: Write> {
    out: W,
    mid_line: bool,
}

impl<W: Write> ProgressPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            mid_line: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn label(&mut self, label: ColoredString, detail: &str) -> io::Result<()> {
        if self.mid_line {
            writeln!(self.out)?;
            self.mid_line = false;
        }
        writeln!(self.out, "[{}] {}", label, detail)
    }

    pub fn write(&mut self, event: &Progress) -> io::Result<()> {
        let kind = event.kind();
        match event {
            Progress::ProjectStarted { index, total, path } => {
                writeln!(self.out)?;
                self.label(
                    kind.cyan().bold(),
                    &format!("({}/{}) {}", index + 1, total, path.display()),
                )?;
            }
            Progress::Delta { text } => {
                write!(self.out, "{}", text.dimmed())?;
                self.mid_line = !text.ends_with('\n');
                self.out.flush()?;
            }
            Progress::StreamFailed { path, error }
            | Progress::FinalFetchFailed { path, error } => {
                self.label(kind.yellow(), &format!("{}: {}", path.display(), error))?;
            }
            Progress::Result { path, kind: rk, text } => {
                let shape = match rk {
                    ResultKind::Structured => "structured",
                    ResultKind::Raw => "raw text",
                };
                self.label(kind.green().bold(), &format!("{} ({})", path.display(), shape))?;
                writeln!(self.out, "{}", text)?;
            }
            Progress::Saved { path, id } => {
                self.label(kind.green(), &format!("{} as record #{}", path.display(), id))?;
            }
            Progress::SaveFailed { path, error } | Progress::AnalysisFailed { path, error } => {
                self.label(kind.red().bold(), &format!("{}: {}", path.display(), error))?;
            }
            Progress::BatchComplete {
                total,
                succeeded,
                failed,
            } => {
                writeln!(self.out)?;
                let detail = format!(
                    "{} project(s): {} succeeded, {} failed",
                    total, succeeded, failed
                );
                if *failed == 0 {
                    self.label(kind.green().bold(), &detail)?;
                } else {
                    self.label(kind.yellow().bold(), &detail)?;
                }
            }
        }
        Ok(())
    }
}

/// Print failed projects after a batch, if any.
pub fn write_batch_failures<W: Write>(report: &BatchReport, mut out: W) -> io::Result<()> {
    for outcome in &report.outcomes {
        if let ProjectOutcome::Failed { path, error } = outcome {
            writeln!(out, "  {} {}: {}", "✗".red(), path.display(), error)?;
        }
    }
    Ok(())
}

/// Pretty history listing, newest first as given.
pub fn write_history_pretty<W: Write>(records: &[HistoryRecord], mut out: W) -> io::Result<()> {
    if records.is_empty() {
        writeln!(out, "{}", "No analysis history.".dimmed())?;
        return Ok(());
    }

    for r in records {
        writeln!(
            out,
            "{} {}  {}",
            format!("#{}", r.id).cyan().bold(),
            r.project_name.bold(),
            r.analyzed_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        )?;
        writeln!(out, "    {}", r.project_path)?;
        writeln!(out, "    {}", r.project_description)?;
    }
    writeln!(out)?;
    writeln!(out, "{} record(s)", records.len())
}

/// History as a JSON array of stored records.
pub fn write_history_json<W: Write>(records: &[HistoryRecord], mut out: W) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut out, records)?;
    writeln!(out)
}
