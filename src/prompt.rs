//! Prompt assembly for project analysis.
//!
//! The prompt is built from the top level of a project directory only: the
//! README, a few sampled source files, and the names of recognised manifest
//! files. Directory entries are sorted before anything is picked so the same
//! directory contents always produce the same prompt bytes.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Character budget for the README excerpt.
pub const README_BUDGET: usize = 3000;
/// Character budget for each sampled source file.
pub const SAMPLE_BUDGET: usize = 2000;
/// Maximum number of sampled source files.
pub const MAX_SAMPLES: usize = 3;

/// Source extensions, highest priority first.
pub const SAMPLE_EXTENSIONS: &[&str] = &["java", "py", "js", "ts", "go", "rs"];

/// Build manifests listed in the prompt when present, in listing order.
pub const MANIFEST_FILES: &[&str] = &[
    "pom.xml",
    "build.gradle",
    "package.json",
    "requirements.txt",
    "Cargo.toml",
    "go.mod",
];

const README_NAME: &str = "README.md";

const REPORT_SCHEMA: &str = r#"{"project_name": "<project name>", "summary": "<overview>", "modules": [{"name": "...", "description": "..."}], "issues": ["..."], "suggestions": ["..."], "top_files": ["<path>"], "risk_level": "low|medium|high"}"#;

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("cannot access project directory {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
}

/// Builds analysis and manual prompts.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    language: String,
}

impl PromptBuilder {
    /// `language` is the language the model is asked to answer in.
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Build the analysis prompt for `project_dir`.
    pub fn build(&self, project_dir: &Path) -> Result<String, PromptError> {
        let root = resolve_dir(project_dir)?;
        let files = list_files(&root)?;

        let mut out = String::new();

        out.push_str(
            "You are a code review and project analysis assistant. Do not think out loud; \
             analyze the project below and answer with strict JSON only. \
             Do not output any text outside the JSON. Fields:\n",
        );
        out.push_str(REPORT_SCHEMA);
        out.push('\n');
        out.push_str(&format!(
            "Requirements: answer in {lang}; project_name must be meaningful and written in {lang}; \
             summary at most 200 characters; at most 10 modules; each issue and suggestion at most \
             100 characters; whole answer at most 2000 characters.\n",
            lang = self.language
        ));

        out.push_str(&format!("Project path: {}\n", root.display()));
        out.push_str("Detected files:\n");

        if let Some(readme) = files.iter().find(|n| n.eq_ignore_ascii_case(README_NAME)) {
            out.push_str("--- README START ---\n");
            append_excerpt(&mut out, &root.join(readme), README_BUDGET);
            out.push_str("--- README END ---\n");
        }

        let mut top_files: Vec<String> = MANIFEST_FILES
            .iter()
            .filter(|m| files.iter().any(|f| f == *m))
            .map(|m| m.to_string())
            .collect();

        for name in select_samples(&files) {
            out.push_str(&format!("--- FILE: {} START ---\n", name));
            append_excerpt(&mut out, &root.join(name), SAMPLE_BUDGET);
            out.push_str(&format!("--- FILE: {} END ---\n", name));
            top_files.push(name.clone());
        }

        out.push_str("Top files:\n");
        for name in &top_files {
            out.push_str(name);
            out.push('\n');
        }

        out.push_str(
            "Reminder: return exactly one valid JSON object that follows the fields above. \
             No explanations or comments outside the JSON.\n",
        );

        debug!(
            project = %root.display(),
            chars = out.chars().count(),
            "built analysis prompt"
        );
        Ok(out)
    }

    /// Build a prompt asking for a Markdown user manual.
    pub fn build_manual(&self, project_dir: &Path, previous_analysis: Option<&str>) -> String {
        let mut out = String::new();
        out.push_str(
            "You are a technical writer. Using the project information below, \
             write a complete user manual in Markdown.\n\n",
        );
        out.push_str("## Project information\n");
        out.push_str(&format!("Project path: {}\n\n", project_dir.display()));

        if let Some(analysis) = previous_analysis.filter(|a| !a.trim().is_empty()) {
            out.push_str("## Previous analysis\n");
            out.push_str(analysis);
            out.push_str("\n\n");
        }

        out.push_str("## Requirements\n");
        out.push_str("1. Output Markdown only.\n");
        out.push_str("2. Include these sections:\n");
        for section in [
            "Overview",
            "Features",
            "Installation",
            "Quick start",
            "Configuration",
            "API reference (if any)",
            "Usage examples",
            "Troubleshooting",
            "FAQ",
        ] {
            out.push_str(&format!("   - {}\n", section));
        }
        out.push_str("3. Be detailed and accurate so users can follow it.\n");
        out.push_str(&format!("4. Write in {}.\n", self.language));
        out
    }
}

fn resolve_dir(project_dir: &Path) -> Result<PathBuf, PromptError> {
    let root = project_dir
        .canonicalize()
        .map_err(|source| PromptError::Unreadable {
            path: project_dir.to_path_buf(),
            source,
        })?;
    if !root.is_dir() {
        return Err(PromptError::NotADirectory(root));
    }
    Ok(root)
}

/// Names of the regular files directly inside `dir`, sorted.
fn list_files(dir: &Path) -> Result<Vec<String>, PromptError> {
    let unreadable = |source| PromptError::Unreadable {
        path: dir.to_path_buf(),
        source,
    };

    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false)
            || entry.path().is_file();
        if is_file {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Pick up to [`MAX_SAMPLES`] files by extension priority.
fn select_samples(files: &[String]) -> Vec<&String> {
    let mut picked = Vec::new();
    for ext in SAMPLE_EXTENSIONS {
        let suffix = format!(".{}", ext);
        for name in files {
            if picked.len() >= MAX_SAMPLES {
                return picked;
            }
            if name.to_lowercase().ends_with(&suffix) {
                picked.push(name);
            }
        }
    }
    picked
}

/// Append whole lines of `path` while fewer than `budget` characters have
/// been taken. The last appended line is never cut short.
fn append_excerpt(out: &mut String, path: &Path, budget: usize) {
    if let Err(e) = read_excerpt(out, path, budget) {
        warn!(file = %path.display(), error = %e, "failed to read file for prompt");
    }
}

fn read_excerpt(out: &mut String, path: &Path, budget: usize) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();
    let mut taken = 0usize;

    while taken < budget {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&buf);
        out.push_str(&line);
        out.push('\n');
        taken += line.chars().count();
    }
    Ok(())
}
