//! Command-line interface for projlens.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::analysis::Orchestrator;
use crate::config::{
    self, AnalysisSettings, ConfigProvider, LlmSettings, Settings, API_KEY_KEY, API_MODEL_KEY,
    API_URL_KEY, DEFAULT_LANGUAGE, HISTORY_PATH_KEY, KNOWN_KEYS, LANGUAGE_KEY,
};
use crate::discover::ProjectScanner;
use crate::history::{self, HistoryStore, JsonlHistoryStore, MemoryHistoryStore};
use crate::llm::LlmClient;
use crate::normalize;
use crate::prompt::PromptBuilder;
use crate::report::{self, ProgressPrinter};

/// Exit codes.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_ERROR: i32 = 2;

/// Analyze local projects with an OpenAI-compatible model.
///
/// projlens builds a bounded description of each project directory, streams
/// the model's review to the terminal, and keeps the final answer in a local
/// history that can be listed and exported.
#[derive(Parser)]
#[command(name = "projlens")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config YAML file (default: auto-discover)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze one or more projects
    Analyze(AnalyzeArgs),
    /// List project directories found under a root
    Scan(ScanArgs),
    /// Inspect or export analysis history
    #[command(subcommand)]
    History(HistoryCommand),
    /// Show or change configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Generate a user manual for a project
    Manual(ManualArgs),
}

/// Arguments for the analyze command.
#[derive(Parser)]
pub struct AnalyzeArgs {
    /// Project directories (or roots to scan with --scan)
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Treat each path as a root and analyze every project found below it
    #[arg(long)]
    pub scan: bool,

    /// Do not write results to the history file
    #[arg(long)]
    pub no_save: bool,
}

#[derive(Parser)]
pub struct ScanArgs {
    /// Directory to scan
    pub root: PathBuf,
}

#[derive(Subcommand)]
pub enum HistoryCommand {
    /// List past analyses, newest first
    List {
        /// Output format: pretty or json
        #[arg(short, long, default_value = "pretty")]
        format: String,
    },
    /// Export history to a file
    Export {
        /// Export format: csv or json
        #[arg(short, long)]
        format: String,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Set a value in the config file
    Set { key: String, value: String },
}

#[derive(Parser)]
pub struct ManualArgs {
    /// Project directory
    pub project: PathBuf,

    /// Write the manual to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Install the stderr log subscriber. `RUST_LOG` wins over `--verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "warn,projlens=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let settings = match path {
        Some(p) => Settings::load(p)?,
        None => Settings::discover()?,
    };
    Ok(settings)
}

fn open_history(settings: &Settings) -> anyhow::Result<JsonlHistoryStore> {
    let analysis = AnalysisSettings::resolve(settings);
    let path = analysis.history_path.with_context(|| {
        format!(
            "cannot determine a history location; set '{}' in the config file",
            HISTORY_PATH_KEY
        )
    })?;
    Ok(JsonlHistoryStore::new(path))
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

/// Absolute form of `path` when it exists; otherwise `path` unchanged.
fn resolve_project(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Projects named on the command line, or found below them with `scan`.
/// Existing paths come back absolute either way.
fn collect_projects(paths: &[PathBuf], scan: bool) -> anyhow::Result<Vec<PathBuf>> {
    if !scan {
        return Ok(paths.iter().map(|p| resolve_project(p)).collect());
    }
    let scanner = ProjectScanner::new();
    let mut projects = Vec::new();
    for root in paths {
        projects.extend(scanner.scan(root)?);
    }
    Ok(projects)
}

/// Where the effective value of `key` comes from, as a display suffix.
fn value_origin<F>(settings: &Settings, key: &str, env: F) -> &'static str
where
    F: Fn(&str) -> Option<String>,
{
    if settings.value(key).is_some() {
        ""
    } else if config::env_var_for(key).and_then(|name| env(name)).is_some() {
        " (env)"
    } else {
        " (default)"
    }
}

/// Check the endpoint settings, printing guidance when incomplete.
fn require_endpoint(llm: &LlmSettings) -> bool {
    if llm.is_complete() {
        return true;
    }
    eprintln!("Error: API URL and API key must be configured before analysis");
    eprintln!(
        "Run 'projlens config set {} <URL>' and 'projlens config set {} <KEY>',",
        API_URL_KEY, API_KEY_KEY
    );
    eprintln!("or set OPENAI_API_URL and OPENAI_API_KEY");
    false
}

/// Run the analyze command.
pub fn run_analyze(config_path: Option<&Path>, args: &AnalyzeArgs) -> anyhow::Result<i32> {
    let settings = load_settings(config_path)?;
    let llm = LlmSettings::resolve(&settings);
    if !require_endpoint(&llm) {
        return Ok(EXIT_ERROR);
    }
    let analysis = AnalysisSettings::resolve(&settings);

    let projects = collect_projects(&args.paths, args.scan)?;
    if projects.is_empty() {
        eprintln!("Warning: no projects to analyze");
        return Ok(EXIT_SUCCESS);
    }

    let store: Arc<dyn HistoryStore> = match (&analysis.history_path, args.no_save) {
        (Some(path), false) => Arc::new(JsonlHistoryStore::new(path)),
        (None, false) => {
            warn!("no history location available, results will not be kept");
            Arc::new(MemoryHistoryStore::new())
        }
        (_, true) => Arc::new(MemoryHistoryStore::new()),
    };

    let client = LlmClient::new(llm)?;
    let orchestrator = Orchestrator::new(
        Arc::new(client),
        PromptBuilder::new(analysis.language),
        store,
    );

    info!(projects = projects.len(), "analyzing projects");

    let report = runtime()?.block_on(async move {
        let (handle, mut progress) = orchestrator.spawn(projects);
        let mut printer = ProgressPrinter::new(io::stdout());
        while let Some(event) = progress.recv().await {
            printer.write(&event)?;
        }
        handle.await.context("analysis task failed")
    })?;

    report::write_batch_failures(&report, io::stderr())?;

    if report.failed() > 0 {
        Ok(EXIT_FAILED)
    } else {
        Ok(EXIT_SUCCESS)
    }
}

/// Run the scan command.
pub fn run_scan(args: &ScanArgs) -> anyhow::Result<i32> {
    let projects = ProjectScanner::new().scan(&args.root)?;
    if projects.is_empty() {
        eprintln!("No projects found under {}", args.root.display());
        return Ok(EXIT_SUCCESS);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for project in &projects {
        writeln!(out, "{}", project.display())?;
    }
    Ok(EXIT_SUCCESS)
}

/// Run a history subcommand.
pub fn run_history(config_path: Option<&Path>, command: &HistoryCommand) -> anyhow::Result<i32> {
    let settings = load_settings(config_path)?;
    let store = open_history(&settings)?;

    match command {
        HistoryCommand::List { format } => {
            if format != "pretty" && format != "json" {
                eprintln!(
                    "Error: invalid format {:?}, must be 'pretty' or 'json'",
                    format
                );
                return Ok(EXIT_ERROR);
            }
            let records = store.list()?;
            let stdout = io::stdout();
            if format == "json" {
                report::write_history_json(&records, stdout.lock())?;
            } else {
                report::write_history_pretty(&records, stdout.lock())?;
            }
        }
        HistoryCommand::Export { format, output } => {
            if format != "csv" && format != "json" {
                eprintln!("Error: invalid format {:?}, must be 'csv' or 'json'", format);
                return Ok(EXIT_ERROR);
            }
            let records = store.list()?;
            let file = File::create(output)
                .with_context(|| format!("creating {}", output.display()))?;
            let writer = BufWriter::new(file);
            if format == "csv" {
                history::export_csv(&records, writer)?;
            } else {
                history::export_json(&records, writer)?;
            }
            println!("Exported {} record(s) to {}", records.len(), output.display());
        }
    }
    Ok(EXIT_SUCCESS)
}

/// Run a config subcommand.
pub fn run_config(config_path: Option<&Path>, command: &ConfigCommand) -> anyhow::Result<i32> {
    let mut settings = load_settings(config_path)?;

    match command {
        ConfigCommand::Show => {
            let llm = LlmSettings::resolve(&settings);
            let analysis = AnalysisSettings::resolve(&settings);
            let history = analysis
                .history_path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(unavailable)".to_string());

            println!("{} {}", "Config file:".dimmed(), settings.path().display());
            let rows = [
                (API_URL_KEY, llm.api_url),
                (API_KEY_KEY, config::mask_secret(&llm.api_key)),
                (API_MODEL_KEY, llm.model),
                (LANGUAGE_KEY, analysis.language),
                (HISTORY_PATH_KEY, history),
            ];
            for (key, value) in rows {
                let origin = value_origin(&settings, key, |name| std::env::var(name).ok());
                println!("  {:<20} {}{}", key, value, origin.dimmed());
            }
        }
        ConfigCommand::Set { key, value } => {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                eprintln!(
                    "Warning: unknown key {:?} (known: {})",
                    key,
                    KNOWN_KEYS.join(", ")
                );
            }
            settings.set(key, value);
            settings.save()?;
            println!("Set {} in {}", key, settings.path().display());
        }
    }
    Ok(EXIT_SUCCESS)
}

/// Run the manual command.
pub fn run_manual(config_path: Option<&Path>, args: &ManualArgs) -> anyhow::Result<i32> {
    let settings = load_settings(config_path)?;
    let llm = LlmSettings::resolve(&settings);
    if !require_endpoint(&llm) {
        return Ok(EXIT_ERROR);
    }

    let project = resolve_project(&args.project);
    if !project.is_dir() {
        eprintln!("Error: {} is not a directory", args.project.display());
        return Ok(EXIT_ERROR);
    }

    let previous = match open_history(&settings) {
        Ok(store) => store.latest_for(&project)?.map(|r| r.result),
        Err(e) => {
            warn!(error = %e, "history unavailable, generating manual without it");
            None
        }
    };
    if previous.is_none() {
        info!(project = %project.display(), "no previous analysis found");
    }

    let language = settings.get(LANGUAGE_KEY, DEFAULT_LANGUAGE);
    let prompt = PromptBuilder::new(language).build_manual(&project, previous.as_deref());
    let client = LlmClient::new(llm)?;

    eprintln!("Generating manual for {} ...", project.display());
    let manual = runtime()?.block_on(client.complete(&prompt))?;
    let manual = normalize::strip_reasoning(&manual);

    match &args.output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", manual))
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote manual to {}", path.display());
        }
        None => println!("{}", manual),
    }
    Ok(EXIT_SUCCESS)
}
