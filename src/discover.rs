//! Discovery of project directories below a root.

use anyhow::Context;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use lazy_static::lazy_static;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Directory names never descended into. Matched case-insensitively.
pub const IGNORED_DIRS: &[&str] = &[
    "target",
    "node_modules",
    ".git",
    ".svn",
    ".gradle",
    "build",
    "dist",
    "out",
    "bin",
    ".idea",
    ".vscode",
    ".plugin*",
];

/// Files whose presence marks a directory as a project.
pub const PROJECT_MARKERS: &[&str] = &[
    "pom.xml",
    "requirements.txt",
    "README.md",
    "build.gradle",
    "package.json",
    "Cargo.toml",
    "go.mod",
];

lazy_static! {
    static ref IGNORED: GlobSet = {
        let mut builder = GlobSetBuilder::new();
        for pattern in IGNORED_DIRS {
            builder.add(
                GlobBuilder::new(pattern)
                    .case_insensitive(true)
                    .literal_separator(true)
                    .build()
                    .unwrap(),
            );
        }
        builder.build().unwrap()
    };
}

/// Whether a directory with this name is skipped during scanning.
pub fn is_ignored_dir(name: &str) -> bool {
    IGNORED.is_match(name)
}

/// Recursive project finder.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProjectScanner;

impl ProjectScanner {
    pub fn new() -> Self {
        Self
    }

    /// Every directory under `root` (including `root`) holding a project
    /// marker, in sorted pre-order. Nested projects are reported too.
    ///
    /// Returned paths are absolute: `root` is canonicalized before walking.
    pub fn scan<P: AsRef<Path>>(&self, root: P) -> anyhow::Result<Vec<PathBuf>> {
        let given = root.as_ref();
        if !given.is_dir() {
            anyhow::bail!("{} is not a directory", given.display());
        }
        let root = given
            .canonicalize()
            .with_context(|| format!("cannot resolve {}", given.display()))?;
        let root = root.as_path();

        let mut projects = Vec::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_pruned(e));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_dir() && has_marker(entry.path()) {
                debug!(project = %entry.path().display(), "found project");
                projects.push(entry.into_path());
            }
        }

        Ok(projects)
    }
}

fn is_pruned(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && is_ignored_dir(&entry.file_name().to_string_lossy())
}

fn has_marker(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(Result::ok).any(|e| {
        let name = e.file_name().to_string_lossy().into_owned();
        PROJECT_MARKERS.iter().any(|m| m.eq_ignore_ascii_case(&name))
            && e.file_type().map(|t| t.is_file()).unwrap_or(false)
    })
}
