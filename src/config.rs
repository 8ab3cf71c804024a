//! Configuration for projlens.
//!
//! Settings live in a flat YAML map (`projlens.yaml` by default), read once at
//! startup. Callers resolve what they need into immutable snapshots
//! ([`LlmSettings`], [`AnalysisSettings`]) so a batch never re-reads
//! configuration mid-run.

use directories::ProjectDirs;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Default config file names to search for in the current directory.
pub const DEFAULT_CONFIG_NAMES: &[&str] = &["projlens.yaml", ".projlens.yaml"];

pub const API_URL_KEY: &str = "api.url";
pub const API_KEY_KEY: &str = "api.key";
pub const API_MODEL_KEY: &str = "api.model";
pub const LANGUAGE_KEY: &str = "analysis.language";
pub const HISTORY_PATH_KEY: &str = "history.path";

/// Keys recognised by projlens, in display order.
pub const KNOWN_KEYS: &[&str] = &[
    API_URL_KEY,
    API_KEY_KEY,
    API_MODEL_KEY,
    LANGUAGE_KEY,
    HISTORY_PATH_KEY,
];

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8091/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "qwen3-32b-fp8";
pub const DEFAULT_LANGUAGE: &str = "Chinese";

/// Environment variables consulted when a key is not set in the file.
const API_URL_ENV: &str = "OPENAI_API_URL";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("serializing config {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Key/value lookup with a caller-supplied default.
pub trait ConfigProvider {
    fn get(&self, key: &str, default: &str) -> String;
}

/// File-backed settings.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
struct SettingsFile(BTreeMap<String, serde_yaml::Value>);

impl Settings {
    /// Load settings from `path`. A missing file yields empty settings.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self {
                    path,
                    values: BTreeMap::new(),
                });
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        let file: Option<SettingsFile> =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;

        // Scalars of any YAML type are accepted and kept as their text form.
        let values = file
            .unwrap_or_default()
            .0
            .into_iter()
            .filter_map(|(k, v)| scalar_to_string(&v).map(|s| (k, s)))
            .collect();

        info!(path = %path.display(), "loaded config");
        Ok(Self { path, values })
    }

    /// Load from the first default config file present in the current
    /// directory, or from the first default name when none exists yet.
    pub fn discover() -> Result<Self, ConfigError> {
        let path = DEFAULT_CONFIG_NAMES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_NAMES[0]));
        Self::load(path)
    }

    /// Path this configuration is read from and saved to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value explicitly set in the file, if any.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        debug!(key, "config value set");
        self.values.insert(key.to_string(), value.to_string());
    }

    /// Write the settings back to their file.
    pub fn save(&self) -> Result<(), ConfigError> {
        let content =
            serde_yaml::to_string(&self.values).map_err(|source| ConfigError::Serialize {
                path: self.path.clone(),
                source,
            })?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })?;
            }
        }
        fs::write(&self.path, content).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), "saved config");
        Ok(())
    }
}

impl ConfigProvider for Settings {
    fn get(&self, key: &str, default: &str) -> String {
        self.value(key).unwrap_or(default).to_string()
    }
}

/// Environment variable consulted when `key` is absent from the file.
pub fn env_var_for(key: &str) -> Option<&'static str> {
    match key {
        API_URL_KEY => Some(API_URL_ENV),
        API_KEY_KEY => Some(API_KEY_ENV),
        _ => None,
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Endpoint settings for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmSettings {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

impl LlmSettings {
    /// Resolve from `config`, falling back to the process environment.
    pub fn resolve(config: &dyn ConfigProvider) -> Self {
        Self::resolve_with(config, |name| std::env::var(name).ok())
    }

    /// Resolve with an explicit environment lookup.
    ///
    /// Precedence: config value, then environment variable, then default.
    pub fn resolve_with<F>(config: &dyn ConfigProvider, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let url_default = env(API_URL_ENV).unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let key_default = env(API_KEY_ENV).unwrap_or_default();

        Self {
            api_url: config.get(API_URL_KEY, &url_default).trim().to_string(),
            api_key: config.get(API_KEY_KEY, &key_default).trim().to_string(),
            model: config.get(API_MODEL_KEY, DEFAULT_MODEL).trim().to_string(),
        }
    }

    /// Both the endpoint URL and the key are set.
    pub fn is_complete(&self) -> bool {
        !self.api_url.is_empty() && !self.api_key.is_empty()
    }
}

/// Prompt and persistence settings for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisSettings {
    pub language: String,
    pub history_path: Option<PathBuf>,
}

impl AnalysisSettings {
    pub fn resolve(config: &dyn ConfigProvider) -> Self {
        let history = config.get(HISTORY_PATH_KEY, "");
        let history_path = if history.trim().is_empty() {
            default_history_path()
        } else {
            Some(PathBuf::from(history.trim()))
        };

        Self {
            language: config.get(LANGUAGE_KEY, DEFAULT_LANGUAGE),
            history_path,
        }
    }
}

/// `<data dir>/projlens/history.jsonl` for the current platform.
pub fn default_history_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "projlens").map(|dirs| dirs.data_dir().join("history.jsonl"))
}

/// Mask a secret for display, keeping a short prefix.
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let prefix: String = secret.chars().take(3).collect();
    format!("{}***", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let settings = Settings::load(temp.path().join("absent.yaml")).unwrap();
        assert_eq!(settings.get(API_URL_KEY, "fallback"), "fallback");
    }

    #[test]
    fn test_load_scalars() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("projlens.yaml");
        fs::write(
            &path,
            "api.url: http://example.test/v1/chat/completions\napi.model: m1\nretries: 3\n",
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(
            settings.value(API_URL_KEY),
            Some("http://example.test/v1/chat/completions")
        );
        assert_eq!(settings.value("retries"), Some("3"));
    }

    #[test]
    fn test_empty_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("projlens.yaml");
        fs::write(&path, "").unwrap();
        let settings = Settings::load(&path).unwrap();
        assert!(settings.value(API_URL_KEY).is_none());
    }

    #[test]
    fn test_invalid_yaml_is_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("projlens.yaml");
        fs::write(&path, "api.url: [unclosed").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_set_and_save_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("projlens.yaml");

        let mut settings = Settings::load(&path).unwrap();
        settings.set(API_KEY_KEY, "sk-test");
        settings.set(API_MODEL_KEY, "gpt-test");
        settings.save().unwrap();

        let reloaded = Settings::load(&path).unwrap();
        assert_eq!(reloaded.value(API_KEY_KEY), Some("sk-test"));
        assert_eq!(reloaded.value(API_MODEL_KEY), Some("gpt-test"));
    }

    #[test]
    fn test_llm_settings_defaults() {
        let settings = Settings::default();
        let llm = LlmSettings::resolve_with(&settings, no_env);
        assert_eq!(llm.api_url, DEFAULT_API_URL);
        assert_eq!(llm.api_key, "");
        assert_eq!(llm.model, DEFAULT_MODEL);
        assert!(!llm.is_complete());
    }

    #[test]
    fn test_llm_settings_env_fallback() {
        let settings = Settings::default();
        let env = |name: &str| match name {
            "OPENAI_API_URL" => Some("http://env.test/v1".to_string()),
            "OPENAI_API_KEY" => Some("sk-env".to_string()),
            _ => None,
        };
        let llm = LlmSettings::resolve_with(&settings, env);
        assert_eq!(llm.api_url, "http://env.test/v1");
        assert_eq!(llm.api_key, "sk-env");
        assert!(llm.is_complete());
    }

    #[test]
    fn test_file_overrides_env() {
        let mut settings = Settings::default();
        settings.set(API_KEY_KEY, "sk-file");
        let env = |name: &str| (name == "OPENAI_API_KEY").then(|| "sk-env".to_string());
        let llm = LlmSettings::resolve_with(&settings, env);
        assert_eq!(llm.api_key, "sk-file");
    }

    #[test]
    fn test_analysis_settings() {
        let mut settings = Settings::default();
        settings.set(LANGUAGE_KEY, "English");
        settings.set(HISTORY_PATH_KEY, "/tmp/h.jsonl");
        let analysis = AnalysisSettings::resolve(&settings);
        assert_eq!(analysis.language, "English");
        assert_eq!(analysis.history_path, Some(PathBuf::from("/tmp/h.jsonl")));
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "");
        assert_eq!(mask_secret("sk-abcdef"), "sk-***");
    }

    #[test]
    fn test_serialize_error_message() {
        let source = serde_yaml::from_str::<u32>("not a number").unwrap_err();
        let err = ConfigError::Serialize {
            path: PathBuf::from("projlens.yaml"),
            source,
        };
        assert!(err.to_string().starts_with("serializing config projlens.yaml: "));
    }

    #[test]
    fn test_env_var_for() {
        assert_eq!(env_var_for(API_URL_KEY), Some("OPENAI_API_URL"));
        assert_eq!(env_var_for(API_KEY_KEY), Some("OPENAI_API_KEY"));
        assert_eq!(env_var_for(API_MODEL_KEY), None);
    }
}
