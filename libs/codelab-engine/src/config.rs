// Language and engine configuration
use anyhow::{bail, Context, Result};
use codelab_common::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::limits::ResourceLimits;
use crate::sandbox::{IsolationKind, NetworkPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    pub args: Vec<String>,
    pub file_extension: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub image: String,
    pub execution: LanguageExecution,
    /// Floor applied over the challenge's memory limit
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f32,
    /// Run the host-side syntax check before any test case
    #[serde(default = "default_true")]
    pub syntax_check: bool,
}

fn default_cpu_limit() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read languages.json")?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        let mut configs = HashMap::new();
        for config in languages_json.languages {
            match Language::from_str(&config.name) {
                Some(language) => {
                    configs.insert(language, config);
                }
                None => warn!(name = %config.name, "Ignoring unsupported language in config"),
            }
        }

        Ok(Self { configs })
    }

    /// Load with default path (config/languages.json)
    pub fn load_default() -> Result<Self> {
        Self::load(Path::new("config/languages.json"))
    }

    /// Built-in configuration for every supported language
    pub fn builtin() -> Self {
        let entry = |name: &str, version: &str, image: &str, command: &str, args: &[&str], ext: &str, memory: Option<u64>| {
            LanguageConfig {
                name: name.to_string(),
                version: version.to_string(),
                image: image.to_string(),
                execution: LanguageExecution {
                    command: command.to_string(),
                    args: args.iter().map(|s| s.to_string()).collect(),
                    file_extension: ext.to_string(),
                },
                memory_limit_mb: memory,
                cpu_limit: 1.0,
                syntax_check: true,
            }
        };

        let configs = HashMap::from([
            (
                Language::Python,
                entry("python", "3.12", "python:3.12-slim", "python3", &["-I", "-B"], "py", None),
            ),
            (
                Language::JavaScript,
                entry("javascript", "20", "node:20-slim", "node", &[], "js", None),
            ),
            (
                Language::Sql,
                entry("sql", "3", "keinos/sqlite3:latest", "sqlite3", &["-batch", "-bail", "-safe"], "sql", Some(512)),
            ),
        ]);

        Self { configs }
    }

    /// `path` if given, else config/languages.json if present, else built-ins
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new("config/languages.json");
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::builtin())
                }
            }
        }
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        self.configs
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    /// Configured languages, in a stable order
    pub fn list_languages(&self) -> Vec<Language> {
        Language::ALL
            .into_iter()
            .filter(|language| self.configs.contains_key(language))
            .collect()
    }

    /// Serialize back to the languages.json layout
    pub fn to_json(&self) -> Result<String> {
        let languages = self
            .list_languages()
            .iter()
            .filter_map(|language| self.configs.get(language).cloned())
            .collect();
        serde_json::to_string_pretty(&LanguagesJson { languages }).context("Failed to serialize languages.json")
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of submissions executing at once; also the global
    /// ceiling on simultaneously running test cases
    pub max_concurrent_executions: usize,
    /// Test cases of a single submission allowed to run at once
    pub per_submission_parallelism: usize,
    pub max_source_bytes: usize,
    pub isolation: IsolationKind,
    pub network: NetworkPolicy,
    /// Seconds a finished submission stays queryable
    pub retain_finished_secs: u64,
    /// Non-challenge limits (output caps, file and process counts, grace period)
    pub limits: ResourceLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: num_cpus::get().max(1),
            per_submission_parallelism: 4,
            max_source_bytes: 64 * 1024,
            isolation: IsolationKind::default(),
            network: NetworkPolicy::default(),
            retain_finished_secs: 600,
            limits: ResourceLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `CODELAB_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("CODELAB_MAX_CONCURRENT")? {
            config.max_concurrent_executions = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("CODELAB_PER_SUBMISSION_PARALLELISM")? {
            config.per_submission_parallelism = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("CODELAB_MAX_SOURCE_BYTES")? {
            config.max_source_bytes = n;
        }
        if let Some(n) = env_parse::<u64>("CODELAB_RETAIN_SECS")? {
            config.retain_finished_secs = n;
        }
        if let Ok(value) = std::env::var("CODELAB_ISOLATION") {
            config.isolation = IsolationKind::from_str(&value)
                .with_context(|| format!("Invalid CODELAB_ISOLATION: {}", value))?;
        }
        if let Ok(value) = std::env::var("CODELAB_NETWORK") {
            config.network = NetworkPolicy::from_str(&value)
                .with_context(|| format!("Invalid CODELAB_NETWORK: {}", value))?;
        }

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("Invalid {}: {}", key, value)),
        Err(_) => Ok(None),
    }
}
