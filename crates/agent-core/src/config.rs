use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_SUBAGENT_MAX_ITERATIONS: usize = 10;
pub const DEFAULT_SUBAGENT_SYSTEM_PROMPT: &str =
    "You are a focused assistant working on a delegated task. Use the available tools, then answer with a concise summary of what you found.";
pub const DEFAULT_CONTINUATION_PROMPT: &str =
    "Continue working on the task from where you left off.";
pub const DEFAULT_SUBAGENT_RETENTION_SECS: u64 = 600;
pub const DEFAULT_RETRY_FAILURE_MESSAGE: &str =
    "Failed to generate an alternative response. Please try again.";

const CONFIG_JSON_FILE: &str = "engine.json";
const CONFIG_TOML_FILE: &str = "engine.toml";

/// Settings shared by the retry generator and the subagent executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub subagent_max_iterations: usize,
    pub subagent_system_prompt: String,
    pub continuation_prompt: String,
    /// How long a finished subagent stays queryable by id.
    pub subagent_retention_secs: u64,
    /// The only text a failed retry shows; backend errors are logged instead.
    pub retry_failure_message: String,
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_output_tokens: None,
            subagent_max_iterations: DEFAULT_SUBAGENT_MAX_ITERATIONS,
            subagent_system_prompt: DEFAULT_SUBAGENT_SYSTEM_PROMPT.to_string(),
            continuation_prompt: DEFAULT_CONTINUATION_PROMPT.to_string(),
            subagent_retention_secs: DEFAULT_SUBAGENT_RETENTION_SECS,
            retry_failure_message: DEFAULT_RETRY_FAILURE_MESSAGE.to_string(),
            data_dir: None,
        }
    }
}

pub fn bodhi_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".bodhi")
}

impl EngineConfig {
    /// `~/.bodhi/engine.json`, else `./engine.toml`, then `BODHI_*`
    /// environment overrides.
    pub fn load() -> Self {
        let mut config = Self::from_file(&bodhi_dir().join(CONFIG_JSON_FILE))
            .or_else(|| Self::from_file(Path::new(CONFIG_TOML_FILE)))
            .unwrap_or_default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) => {
                log::warn!("Failed to read config {:?}: {}", path, error);
                return None;
            }
        };

        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str::<Self>(&content).map_err(|error| error.to_string()),
            _ => serde_json::from_str::<Self>(&content).map_err(|error| error.to_string()),
        };

        match parsed {
            Ok(config) => {
                log::info!("Loaded engine config from {:?}", path);
                Some(config)
            }
            Err(error) => {
                log::warn!("Ignoring invalid config {:?}: {}", path, error);
                None
            }
        }
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("BODHI_MODEL").filter(|value| !value.trim().is_empty()) {
            self.model = Some(model);
        }
        if let Some(value) = lookup("BODHI_MAX_OUTPUT_TOKENS") {
            match value.trim().parse() {
                Ok(tokens) => self.max_output_tokens = Some(tokens),
                Err(_) => log::warn!("Ignoring BODHI_MAX_OUTPUT_TOKENS={:?}", value),
            }
        }
        if let Some(value) = lookup("BODHI_SUBAGENT_MAX_ITERATIONS") {
            match value.trim().parse::<usize>() {
                Ok(iterations) if iterations > 0 => self.subagent_max_iterations = iterations,
                _ => log::warn!("Ignoring BODHI_SUBAGENT_MAX_ITERATIONS={:?}", value),
            }
        }
        if let Some(dir) = lookup("BODHI_DATA_DIR").filter(|value| !value.trim().is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(bodhi_dir)
            .join("conversations")
    }
}
