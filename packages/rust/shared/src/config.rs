//! Application configuration for Fieldforge.
//!
//! User config lives at `~/.fieldforge/fieldforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FieldforgeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "fieldforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".fieldforge";

// ---------------------------------------------------------------------------
// Config structs (matching fieldforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Model providers, each serving a list of model ids.
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    /// Per-model pricing in USD per million tokens.
    #[serde(default = "default_pricing")]
    pub pricing: BTreeMap<String, PricingConfig>,

    /// Search-engine enrichment settings.
    #[serde(default)]
    pub search: SearchConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            providers: default_providers(),
            pricing: default_pricing(),
            search: SearchConfig::default(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory receiving exported datasets and grid summaries.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Path to the experiment log database.
    #[serde(default = "default_database")]
    pub database: String,

    /// Model used by steps that do not name one.
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            database: default_database(),
            default_model: default_model(),
        }
    }
}

fn default_output_dir() -> String {
    "fieldforge-runs".into()
}
fn default_database() -> String {
    "~/.fieldforge/experiments.db".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}

/// `[[providers]]` entry: an OpenAI-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Human-readable provider name.
    pub name: String,
    /// Base URL of the chat completions API (without `/chat/completions`).
    pub base_url: String,
    /// Name of the env var holding the API key (never store the key itself).
    pub api_key_env: String,
    /// Model ids routed to this provider.
    #[serde(default)]
    pub models: Vec<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "openai".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            models: vec![
                "gpt-4o-mini".into(),
                "gpt-4o".into(),
                "gpt-4-turbo-preview".into(),
                "gpt-3.5-turbo-0125".into(),
            ],
            timeout_secs: default_timeout_secs(),
        },
        ProviderConfig {
            name: "together".into(),
            base_url: "https://api.together.xyz/v1".into(),
            api_key_env: "TOGETHER_API_KEY".into(),
            models: vec![
                "mistralai/Mixtral-8x7B-Instruct-v0.1".into(),
                "mistralai/Mistral-7B-Instruct-v0.1".into(),
                "meta-llama/Llama-2-70b-chat-hf".into(),
            ],
            timeout_secs: default_timeout_secs(),
        },
    ]
}

/// `[pricing.<model>]` entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// USD per million prompt tokens.
    pub input: f64,
    /// USD per million completion tokens.
    pub output: f64,
}

fn default_pricing() -> BTreeMap<String, PricingConfig> {
    [
        ("gpt-4o-mini", 0.15, 0.6),
        ("gpt-4o", 2.5, 10.0),
        ("gpt-4-turbo-preview", 10.0, 30.0),
        ("gpt-3.5-turbo-0125", 0.5, 1.5),
        ("mistralai/Mixtral-8x7B-Instruct-v0.1", 0.6, 0.6),
        ("mistralai/Mistral-7B-Instruct-v0.1", 0.2, 0.2),
        ("meta-llama/Llama-2-70b-chat-hf", 0.9, 0.9),
    ]
    .into_iter()
    .map(|(model, input, output)| (model.to_string(), PricingConfig { input, output }))
    .collect()
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search API endpoint accepting `{"q": ...}` POST bodies.
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    /// Name of the env var holding the search API key.
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            api_key_env: default_search_key_env(),
        }
    }
}

fn default_search_endpoint() -> String {
    "https://google.serper.dev/search".into()
}
fn default_search_key_env() -> String {
    "SERPER_API_KEY".into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.fieldforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| FieldforgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.fieldforge/fieldforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| FieldforgeError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| FieldforgeError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| FieldforgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| FieldforgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| FieldforgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| FieldforgeError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Read a provider's API key from the environment variable it names.
pub fn resolve_api_key(env_var: &str) -> Result<String> {
    match std::env::var(env_var) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(FieldforgeError::config(format!(
            "API key not found. Set the {env_var} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("output_dir"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.default_model, "gpt-4o-mini");
        assert_eq!(parsed.providers.len(), 2);
        assert_eq!(parsed.pricing["gpt-3.5-turbo-0125"].output, 1.5);
    }

    #[test]
    fn config_with_custom_provider() {
        let toml_str = r#"
[defaults]
output_dir = "/tmp/runs"

[[providers]]
name = "local"
base_url = "http://localhost:8000/v1"
api_key_env = "LOCAL_KEY"
models = ["my-model"]

[pricing.my-model]
input = 1.0
output = 2.0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.output_dir, "/tmp/runs");
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].timeout_secs, 120);
        assert_eq!(config.pricing.len(), 1);
        assert_eq!(config.search.api_key_env, "SERPER_API_KEY");
    }

    #[test]
    fn expand_home_leaves_plain_paths() {
        assert_eq!(expand_home("/tmp/x.db").unwrap(), PathBuf::from("/tmp/x.db"));
        let expanded = expand_home("~/x.db").unwrap();
        assert!(expanded.ends_with("x.db"));
        assert!(expanded.is_absolute());
    }

    #[test]
    fn api_key_resolution() {
        // Use a unique env var name to avoid interfering with other tests
        let result = resolve_api_key("FF_TEST_NONEXISTENT_KEY_12345");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
