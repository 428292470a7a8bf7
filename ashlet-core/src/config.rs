//! TOML configuration with per-field environment overrides (§6
//! "Configuration resolution") and `validate` diagnostics (§4.7 config
//! action, §8 boundary behavior).

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::AshletError;
use crate::error::Result;
use crate::generator::WireApi;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub wire_api: WireApi,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            base_url: String::new(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            wire_api: WireApi::ChatCompletions,
            max_output_tokens: 256,
            temperature: 0.2,
            stop: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        !self.base_url.is_empty() && !self.api_key.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub no_raw_history: bool,
    pub max_history_commands: usize,
    pub refresh_interval_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            no_raw_history: false,
            max_history_commands: 3000,
            refresh_interval_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DirContextConfig {
    pub ttl_secs: u64,
}

impl Default for DirContextConfig {
    fn default() -> Self {
        DirContextConfig { ttl_secs: 60 * 60 }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Path to a file whose contents replace the embedded default system
    /// prompt template. Read fresh on every `Engine::reload`, so editing the
    /// file and reloading swaps the prompt without restarting the daemon.
    pub template_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub title: String,
    pub referer: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub generation: GenerationConfig,
    pub embedding: EmbeddingConfig,
    pub history: HistoryConfig,
    pub dircontext: DirContextConfig,
    pub prompt: PromptConfig,
    pub telemetry: TelemetryConfig,
}

impl Config {
    pub fn defaults() -> Self {
        Config::default()
    }

    /// `$ASHLET_HOME/config.toml`, `$ASHLET_HOME` defaulting to
    /// `~/.ashlet`. A missing file yields defaults, not an error;
    /// `config_error` is reserved for a file that exists but fails to
    /// parse.
    pub async fn load(ashlet_home: Option<&Path>) -> Result<Self> {
        let path = config_path(ashlet_home);
        let mut config = match tokio::fs::read_to_string(&path).await {
            Ok(content) => toml::from_str(&content).map_err(|err| AshletError::Config(err.to_string()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Config::defaults(),
            Err(err) => return Err(err.into()),
        };
        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Warnings surfaced by the `validate` config action (§4.7, §8).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.history.no_raw_history && !self.embedding.is_enabled() {
            warnings.push(
                "no_raw_history is enabled but embedding is not configured: recent and related history will always be empty"
                    .to_string(),
            );
        }
        if self.generation.api_key.is_empty() {
            warnings.push("generation.api_key is not set: completions will fail with not_configured".to_string());
        }
        warnings
    }
}

fn config_path(ashlet_home: Option<&Path>) -> PathBuf {
    let home = ashlet_home.map(Path::to_path_buf).unwrap_or_else(default_ashlet_home);
    home.join("config.toml")
}

fn default_ashlet_home() -> PathBuf {
    if let Ok(override_home) = std::env::var("ASHLET_HOME") {
        if !override_home.is_empty() {
            return PathBuf::from(override_home);
        }
    }
    dirs::home_dir().unwrap_or_default().join(".ashlet")
}

fn apply_env_overrides(config: &mut Config) {
    override_field(&mut config.generation.base_url, "ASHLET_GENERATION_BASE_URL");
    override_field(&mut config.generation.api_key, "ASHLET_GENERATION_API_KEY");
    override_field(&mut config.generation.model, "ASHLET_GENERATION_MODEL");
    override_field(&mut config.embedding.base_url, "ASHLET_EMBEDDING_BASE_URL");
    override_field(&mut config.embedding.api_key, "ASHLET_EMBEDDING_API_KEY");
    override_field(&mut config.embedding.model, "ASHLET_EMBEDDING_MODEL");
}

fn override_field(field: &mut String, env_key: &str) {
    if let Ok(value) = std::env::var(env_key) {
        if !value.is_empty() {
            *field = value;
        }
    }
}
