use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Launch spec for one upstream MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment passed to the child. Values may contain `${VAR}`
    /// placeholders expanded from the parent environment at spawn time.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, alias = "baseURL")]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            model: default_model(),
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// TTL in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
    #[serde(default = "default_cache_size")]
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: default_cache_ttl(),
            max_size: default_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, UpstreamSpec>,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Confidence below which the structured evaluator defers to the LLM.
    #[serde(default = "default_ai_threshold")]
    pub ai_threshold: f64,
    /// Write per-decision learning snapshots next to the audit log.
    #[serde(default)]
    pub learning_log: bool,
    /// Operational-event webhook targets.
    #[serde(default)]
    pub webhook_urls: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        // An empty document deserializes to all-defaults
        serde_yaml::from_str("{}").expect("empty config is valid")
    }
}

fn default_provider() -> String {
    "mock".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f64 {
    0.3
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_cache_size() -> usize {
    1000
}
fn default_port() -> u16 {
    8090
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_ai_threshold() -> f64 {
    0.8
}

/// Load configuration from a YAML or JSON file and apply environment
/// overrides. A missing file yields the defaults (useful for stdio demos).
pub fn load(path: &Path) -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let mut cfg: Config = match std::fs::read_to_string(path) {
        Ok(text) => serde_yaml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("invalid config file {}: {}", path.display(), e))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        }
        Err(e) => anyhow::bail!("cannot read config file {}: {}", path.display(), e),
    };

    apply_env_overrides(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(port) = std::env::var("PORT") {
        if let Ok(p) = port.parse() {
            cfg.port = p;
        }
    }
    if let Ok(provider) = std::env::var("LLM_PROVIDER") {
        cfg.llm.provider = provider;
    }
    if let Ok(model) = std::env::var("LLM_MODEL") {
        cfg.llm.model = model;
    }
    if let Ok(threshold) = std::env::var("AEGIS_AI_THRESHOLD") {
        match threshold.parse::<f64>() {
            Ok(t) if (0.0..=1.0).contains(&t) => cfg.ai_threshold = t,
            _ => tracing::warn!(value = %threshold, "ignoring invalid AEGIS_AI_THRESHOLD"),
        }
    }
    // Provider keys: an explicit config value wins over the environment.
    if cfg.llm.api_key.is_none() {
        let var = match cfg.llm.provider.as_str() {
            "anthropic" => "ANTHROPIC_API_KEY",
            _ => "OPENAI_API_KEY",
        };
        cfg.llm.api_key = std::env::var(var).ok();
    }
}

fn validate(cfg: &Config) -> anyhow::Result<()> {
    let env_mode = std::env::var("AEGIS_ENV")
        .or_else(|_| std::env::var("RUST_ENV"))
        .unwrap_or_default();
    if env_mode == "production" {
        match &cfg.security.secret_key {
            Some(key) if key.len() >= 32 => {}
            _ => anyhow::bail!(
                "security.secretKey must be at least 32 characters in production"
            ),
        }
        if cfg.llm.provider != "mock" && cfg.llm.api_key.is_none() {
            anyhow::bail!(
                "llm.apiKey (or the provider's environment variable) is required in production"
            );
        }
    }
    Ok(())
}

// ── Environment placeholder expansion ────────────────────────

static ENV_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Expand `${VAR}` placeholders against the parent process environment.
/// Unset variables expand to the empty string with a warning.
pub fn expand_env(value: &str) -> String {
    ENV_PLACEHOLDER
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            std::env::var(name).unwrap_or_else(|_| {
                tracing::warn!(var = name, "environment placeholder is unset");
                String::new()
            })
        })
        .into_owned()
}

// ── Tests ────────────────────────────────────────────────────
