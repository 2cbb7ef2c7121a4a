//! Layered configuration for renderforge.
//!
//! Sources, lowest to highest precedence:
//! 1. built-in defaults
//! 2. TOML file (`.renderforge/renderforge.toml`, or `--config <path>`)
//! 3. `.env` in the working directory
//! 4. process environment
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8000
//! cors_origins = ["http://localhost:3000"]
//! rate_limit_per_min = 60
//!
//! [llm]
//! provider = "ollama"
//! ollama_model = "deepseek-coder:6.7b"
//!
//! [render]
//! mode = "docker"
//! timeout_secs = 120
//! max_retries = 2
//! use_queue = true
//! workers = 2
//!
//! [sandbox]
//! image = "manim-ai-renderer:latest"
//! memory = "1g"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::render::llm::LlmProvider;
use crate::render::models::Quality;
use crate::render::sandbox::{RenderMode, SandboxConfig};

pub const DEFAULT_CONFIG_PATH: &str = ".renderforge/renderforge.toml";

const REDACTED: &str = "***";

/// Upper bound on `render.max_retries`; each retry costs one LLM repair.
pub const MAX_RENDER_RETRIES: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Requests per client per rolling minute; 0 disables the limit.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_min: u32,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

fn default_rate_limit() -> u32 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
            rate_limit_per_min: default_rate_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,

    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    #[serde(default = "default_openai_model")]
    pub openai_model: String,

    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,

    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,
}

fn default_request_timeout() -> u64 {
    120
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-5-mini".to_string()
}

fn default_ollama_base_url() -> String {
    "http://ollama:11434".to_string()
}

fn default_ollama_model() -> String {
    "deepseek-coder:6.7b".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            request_timeout_secs: default_request_timeout(),
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            openai_model: default_openai_model(),
            ollama_base_url: default_ollama_base_url(),
            ollama_model: default_ollama_model(),
        }
    }
}

impl LlmConfig {
    /// Model name for the selected provider; part of the generation cache key.
    pub fn active_model(&self) -> &str {
        match self.provider {
            LlmProvider::Ollama => &self.ollama_model,
            LlmProvider::OpenAi => &self.openai_model,
            LlmProvider::Template => "template",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderConfig {
    #[serde(default)]
    pub mode: RenderMode,

    /// Renderer command line; defaults to `docker` or `manim` by mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default = "default_render_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub default_quality: Quality,

    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    /// Parent of per-render scratch directories; the system temp dir when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub use_queue: bool,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_render_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    2
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage/videos")
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("storage/spool")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("storage/renderforge.db")
}

fn default_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            mode: RenderMode::default(),
            command: None,
            timeout_secs: default_render_timeout(),
            max_retries: default_max_retries(),
            default_quality: Quality::default(),
            storage_root: default_storage_root(),
            spool_dir: default_spool_dir(),
            scratch_dir: None,
            database_path: default_database_path(),
            use_queue: false,
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid log format '{}'. Valid values: text, json", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Daily-rolling log files are written here when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

/// Effective settings after all layers are applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub render: RenderConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load every layer. An explicit `path` must exist; the default path is
    /// optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };

        // A missing .env is normal.
        let _ = dotenvy::dotenv();
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.check()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides read through `lookup`. Empty values are
    /// ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("PORT") {
            self.server.port = parse_value("PORT", &v)?;
        }
        if let Some(v) = get("CORS_ORIGINS") {
            self.server.cors_origins = v
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("RATE_LIMIT_PER_MIN") {
            self.server.rate_limit_per_min = parse_value("RATE_LIMIT_PER_MIN", &v)?;
        }

        if let Some(v) = get("LLM_PROVIDER") {
            self.llm.provider = parse_value("LLM_PROVIDER", &v)?;
        }
        if let Some(v) = get("LLM_REQUEST_TIMEOUT_SEC") {
            self.llm.request_timeout_secs = parse_value("LLM_REQUEST_TIMEOUT_SEC", &v)?;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_MODEL") {
            self.llm.openai_model = v;
        }
        if let Some(v) = get("OLLAMA_BASE_URL") {
            self.llm.ollama_base_url = v;
        }
        if let Some(v) = get("OLLAMA_MODEL") {
            self.llm.ollama_model = v;
        }

        if let Some(v) = get("RENDER_MODE") {
            self.render.mode = parse_value("RENDER_MODE", &v)?;
        }
        if let Some(v) = get("RENDER_TIMEOUT_SEC") {
            self.render.timeout_secs = parse_value("RENDER_TIMEOUT_SEC", &v)?;
        }
        if let Some(v) = get("MAX_RENDER_RETRIES") {
            self.render.max_retries = parse_value("MAX_RENDER_RETRIES", &v)?;
        }
        if let Some(v) = get("DEFAULT_RENDER_QUALITY") {
            self.render.default_quality = parse_value("DEFAULT_RENDER_QUALITY", &v)?;
        }
        if let Some(v) = get("VIDEO_STORAGE_ROOT") {
            self.render.storage_root = PathBuf::from(v);
        }
        if let Some(v) = get("DATABASE_PATH") {
            self.render.database_path = PathBuf::from(v);
        }
        if let Some(v) = get("USE_QUEUE") {
            self.render.use_queue = parse_bool("USE_QUEUE", &v)?;
        }
        if let Some(v) = get("RENDER_WORKERS") {
            self.render.workers = parse_value("RENDER_WORKERS", &v)?;
        }

        if let Some(v) = get("RENDERER_IMAGE") {
            self.sandbox.image = v;
        }
        if let Some(v) = get("SANDBOX_CPU") {
            self.sandbox.cpus = v;
        }
        if let Some(v) = get("SANDBOX_MEMORY") {
            self.sandbox.memory = v;
        }
        if let Some(v) = get("SANDBOX_PIDS_LIMIT") {
            self.sandbox.pids_limit = parse_value("SANDBOX_PIDS_LIMIT", &v)?;
        }
        if let Some(v) = get("SANDBOX_READ_ONLY") {
            self.sandbox.read_only = parse_bool("SANDBOX_READ_ONLY", &v)?;
        }
        if let Some(v) = get("SANDBOX_NETWORK_DISABLED") {
            self.sandbox.network_disabled = parse_bool("SANDBOX_NETWORK_DISABLED", &v)?;
        }
        if let Some(v) = get("SANDBOX_NO_NEW_PRIVILEGES") {
            self.sandbox.no_new_privileges = parse_bool("SANDBOX_NO_NEW_PRIVILEGES", &v)?;
        }
        if let Some(v) = get("SANDBOX_SECCOMP_PROFILE") {
            self.sandbox.seccomp_profile = Some(PathBuf::from(v));
        }

        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.logging.format = parse_value("LOG_FORMAT", &v)?;
        }
        if let Some(v) = get("LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Reject settings no component can run with.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.render.workers == 0 {
            return Err(invalid("render.workers", "0", "must be at least 1"));
        }
        if self.render.timeout_secs == 0 {
            return Err(invalid("render.timeout_secs", "0", "must be at least 1"));
        }
        if self.render.queue_capacity == 0 {
            return Err(invalid("render.queue_capacity", "0", "must be at least 1"));
        }
        if self.render.max_retries > MAX_RENDER_RETRIES {
            return Err(invalid(
                "render.max_retries",
                &self.render.max_retries.to_string(),
                format!("must be at most {}", MAX_RENDER_RETRIES),
            ));
        }
        Ok(())
    }

    /// Copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.llm.openai_api_key.is_some() {
            copy.llm.openai_api_key = Some(REDACTED.to_string());
        }
        copy
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn invalid(key: &str, value: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        message: message.into(),
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, value, e.to_string()))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}
