use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_BING_BASE_URL: &str = "https://www.bing.com";
pub const DEFAULT_BING_HUB_URL: &str = "wss://sydney.bing.com/sydney/ChatHub";
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Credentials and endpoints, resolved once per process.
#[derive(Clone)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub openai_organization: Option<String>,
    pub openai_base_url: String,
    pub bing_cookie: Option<String>,
    pub bing_base_url: String,
    /// Websocket endpoint of the chat hub.
    pub bing_hub_url: String,
    pub default_model: String,
    pub default_temperature: f64,
    pub default_system: String,
    pub local: LocalScript,
}

/// How the local-subprocess backend is launched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalScript {
    pub interpreter: String,
    pub script: PathBuf,
}

/// `$XDG_CONFIG_HOME/llm/config.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub defaults: DefaultsSection,
    pub local: LocalSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DefaultsSection {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub system: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LocalSection {
    pub interpreter: Option<String>,
    pub script: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_organization: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            bing_cookie: None,
            bing_base_url: DEFAULT_BING_BASE_URL.to_string(),
            bing_hub_url: DEFAULT_BING_HUB_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            default_temperature: 0.0,
            default_system: String::new(),
            local: LocalScript {
                interpreter: DEFAULT_INTERPRETER.to_string(),
                script: default_script_path(),
            },
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("Config")
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("openai_organization", &self.openai_organization)
            .field("openai_base_url", &self.openai_base_url)
            .field("bing_cookie", &redact(&self.bing_cookie))
            .field("bing_base_url", &self.bing_base_url)
            .field("bing_hub_url", &self.bing_hub_url)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("local", &self.local)
            .finish()
    }
}

impl Config {
    /// Environment layered over the optional TOML file.
    pub fn load() -> Self {
        let file = config_file_path()
            .map(|p| FileConfig::load_from(&p))
            .unwrap_or_default();
        Self::from_sources(file, |key| env::var(key).ok())
    }

    /// Precedence: environment, then file, then built-in default.
    pub fn from_sources(file: FileConfig, var: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let openai_api_key = var("OPENAI_API_KEY");
        if openai_api_key.is_none() {
            tracing::debug!("OPENAI_API_KEY not set; OpenAI models unavailable");
        }
        let bing_cookie = var("BING_COOKIE");
        if bing_cookie.is_none() {
            tracing::debug!("BING_COOKIE not set; bing models unavailable");
        }

        Self {
            openai_api_key,
            openai_organization: var("OPENAI_ORGANIZATION_ID"),
            openai_base_url: var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            bing_cookie,
            bing_base_url: var("BING_BASE_URL").unwrap_or(defaults.bing_base_url),
            bing_hub_url: var("BING_HUB_URL").unwrap_or(defaults.bing_hub_url),
            default_model: var("LLM_DEFAULT_MODEL")
                .or(file.defaults.model)
                .unwrap_or(defaults.default_model),
            default_temperature: file
                .defaults
                .temperature
                .unwrap_or(defaults.default_temperature),
            default_system: file.defaults.system.unwrap_or(defaults.default_system),
            local: LocalScript {
                interpreter: var("LLM_LOCAL_INTERPRETER")
                    .or(file.local.interpreter)
                    .unwrap_or(defaults.local.interpreter),
                script: var("LLM_LOCAL_SCRIPT")
                    .map(PathBuf::from)
                    .or(file.local.script)
                    .unwrap_or(defaults.local.script),
            },
        }
    }
}

impl FileConfig {
    /// Missing file is silent; a malformed one is a warning.
    pub fn load_from(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        Self::parse(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), "ignoring malformed config: {e}");
            Self::default()
        })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("llm"))
}

fn config_file_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

fn default_script_path() -> PathBuf {
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("local")
        .join("run.py")
}
