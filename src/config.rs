use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which upstream the proxy sends `/v1/messages` traffic to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Forward to the Anthropic upstream unchanged.
    Direct,
    /// Rewrite to OpenAI chat-completions and send to OpenRouter.
    Translated,
}

impl Default for ProxyMode {
    fn default() -> Self {
        ProxyMode::Direct
    }
}

/// Per-family model substitution used in translated mode. A request whose
/// model name contains the family keyword is rewritten to the mapped
/// upstream model; anything else passes through.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelMap {
    #[serde(default)]
    pub sonnet: Option<String>,
    #[serde(default)]
    pub opus: Option<String>,
    #[serde(default)]
    pub haiku: Option<String>,
    /// Applied when the inbound request carries no model at all.
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_masked_headers")]
    pub masked_headers: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            retention_hours: default_retention_hours(),
            masked_headers: default_masked_headers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub mode: ProxyMode,
    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,
    #[serde(default = "default_openrouter_base_url")]
    pub openrouter_base_url: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default)]
    pub models: ModelMap,
    #[serde(default = "default_blocked_tools")]
    pub blocked_tools: Vec<String>,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mode: ProxyMode::default(),
            anthropic_base_url: default_anthropic_base_url(),
            openrouter_base_url: default_openrouter_base_url(),
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            log_level: default_log_level(),
            metrics_path: default_metrics_path(),
            models: ModelMap::default(),
            blocked_tools: default_blocked_tools(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load the JSON config file named by `PERISCOPE_CONFIG` (if any), then
    /// apply environment overrides on top. API keys are never part of the
    /// file; they are read from the environment at each use.
    pub fn load() -> Result<Self, String> {
        let mut config = match std::env::var("PERISCOPE_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| format!("config_read_failed: {err}"))?;
        serde_json::from_str(&raw).map_err(|err| format!("config_parse_failed: {err}"))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_nonempty("ANTHROPIC_BASE_URL") {
            self.anthropic_base_url = v;
        }
        if let Some(v) = env_nonempty("OPENROUTER_BASE_URL") {
            self.openrouter_base_url = v;
        }
        if let Some(v) = env_nonempty("HOST") {
            self.host = v;
        }
        if let Some(v) = env_nonempty("PORT").and_then(|v| v.parse().ok()) {
            self.port = v;
        }
        if let Some(v) = env_nonempty("REQUEST_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.request_timeout_secs = v;
        }
        if let Some(v) = env_nonempty("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = env_nonempty("PERISCOPE_METRICS_PATH") {
            self.metrics_path = v;
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_blocked_tools() -> Vec<String> {
    vec!["BatchTool".to_string()]
}

fn default_max_records() -> usize {
    1000
}

fn default_retention_hours() -> u64 {
    24
}

fn default_masked_headers() -> Vec<String> {
    vec!["x-api-key".to_string(), "authorization".to_string()]
}
