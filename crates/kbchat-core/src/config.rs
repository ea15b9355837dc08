//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::{find_ragflow_token, Department};

/// Top-level kbchat configuration, read from a JSON5 file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<ExchangeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryConfig>,

    /// Department tree of the signed-in user, used for credential lookup
    /// when no explicit API key is configured.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub departments: Vec<Department>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Connection settings for the knowledge-base chat service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Chat assistant id; completions and sessions are scoped to it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Total timeout for session endpoints. Streaming completions are not
    /// bounded by it.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_id: None,
            api_key: None,
            api_key_env: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:9380".into()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

impl UpstreamConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Delay before a completed answer is cleared (default: 1000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_delay_ms: Option<u64>,

    /// Idle time allowed between frames before the stream is abandoned
    /// (default: 120, 0 disables).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_stream_timeout_secs: Option<u64>,

    /// Maximum characters of the first question used as a new session's name (default: 50).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name_max_chars: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default)]
    pub orderby: SessionOrder,

    #[serde(default = "default_true")]
    pub desc: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            orderby: SessionOrder::default(),
            desc: true,
        }
    }
}

fn default_page_size() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

/// Sort key for session listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrder {
    CreateTime,
    #[default]
    UpdateTime,
}

impl SessionOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateTime => "create_time",
            Self::UpdateTime => "update_time",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "kbchat_exchange=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static env-var pattern");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::KbChatError::Io)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::KbChatError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn upstream(&self) -> UpstreamConfig {
        self.upstream.clone().unwrap_or_default()
    }

    pub fn base_url(&self) -> String {
        self.upstream
            .as_ref()
            .map(|u| u.base_url.trim_end_matches('/').to_string())
            .unwrap_or_else(default_base_url)
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.upstream
            .as_ref()
            .and_then(|u| u.chat_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Bearer credential for the upstream: the explicit key if configured,
    /// otherwise the first `ragflow` token in the department tree.
    pub fn resolve_credential(&self) -> Option<String> {
        self.upstream
            .as_ref()
            .and_then(|u| u.resolve_api_key())
            .or_else(|| find_ragflow_token(&self.departments).map(str::to_string))
    }

    pub fn reset_delay(&self) -> Duration {
        let ms = self
            .exchange
            .as_ref()
            .and_then(|e| e.reset_delay_ms)
            .unwrap_or(1000);
        Duration::from_millis(ms)
    }

    /// `None` when the stale-stream timeout is disabled.
    pub fn stale_stream_timeout(&self) -> Option<Duration> {
        let secs = self
            .exchange
            .as_ref()
            .and_then(|e| e.stale_stream_timeout_secs)
            .unwrap_or(120);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    pub fn session_name_max_chars(&self) -> usize {
        self.exchange
            .as_ref()
            .and_then(|e| e.session_name_max_chars)
            .unwrap_or(50)
    }

    pub fn history(&self) -> HistoryConfig {
        self.history.clone().unwrap_or_default()
    }

    /// Get a config value by dotted path (e.g. "upstream.base_url").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.chat_id().is_none() {
            errors.push("upstream.chat_id is not configured".to_string());
        }

        if self.resolve_credential().is_none() {
            warnings.push(
                "No API key configured and no ragflow application found in departments"
                    .to_string(),
            );
        }

        let base_url = self.base_url();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            errors.push(format!("upstream.base_url must be an http(s) URL: {base_url}"));
        }

        if self.history.as_ref().is_some_and(|h| h.page_size == 0) {
            errors.push("history.page_size cannot be 0".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for kbchat data: `~/.kbchat/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kbchat")
}

/// Expand a leading `~` in a user-supplied path.
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}
