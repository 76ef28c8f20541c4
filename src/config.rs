use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;

use crate::error::{ChatError, Result};
use crate::reconciliation::ReconciliationPolicy;
use crate::types::RetryInfo;

pub const DEFAULT_TYPING_DEBOUNCE: Duration = Duration::from_millis(1000);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OUTBOUND_BUFFER: usize = 128;

#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Base URL of the REST API (`/chat/messages/{peer}` and `/users/{id}` hang off it)
    pub api_base_url: Url,

    /// WebSocket endpoint of the chat server
    pub socket_url: Url,

    /// Directory for application data (token fallback file, device key)
    pub data_dir: PathBuf,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    /// How long an outgoing "typing" stays on before it is switched off automatically
    pub typing_debounce: Duration,

    /// Backoff schedule used by the connection state machine
    pub reconnect: RetryInfo,

    pub reconciliation_policy: ReconciliationPolicy,

    pub request_timeout: Duration,

    /// Capacity of the outbound event queue
    pub outbound_buffer: usize,
}

impl ChatConfig {
    pub fn new(
        api_base_url: &str,
        socket_url: &str,
        data_dir: &Path,
        logs_dir: &Path,
    ) -> Result<Self> {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Ok(Self {
            api_base_url: parse_http_url(api_base_url)?,
            socket_url: parse_socket_url(socket_url)?,
            data_dir: data_dir.join(env_suffix),
            logs_dir: logs_dir.join(env_suffix),
            typing_debounce: DEFAULT_TYPING_DEBOUNCE,
            reconnect: RetryInfo::new(),
            reconciliation_policy: ReconciliationPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        })
    }

    /// Reads the configuration from the process environment, loading `.env` first.
    ///
    /// Required: `RENTCHAT_API_URL`, `RENTCHAT_SOCKET_URL`.
    /// Optional: `RENTCHAT_DATA_DIR`, `RENTCHAT_LOGS_DIR`, `RENTCHAT_TYPING_DEBOUNCE_MS`,
    /// `RENTCHAT_RECONCILIATION`.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!(
                target: "rentchat::config::from_env",
                "No .env file loaded: {}",
                e
            );
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| ChatError::Configuration(format!("{key} is not set")))
        };

        let api_url = required("RENTCHAT_API_URL")?;
        let socket_url = required("RENTCHAT_SOCKET_URL")?;
        let data_dir = lookup("RENTCHAT_DATA_DIR").unwrap_or_else(|| "./data".to_string());
        let logs_dir = lookup("RENTCHAT_LOGS_DIR").unwrap_or_else(|| "./logs".to_string());

        let mut config = Self::new(
            &api_url,
            &socket_url,
            Path::new(&data_dir),
            Path::new(&logs_dir),
        )?;

        if let Some(raw) = lookup("RENTCHAT_TYPING_DEBOUNCE_MS") {
            let millis = raw.parse::<u64>().map_err(|e| {
                ChatError::Configuration(format!("RENTCHAT_TYPING_DEBOUNCE_MS={raw}: {e}"))
            })?;
            config.typing_debounce = Duration::from_millis(millis);
        }

        if let Some(raw) = lookup("RENTCHAT_RECONCILIATION") {
            config.reconciliation_policy = raw.parse()?;
        }

        Ok(config)
    }

    pub fn with_typing_debounce(mut self, debounce: Duration) -> Self {
        self.typing_debounce = debounce;
        self
    }

    pub fn with_reconnect(mut self, reconnect: RetryInfo) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_reconciliation_policy(mut self, policy: ReconciliationPolicy) -> Self {
        self.reconciliation_policy = policy;
        self
    }

    /// Joins path segments onto the API base URL, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ChatError::Configuration(format!(
                    "API base URL cannot carry a path: {}",
                    self.api_base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn parse_http_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| ChatError::Configuration(format!("invalid API URL {raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ChatError::Configuration(format!(
            "API URL must be http(s), got {other}"
        ))),
    }
}

fn parse_socket_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| ChatError::Configuration(format!("invalid socket URL {raw}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ChatError::Configuration(format!(
            "socket URL must be ws(s), got {other}"
        ))),
    }
}
