use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Loaded once at startup from environment variables directly, with documented
/// defaults and ranges for every numeric knob.
#[derive(Debug, Clone)]
pub struct Config {
    pub relay_token: String,
    pub backend_base_url: String,
    pub relay_instance_id: String,
    pub task_timeout_ms: u64,
    pub concurrency: usize,
    pub push_port: u16,
    pub push_path: String,
    pub push_rate_limit_per_sec: u32,
    pub push_max_concurrent_requests: usize,
    pub push_max_queue: usize,
    pub message_flow_log: bool,
    pub gateway_ws_url: String,
    pub openclaw_config_path: Option<PathBuf>,
    pub openclaw_state_dir: PathBuf,
    pub openclaw_gateway_token: Option<String>,
    pub openclaw_gateway_password: Option<String>,
    pub openclaw_scopes: Vec<String>,
    pub transcription: TranscriptionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub filter: String,
    pub rotation: LoggingRotation,
    pub retention_days: usize,
    pub stderr_warn_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingRotation {
    Daily,
    Hourly,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_env(|key| std::env::var(key).ok())
    }

    /// Pure-function core so tests can drive a synthetic environment instead of the
    /// process's real one.
    pub fn from_env(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let relay_token = get("RELAY_TOKEN").filter(|v| !v.is_empty()).context("RELAY_TOKEN is required")?;
        let backend_base_url = get("BACKEND_BASE_URL")
            .filter(|v| !v.is_empty())
            .context("BACKEND_BASE_URL is required")?;
        url::Url::parse(&backend_base_url).with_context(|| format!("BACKEND_BASE_URL '{backend_base_url}' is not a valid URL"))?;

        let relay_instance_id = get("RELAY_INSTANCE_ID").unwrap_or_else(default_instance_id);

        let task_timeout_ms = parse_range(&get, "RELAY_TASK_TIMEOUT_MS", 120_000, 1_000, 2_100_000_000)?;
        let concurrency = parse_range(&get, "RELAY_CONCURRENCY", 4, 1, 1024)? as usize;
        let push_port = parse_range(&get, "RELAY_PUSH_PORT", 8080, 1, 65535)? as u16;
        let push_path = get("RELAY_PUSH_PATH").unwrap_or_else(|| "/relay/messages".to_string());
        if !push_path.starts_with('/') {
            bail!("RELAY_PUSH_PATH must start with '/', got '{push_path}'");
        }
        let push_rate_limit_per_sec = parse_range(&get, "RELAY_PUSH_RATE_LIMIT_PER_SEC", 20, 1, 100_000)? as u32;
        let push_max_concurrent_requests = parse_range(&get, "RELAY_PUSH_MAX_CONCURRENT_REQUESTS", 64, 1, 100_000)? as usize;
        let push_max_queue = parse_range(&get, "RELAY_PUSH_MAX_QUEUE", 256, 1, 1_000_000)? as usize;
        let message_flow_log = get("MESSAGE_FLOW_LOG").map(|v| is_truthy(&v)).unwrap_or(false);

        let gateway_ws_url = get("OPENCLAW_GATEWAY_WS_URL")
            .filter(|v| !v.is_empty())
            .context("OPENCLAW_GATEWAY_WS_URL is required")?;
        url::Url::parse(&gateway_ws_url).with_context(|| format!("OPENCLAW_GATEWAY_WS_URL '{gateway_ws_url}' is not a valid URL"))?;

        let openclaw_config_path = get("OPENCLAW_CONFIG_PATH").map(PathBuf::from);
        let openclaw_state_dir = get("OPENCLAW_STATE_DIR").map(PathBuf::from).unwrap_or_else(default_state_dir);
        let openclaw_gateway_token = get("OPENCLAW_GATEWAY_TOKEN");
        let openclaw_gateway_password = get("OPENCLAW_GATEWAY_PASSWORD");
        let openclaw_scopes = get("OPENCLAW_SCOPES")
            .unwrap_or_else(|| "operator.admin".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        let transcription = TranscriptionConfig {
            provider: get("STT_PROVIDER"),
            api_key: get("STT_API_KEY"),
            model: get("STT_MODEL"),
            language: get("STT_LANGUAGE"),
            timeout_ms: parse_range(&get, "STT_TIMEOUT_MS", 20_000, 1_000, 2_100_000_000)?,
        };

        let logging = LoggingConfig {
            dir: get("RELAY_LOG_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("logs")),
            filter: get("RELAY_LOG_FILTER").unwrap_or_else(|| "info".to_string()),
            rotation: match get("RELAY_LOG_ROTATION").as_deref() {
                Some("hourly") => LoggingRotation::Hourly,
                _ => LoggingRotation::Daily,
            },
            retention_days: parse_range(&get, "RELAY_LOG_RETENTION_DAYS", 30, 0, 3650)? as usize,
            stderr_warn_enabled: get("RELAY_LOG_STDERR").map(|v| is_truthy(&v)).unwrap_or(true),
        };

        Ok(Self {
            relay_token,
            backend_base_url,
            relay_instance_id,
            task_timeout_ms,
            concurrency,
            push_port,
            push_path,
            push_rate_limit_per_sec,
            push_max_concurrent_requests,
            push_max_queue,
            message_flow_log,
            gateway_ws_url,
            openclaw_config_path,
            openclaw_state_dir,
            openclaw_gateway_token,
            openclaw_gateway_password,
            openclaw_scopes,
            transcription,
            logging,
        })
    }
}

fn parse_range(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64, min: u64, max: u64) -> Result<u64> {
    let value = match get(key) {
        Some(raw) => raw.parse::<u64>().with_context(|| format!("{key} must be a non-negative integer, got '{raw}'"))?,
        None => default,
    };
    if value < min || value > max {
        bail!("{key}={value} is out of range [{min}, {max}]");
    }
    Ok(value)
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn default_instance_id() -> String {
    let host = hostname_best_effort();
    let pid = std::process::id();
    let rand: u32 = rand::random();
    format!("{host}-{pid}-{rand:08x}")
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "host".to_string())
}

fn default_state_dir() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(".")).join(".openclaw")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_map(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_required_token_is_an_error() {
        let get = env_map(&[("BACKEND_BASE_URL", "https://example.com"), ("OPENCLAW_GATEWAY_WS_URL", "wss://gw.example.com")]);
        assert!(Config::from_env(get).is_err());
    }

    #[test]
    fn loads_with_defaults_when_optional_vars_absent() {
        let get = env_map(&[
            ("RELAY_TOKEN", "secret"),
            ("BACKEND_BASE_URL", "https://example.com"),
            ("OPENCLAW_GATEWAY_WS_URL", "wss://gw.example.com"),
        ]);
        let config = Config::from_env(get).unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.push_path, "/relay/messages");
        assert_eq!(config.openclaw_scopes, vec!["operator.admin".to_string()]);
    }

    #[test]
    fn out_of_range_numeric_knob_is_rejected() {
        let get = env_map(&[
            ("RELAY_TOKEN", "secret"),
            ("BACKEND_BASE_URL", "https://example.com"),
            ("OPENCLAW_GATEWAY_WS_URL", "wss://gw.example.com"),
            ("RELAY_CONCURRENCY", "0"),
        ]);
        assert!(Config::from_env(get).is_err());
    }

    #[test]
    fn parses_scopes_csv_and_dedupes_whitespace() {
        let get = env_map(&[
            ("RELAY_TOKEN", "secret"),
            ("BACKEND_BASE_URL", "https://example.com"),
            ("OPENCLAW_GATEWAY_WS_URL", "wss://gw.example.com"),
            ("OPENCLAW_SCOPES", "agent.read, agent.write ,"),
        ]);
        let config = Config::from_env(get).unwrap();
        assert_eq!(config.openclaw_scopes, vec!["agent.read".to_string(), "agent.write".to_string()]);
    }
}
