use std::{path::PathBuf, time::Duration};

use tracing::warn;

const DEFAULT_PORT: u16 = 4000;
const DEFAULT_TOKEN_TTL_SECONDS: u64 = 300;
const DEFAULT_EXPIRY_GRACE_SECONDS: u64 = 60;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_MAX_PREPARE_CONCURRENCY: usize = 2;
const DEFAULT_WORKER_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: usize = 60;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 60;
const MAX_TOKEN_LIFETIME_SECONDS: u64 = 30 * 24 * 60 * 60;
const DEFAULT_WORKER_BINARY: &str = "yt-dlp";
const TEMP_DIR_NAME: &str = "social-downloader";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub token_ttl: Duration,
    pub expiry_grace: Duration,
    pub sweep_interval: Duration,
    pub max_prepare_concurrency: usize,
    pub worker_timeout: Duration,
    pub rate_limit_max_requests: usize,
    pub rate_limit_window: Duration,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
    pub worker_binary: String,
    pub temp_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).and_then(|value| non_empty(&value));

        let bind_addr = read("APP_ADDR").unwrap_or_else(|| {
            let port = parse_or_default(&read, "PORT", DEFAULT_PORT, |_| true);
            format!("0.0.0.0:{port}")
        });

        let seconds = |name: &str, default: u64| {
            Duration::from_secs(parse_or_default(&read, name, default, |value| *value > 0))
        };

        Self {
            bind_addr,
            token_ttl: Duration::from_secs(parse_or_default(
                &read,
                "TOKEN_TTL_SECONDS",
                DEFAULT_TOKEN_TTL_SECONDS,
                |value| (1..=MAX_TOKEN_LIFETIME_SECONDS).contains(value),
            )),
            expiry_grace: Duration::from_secs(parse_or_default(
                &read,
                "EXPIRY_GRACE_SECONDS",
                DEFAULT_EXPIRY_GRACE_SECONDS,
                |value| *value <= MAX_TOKEN_LIFETIME_SECONDS,
            )),
            sweep_interval: seconds("SWEEP_INTERVAL_SECONDS", DEFAULT_SWEEP_INTERVAL_SECONDS),
            max_prepare_concurrency: parse_or_default(
                &read,
                "MAX_PREPARE_CONCURRENCY",
                DEFAULT_MAX_PREPARE_CONCURRENCY,
                |value| *value > 0,
            ),
            worker_timeout: seconds("WORKER_TIMEOUT_SECONDS", DEFAULT_WORKER_TIMEOUT_SECONDS),
            rate_limit_max_requests: parse_or_default(
                &read,
                "RATE_LIMIT_MAX_REQUESTS",
                DEFAULT_RATE_LIMIT_MAX_REQUESTS,
                |value| *value > 0,
            ),
            rate_limit_window: seconds(
                "RATE_LIMIT_WINDOW_SECONDS",
                DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
            ),
            trust_proxy_headers: read("TRUST_PROXY_HEADERS")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(false),
            allowed_origins: read("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            worker_binary: read("YT_DLP_PATH").unwrap_or_else(|| DEFAULT_WORKER_BINARY.to_string()),
            temp_root: read("DOWNLOAD_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join(TEMP_DIR_NAME)),
        }
    }
}

fn parse_or_default<T, R, V>(read: &R, name: &str, default: T, valid: V) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
    R: Fn(&str) -> Option<String>,
    V: Fn(&T) -> bool,
{
    let Some(raw) = read(name) else {
        return default;
    };

    match raw.parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warn!(variable = name, value = %raw, "invalid value, using default {default}");
            default
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
