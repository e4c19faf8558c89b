// Configuration: environment-driven settings plus runtime-mutable knobs

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

static CONFIG: OnceCell<RwLock<AppConfig>> = OnceCell::new();

// Knobs the management endpoints flip at runtime; read on every request.
static STREAMING_FAKE: AtomicBool = AtomicBool::new(false);
static FORCE_THINKING: AtomicBool = AtomicBool::new(false);
static FORCE_WEB_SEARCH: AtomicBool = AtomicBool::new(false);
static FORCE_URL_CONTEXT: AtomicBool = AtomicBool::new(false);

/// How response bodies travel from the upstream to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    /// SSE bytes are forwarded as they arrive.
    Real,
    /// The upstream response is buffered and delivered as one SSE frame.
    Fake,
}

impl StreamingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamingMode::Real => "real",
            StreamingMode::Fake => "fake",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub api_keys: Vec<String>,
    pub auth_dir: String,
    /// Upstream origin the worker talks to unless `__proxy_host__` overrides it.
    pub upstream_host: String,
    /// Origin clients reach this proxy at; used when rewriting upstream
    /// redirect and upload URLs to point back through the proxy.
    pub public_base_url: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub switch_on_uses: u32,
    pub failure_threshold: u32,
    pub immediate_switch_status_codes: Vec<u16>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let port = 2048;
        Self {
            host: "0.0.0.0".to_string(),
            port,
            api_keys: Vec::new(),
            auth_dir: "~/.aistudio-proxy/auth".to_string(),
            upstream_host: "https://alkalimakersuite-pa.clients6.google.com".to_string(),
            public_base_url: format!("http://127.0.0.1:{port}"),
            max_retries: 3,
            retry_delay_ms: 2000,
            switch_on_uses: 0,
            failure_threshold: 0,
            immediate_switch_status_codes: vec![429, 503],
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

pub fn parse_status_codes(raw: &str) -> Vec<u16> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<u16>().ok())
        .collect()
}

pub fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// Accept either a bare authority or a full origin.
pub fn normalize_origin(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Build the configuration from process environment variables.
pub fn from_env() -> AppConfig {
    let mut config = AppConfig::default();

    if let Some(host) = env_str("HOST") {
        config.host = host;
    }
    if let Some(port) = env_str("PORT").and_then(|v| v.parse().ok()) {
        config.port = port;
    }
    if let Some(keys) = env_str("API_KEYS") {
        config.api_keys = parse_csv(&keys);
    }
    if let Some(dir) = env_str("AUTH_DIR") {
        config.auth_dir = dir;
    }
    if let Some(upstream) = env_str("UPSTREAM_HOST") {
        config.upstream_host = normalize_origin(&upstream);
    }
    config.public_base_url = env_str("PUBLIC_BASE_URL")
        .map(|v| v.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", config.port));
    if let Some(retries) = env_str("MAX_RETRIES").and_then(|v| v.parse().ok()) {
        config.max_retries = retries;
    }
    if let Some(delay) = env_str("RETRY_DELAY").and_then(|v| v.parse().ok()) {
        config.retry_delay_ms = delay;
    }
    if let Some(uses) = env_str("SWITCH_ON_USES").and_then(|v| v.parse().ok()) {
        config.switch_on_uses = uses;
    }
    if let Some(threshold) = env_str("FAILURE_THRESHOLD").and_then(|v| v.parse().ok()) {
        config.failure_threshold = threshold;
    }
    if let Some(codes) = env_str("IMMEDIATE_SWITCH_STATUS_CODES") {
        config.immediate_switch_status_codes = parse_status_codes(&codes);
    }

    config
}

/// Install the configuration and seed the runtime knobs from the environment.
pub fn init_from_env() {
    init(from_env());
    if let Some(mode) = env_str("STREAMING_MODE") {
        set_streaming_mode(match mode.trim().to_ascii_lowercase().as_str() {
            "fake" => StreamingMode::Fake,
            _ => StreamingMode::Real,
        });
    }
    set_force_thinking(env_str("FORCE_THINKING").map(|v| parse_bool(&v)).unwrap_or(false));
    set_force_web_search(env_str("FORCE_WEB_SEARCH").map(|v| parse_bool(&v)).unwrap_or(false));
    set_force_url_context(env_str("FORCE_URL_CONTEXT").map(|v| parse_bool(&v)).unwrap_or(false));
}

pub fn init(config: AppConfig) {
    if let Some(lock) = CONFIG.get() {
        *lock.write() = config;
    } else {
        CONFIG.set(RwLock::new(config)).ok();
    }
}

pub fn get() -> AppConfig {
    CONFIG.get().map(|lock| lock.read().clone()).unwrap_or_default()
}

pub fn streaming_mode() -> StreamingMode {
    if STREAMING_FAKE.load(Ordering::Relaxed) {
        StreamingMode::Fake
    } else {
        StreamingMode::Real
    }
}

pub fn set_streaming_mode(mode: StreamingMode) {
    STREAMING_FAKE.store(mode == StreamingMode::Fake, Ordering::Relaxed);
}

pub fn force_thinking() -> bool {
    FORCE_THINKING.load(Ordering::Relaxed)
}

pub fn set_force_thinking(on: bool) {
    FORCE_THINKING.store(on, Ordering::Relaxed);
}

pub fn force_web_search() -> bool {
    FORCE_WEB_SEARCH.load(Ordering::Relaxed)
}

pub fn set_force_web_search(on: bool) {
    FORCE_WEB_SEARCH.store(on, Ordering::Relaxed);
}

pub fn force_url_context() -> bool {
    FORCE_URL_CONTEXT.load(Ordering::Relaxed)
}

pub fn set_force_url_context(on: bool) {
    FORCE_URL_CONTEXT.store(on, Ordering::Relaxed);
}

pub fn resolve_auth_dir() -> PathBuf {
    let auth_dir = get().auth_dir;

    if let Some(stripped) = auth_dir.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }

    PathBuf::from(auth_dir)
}
