use config::{Config, File};
use serde::Deserialize;

use crate::error::MemtapError;

#[derive(Debug, Deserialize, Clone)]
pub struct MemtapConfig {
    pub service: ServiceConfig,
    pub intercept: InterceptConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

/// Traffic the interceptor is allowed to inspect. Everything else passes
/// through the proxy host untouched and is never decoded.
#[derive(Debug, Deserialize, Clone)]
pub struct InterceptConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub match_host: String,
    pub match_path_prefix: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    /// Store credential. Falls back to `MEMTAP_STORE_API_KEY` when empty.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_retries() -> usize {
    2
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_cap_ms() -> u64 {
    5_000
}

impl StoreConfig {
    /// The credential actually used for outbound calls.
    pub fn resolved_api_key(&self) -> String {
        if self.api_key.is_empty() {
            std::env::var("MEMTAP_STORE_API_KEY").unwrap_or_default()
        } else {
            self.api_key.clone()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    pub dedup_cache_size: usize,
    pub shutdown_flush_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dedup_cache_size: 128,
            shutdown_flush_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    pub default_user_id: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            default_user_id: "default_user".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReflectionConfig {
    pub turn_threshold: u32,
    pub error_threshold: u32,
    pub action_threshold: u32,
    pub recency_window: usize,
    pub relevance_window: usize,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            turn_threshold: 20,
            error_threshold: 3,
            action_threshold: 15,
            recency_window: 20,
            relevance_window: 10,
        }
    }
}

impl MemtapConfig {
    pub fn load(path: &str) -> Result<Self, MemtapError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        Ok(s.try_deserialize()?)
    }
}
