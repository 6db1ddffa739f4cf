use crate::queue::Priority;
use crate::resilience::{BreakerConfig, RetryConfig};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub plans: PlansConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_body_bytes() -> usize {
    64 * 1024
}

/// Durable cache tier location. Without a path the tier lives in memory.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    /// Generation requests allowed per identity per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Per-IP HTTP limit applied in front of every route.
    #[serde(default = "default_per_second")]
    pub per_second: u64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            sweep_interval_secs: default_sweep_interval(),
            per_second: default_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

fn default_max_requests() -> u32 {
    1
}
fn default_window_secs() -> u64 {
    60
}
fn default_sweep_interval() -> u64 {
    300 // 5 minutes
}
fn default_per_second() -> u64 {
    10
}
fn default_burst_size() -> u32 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Interval of the background durable-tier sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_entries: default_max_memory_entries(),
            max_age_secs: default_max_age_secs(),
            similarity_threshold: default_similarity_threshold(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_max_memory_entries() -> usize {
    100
}
fn default_max_age_secs() -> u64 {
    86400 // 24 hours
}
fn default_similarity_threshold() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_inter_job_delay_ms")]
    pub inter_job_delay_ms: u64,
    /// A failed job waits `retry_backoff_ms * 2^retries` before re-entering the queue.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_queue_max_retries(),
            inter_job_delay_ms: default_inter_job_delay_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_queue_max_retries() -> u32 {
    3
}
fn default_inter_job_delay_ms() -> u64 {
    2000
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_event_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,
    /// Bearer token sent to the endpoint, if it requires one.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    /// Circuit breaker key for the remote call.
    #[serde(default = "default_operation_id")]
    pub operation_id: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint_url: default_endpoint_url(),
            api_key: None,
            timeout_secs: default_generation_timeout(),
            operation_id: default_operation_id(),
        }
    }
}

fn default_endpoint_url() -> String {
    "http://localhost:54321/functions/v1/generate-brand".to_string()
}
fn default_generation_timeout() -> u64 {
    120
}
fn default_operation_id() -> String {
    "generate-brand".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlanConfig {
    pub variations: u32,
    pub priority: Priority,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlansConfig {
    #[serde(default = "default_free_plan")]
    pub free: PlanConfig,
    #[serde(default = "default_pro_plan")]
    pub pro: PlanConfig,
    #[serde(default = "default_premium_plan")]
    pub premium: PlanConfig,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            free: default_free_plan(),
            pro: default_pro_plan(),
            premium: default_premium_plan(),
        }
    }
}

fn default_free_plan() -> PlanConfig {
    PlanConfig {
        variations: 3,
        priority: Priority::Low,
    }
}
fn default_pro_plan() -> PlanConfig {
    PlanConfig {
        variations: 8,
        priority: Priority::Normal,
    }
}
fn default_premium_plan() -> PlanConfig {
    PlanConfig {
        variations: 12,
        priority: Priority::High,
    }
}

impl AppConfig {
    /// Validate configuration before starting the service.
    pub fn validate(&self) -> Result<(), String> {
        let url = &self.generator.endpoint_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!(
                "generator.endpoint_url must be an http(s) URL, got {url:?}. \
                 Set it in config.toml or via BRANDFORGE__GENERATOR__ENDPOINT_URL env var."
            ));
        }
        if self.rate_limit.max_requests == 0 {
            return Err("rate_limit.max_requests must be at least 1".to_string());
        }
        if self.rate_limit.window_secs == 0 {
            return Err("rate_limit.window_secs must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err("cache.similarity_threshold must be between 0 and 1".to_string());
        }
        if self.cache.max_memory_entries < 2 {
            return Err("cache.max_memory_entries must be at least 2".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err("retry.backoff_multiplier must be at least 1".to_string());
        }
        if self.breaker.failure_threshold == 0 {
            return Err("breaker.failure_threshold must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        // Load from config file
        let path = config_path.unwrap_or("config.toml");
        builder = builder.add_source(File::with_name(path).required(false));

        // Overlay with environment variables (BRANDFORGE__SERVER__PORT=3001, etc.)
        builder = builder.add_source(
            Environment::with_prefix("BRANDFORGE")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
