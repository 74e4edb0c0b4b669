//! Engine configuration tree.

use serde::{Deserialize, Serialize};

use super::consensus::ScoringWeights;

/// Main configuration structure for Nexus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub spawner: SpawnerConfig,

    #[serde(default)]
    pub adaptive: AdaptiveTimeoutConfig,

    #[serde(default)]
    pub retry: RetrySubsystemConfig,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub analytics: AnalyticsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Orchestrator tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OrchestratorConfig {
    /// Submissions at or below this length bypass the multi-agent path
    /// with a single gateway call.
    #[serde(default = "default_bypass_max_chars")]
    pub bypass_max_chars: usize,

    /// How long a terminal task entry stays queryable.
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,

    /// Delay before intermediate memory is cleaned after a terminal state.
    #[serde(default = "default_memory_cleanup_delay_secs")]
    pub memory_cleanup_delay_secs: u64,

    /// Token budget for retrieval context synthesis.
    #[serde(default = "default_context_token_budget")]
    pub context_token_budget: usize,

    /// Default agent cohort cap when the caller gives none.
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,

    /// Model used by the meta-analyzer and the short-message bypass.
    #[serde(default = "default_analyzer_model")]
    pub analyzer_model: String,
}

const fn default_bypass_max_chars() -> usize {
    10
}

const fn default_task_retention_secs() -> u64 {
    300
}

const fn default_memory_cleanup_delay_secs() -> u64 {
    10
}

const fn default_context_token_budget() -> usize {
    4000
}

const fn default_max_agents() -> usize {
    5
}

fn default_analyzer_model() -> String {
    "anthropic/claude-sonnet-4.5".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bypass_max_chars: default_bypass_max_chars(),
            task_retention_secs: default_task_retention_secs(),
            memory_cleanup_delay_secs: default_memory_cleanup_delay_secs(),
            context_token_budget: default_context_token_budget(),
            max_agents: default_max_agents(),
            analyzer_model: default_analyzer_model(),
        }
    }
}

/// In-process task queue tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Concurrent orchestrations; 1 serializes task execution.
    #[serde(default = "default_queue_max_concurrent")]
    pub max_concurrent: usize,

    /// Queued tasks older than this are evicted.
    #[serde(default = "default_queue_stale_secs")]
    pub stale_after_secs: u64,

    /// Admission is rejected when queued payloads exceed this many bytes.
    #[serde(default = "default_memory_watermark_bytes")]
    pub memory_watermark_bytes: u64,

    /// Interval of the eviction health loop.
    #[serde(default = "default_queue_health_secs")]
    pub health_interval_secs: u64,
}

const fn default_queue_max_concurrent() -> usize {
    1
}

const fn default_queue_stale_secs() -> u64 {
    300
}

const fn default_memory_watermark_bytes() -> u64 {
    256 * 1024 * 1024
}

const fn default_queue_health_secs() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_queue_max_concurrent(),
            stale_after_secs: default_queue_stale_secs(),
            memory_watermark_bytes: default_memory_watermark_bytes(),
            health_interval_secs: default_queue_health_secs(),
        }
    }
}

/// Model gateway client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,

    /// API key; normally supplied via `NEXUS_GATEWAY__API_KEY`.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_gateway_rps")]
    pub rate_limit_rps: f64,

    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,

    /// Model catalog cache lifetime.
    #[serde(default = "default_catalog_ttl_secs")]
    pub catalog_ttl_secs: u64,

    /// Whether zero-priced / `:free` models may be selected.
    #[serde(default)]
    pub allow_free_models: bool,
}

fn default_gateway_base_url() -> String {
    "https://openrouter.ai/api".to_string()
}

const fn default_gateway_rps() -> f64 {
    10.0
}

const fn default_gateway_timeout_secs() -> u64 {
    300
}

const fn default_catalog_ttl_secs() -> u64 {
    3600
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            api_key: String::new(),
            rate_limit_rps: default_gateway_rps(),
            timeout_secs: default_gateway_timeout_secs(),
            catalog_ttl_secs: default_catalog_ttl_secs(),
            allow_free_models: false,
        }
    }
}

/// Model selector tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SelectorConfig {
    /// Sliding window during which a failed model is avoided.
    #[serde(default = "default_avoid_secs")]
    pub failed_model_avoid_secs: u64,
}

const fn default_avoid_secs() -> u64 {
    300
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            failed_model_avoid_secs: default_avoid_secs(),
        }
    }
}

/// Parallel spawner tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SpawnerConfig {
    #[serde(default = "default_spawn_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_spawn_batch")]
    pub batch_size: usize,

    #[serde(default = "default_spawn_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_spawn_retry")]
    pub retry_on_failure: bool,
}

const fn default_spawn_concurrency() -> usize {
    8
}

const fn default_spawn_batch() -> usize {
    4
}

const fn default_spawn_timeout_ms() -> u64 {
    10_000
}

const fn default_spawn_retry() -> bool {
    true
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_spawn_concurrency(),
            batch_size: default_spawn_batch(),
            timeout_ms: default_spawn_timeout_ms(),
            retry_on_failure: default_spawn_retry(),
        }
    }
}

/// Adaptive progress monitor tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AdaptiveTimeoutConfig {
    /// Base window without progress before a `stall` signal, scaled by
    /// complexity.
    #[serde(default = "default_stall_window_ms")]
    pub stall_window_ms: u64,

    /// Base window without progress before a `hung` signal. Always larger
    /// than the stall window.
    #[serde(default = "default_hang_window_ms")]
    pub hang_window_ms: u64,

    /// Sweep interval of the monitor loop.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// EMA smoothing factor for historical completion estimates.
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
}

const fn default_stall_window_ms() -> u64 {
    15_000
}

const fn default_hang_window_ms() -> u64 {
    45_000
}

const fn default_sweep_interval_ms() -> u64 {
    1_000
}

const fn default_ema_alpha() -> f64 {
    0.3
}

impl Default for AdaptiveTimeoutConfig {
    fn default() -> Self {
        Self {
            stall_window_ms: default_stall_window_ms(),
            hang_window_ms: default_hang_window_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            ema_alpha: default_ema_alpha(),
        }
    }
}

/// Retry subsystem tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetrySubsystemConfig {
    #[serde(default = "default_retry_max")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_cap_ms")]
    pub max_retry_delay_ms: u64,

    /// TTL of the in-process pattern cache.
    #[serde(default = "default_pattern_cache_ttl_ms")]
    pub pattern_cache_ttl_ms: u64,
}

const fn default_retry_max() -> u32 {
    3
}

const fn default_retry_base_ms() -> u64 {
    1_000
}

const fn default_retry_cap_ms() -> u64 {
    30_000
}

const fn default_pattern_cache_ttl_ms() -> u64 {
    50
}

impl Default for RetrySubsystemConfig {
    fn default() -> Self {
        Self {
            max_retries: default_retry_max(),
            base_delay_ms: default_retry_base_ms(),
            max_retry_delay_ms: default_retry_cap_ms(),
            pattern_cache_ttl_ms: default_pattern_cache_ttl_ms(),
        }
    }
}

/// Consensus engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConsensusConfig {
    #[serde(default)]
    pub weights: ScoringWeights,

    /// Per-layer time budget.
    #[serde(default = "default_layer_timeout_ms")]
    pub layer_timeout_ms: u64,

    /// Model consulted to arbitrate conflicts.
    #[serde(default = "default_arbiter_model")]
    pub arbiter_model: String,
}

const fn default_layer_timeout_ms() -> u64 {
    60_000
}

fn default_arbiter_model() -> String {
    "anthropic/claude-opus-4.6".to_string()
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            layer_timeout_ms: default_layer_timeout_ms(),
            arbiter_model: default_arbiter_model(),
        }
    }
}

/// Stream hub tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Per-session buffered frame capacity.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Buffered frames beyond which writes drop to the slow path.
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Frames at or above this payload size are compressed.
    #[serde(default = "default_compress_min_bytes")]
    pub compress_min_bytes: usize,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Subscriptions idle longer than this are swept.
    #[serde(default = "default_subscription_idle_secs")]
    pub subscription_idle_secs: u64,

    /// Disconnected sessions are destroyed after this grace period.
    #[serde(default = "default_session_grace_secs")]
    pub session_grace_secs: u64,
}

const fn default_buffer_capacity() -> usize {
    1024
}

const fn default_backpressure_threshold() -> usize {
    768
}

const fn default_flush_interval_ms() -> u64 {
    100
}

const fn default_compress_min_bytes() -> usize {
    1024
}

const fn default_ping_interval_secs() -> u64 {
    25
}

const fn default_subscription_idle_secs() -> u64 {
    1200
}

const fn default_session_grace_secs() -> u64 {
    300
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            backpressure_threshold: default_backpressure_threshold(),
            flush_interval_ms: default_flush_interval_ms(),
            compress_min_bytes: default_compress_min_bytes(),
            ping_interval_secs: default_ping_interval_secs(),
            subscription_idle_secs: default_subscription_idle_secs(),
            session_grace_secs: default_session_grace_secs(),
        }
    }
}

/// Checkpoint service tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointConfig {
    /// TTL on pending checkpoints; must cover the persistence window.
    #[serde(default = "default_checkpoint_ttl_secs")]
    pub ttl_secs: u64,

    /// Grace before a committed checkpoint is deleted.
    #[serde(default = "default_commit_grace_secs")]
    pub commit_grace_secs: u64,
}

const fn default_checkpoint_ttl_secs() -> u64 {
    3600
}

const fn default_commit_grace_secs() -> u64 {
    60
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_checkpoint_ttl_secs(),
            commit_grace_secs: default_commit_grace_secs(),
        }
    }
}

/// Retry analytics database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AnalyticsConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_analytics_path")]
    pub path: String,

    /// Attempts older than this many days are cleaned up.
    #[serde(default = "default_cleanup_days")]
    pub cleanup_days: u32,
}

fn default_analytics_path() -> String {
    ".nexus/analytics.db".to_string()
}

const fn default_cleanup_days() -> u32 {
    90
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            path: default_analytics_path(),
            cleanup_days: default_cleanup_days(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Optional directory for rotating file output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
        }
    }
}
