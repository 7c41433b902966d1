//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/threadscope/config.toml`.
//! Every field has a default, so an absent file or an empty section is valid.
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/threadscope/` (~/.config/threadscope/)
//! - Data: `$XDG_DATA_HOME/threadscope/` (~/.local/share/threadscope/)
//! - State/Logs: `$XDG_STATE_HOME/threadscope/` (~/.local/state/threadscope/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Expands a leading `~/` against the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub threading: ThreadingConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============================================
// [watcher]
// ============================================

/// Directory watcher configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Monitored root; `<root>/<project>/<conversation>.jsonl`
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Debounce window for bursts of raw notifications
    #[serde(default = "default_debounce_ms", alias = "debounceMs")]
    pub debounce_ms: u64,

    /// How long a file's size must stay unchanged before it is emitted
    #[serde(default = "default_stability_ms", alias = "stabilityThresholdMs")]
    pub stability_threshold_ms: u64,

    /// Use the polling backend even when native notification is available
    #[serde(default, alias = "forcePolling")]
    pub force_polling: bool,

    #[serde(default = "default_poll_interval_ms", alias = "pollIntervalMs")]
    pub poll_interval_ms: u64,

    /// File extension (without dot) of conversation files
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            debounce_ms: default_debounce_ms(),
            stability_threshold_ms: default_stability_ms(),
            force_polling: false,
            poll_interval_ms: default_poll_interval_ms(),
            extension: default_extension(),
        }
    }
}

impl WatcherConfig {
    /// The root with `~` expanded.
    pub fn resolved_root(&self) -> PathBuf {
        expand_home(&self.root)
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("~/.claude/projects")
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_stability_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_extension() -> String {
    "jsonl".to_string()
}

// ============================================
// [pipeline]
// ============================================

/// Pipeline coordinator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of files processed concurrently
    #[serde(default = "default_worker_pool_size", alias = "workerPoolSize")]
    pub worker_pool_size: usize,

    /// A batch running longer than this releases its worker permit
    #[serde(default = "default_file_timeout_ms", alias = "fileTimeoutMs")]
    pub file_timeout_ms: u64,

    #[serde(default = "default_max_batch_lines", alias = "maxBatchLines")]
    pub max_batch_lines: usize,

    #[serde(default = "default_retry_base_ms", alias = "retryBaseMs")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms", alias = "retryMaxMs")]
    pub retry_max_ms: u64,

    /// Capacity of the watcher → coordinator queue
    #[serde(default = "default_queue_capacity", alias = "queueCapacity")]
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            file_timeout_ms: default_file_timeout_ms(),
            max_batch_lines: default_max_batch_lines(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl PipelineConfig {
    pub fn file_timeout(&self) -> Duration {
        Duration::from_millis(self.file_timeout_ms)
    }

    /// Backoff delay before retry number `attempt` (1-based), doubling from
    /// `retry_base_ms` and capped at `retry_max_ms`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .retry_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_max_ms);
        Duration::from_millis(ms)
    }
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_file_timeout_ms() -> u64 {
    30_000
}

fn default_max_batch_lines() -> usize {
    5000
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_retry_max_ms() -> u64 {
    60_000
}

fn default_queue_capacity() -> usize {
    1024
}

// ============================================
// [threading]
// ============================================

/// Threader thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadingConfig {
    #[serde(default = "default_gap_baseline", alias = "timeGapBaselineMs")]
    pub time_gap_baseline_ms: i64,

    /// Threshold used when the thread's cadence is fast
    #[serde(default = "default_gap_fast", alias = "timeGapFastMs")]
    pub time_gap_fast_ms: i64,

    /// Threshold used when the thread's cadence is slow
    #[serde(default = "default_gap_slow", alias = "timeGapSlowMs")]
    pub time_gap_slow_ms: i64,

    /// Average gap below which cadence counts as fast
    #[serde(default = "default_fast_cadence", alias = "fastCadenceMs")]
    pub fast_cadence_ms: i64,

    /// Average gap above which cadence counts as slow
    #[serde(default = "default_slow_cadence", alias = "slowCadenceMs")]
    pub slow_cadence_ms: i64,

    #[serde(
        default = "default_tool_similarity",
        alias = "toolSimilarityThreshold"
    )]
    pub tool_similarity_threshold: f64,

    /// Number of trailing messages compared against a new message's tools
    #[serde(default = "default_tool_window", alias = "toolWindow")]
    pub tool_window: usize,

    /// Tool-using messages the window needs before the tool rule applies
    #[serde(default = "default_min_tool_pattern", alias = "minToolPattern")]
    pub min_tool_pattern: usize,

    #[serde(default = "default_merge_gap", alias = "mergeGapMs")]
    pub merge_gap_ms: i64,

    /// Threads shorter than this are candidates for merging
    #[serde(default = "default_min_thread_messages", alias = "minThreadMessages")]
    pub min_thread_messages: usize,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            time_gap_baseline_ms: default_gap_baseline(),
            time_gap_fast_ms: default_gap_fast(),
            time_gap_slow_ms: default_gap_slow(),
            fast_cadence_ms: default_fast_cadence(),
            slow_cadence_ms: default_slow_cadence(),
            tool_similarity_threshold: default_tool_similarity(),
            tool_window: default_tool_window(),
            min_tool_pattern: default_min_tool_pattern(),
            merge_gap_ms: default_merge_gap(),
            min_thread_messages: default_min_thread_messages(),
        }
    }
}

fn default_gap_baseline() -> i64 {
    30 * 60 * 1000
}

fn default_gap_fast() -> i64 {
    15 * 60 * 1000
}

fn default_gap_slow() -> i64 {
    60 * 60 * 1000
}

fn default_fast_cadence() -> i64 {
    5 * 60 * 1000
}

fn default_slow_cadence() -> i64 {
    60 * 60 * 1000
}

fn default_tool_similarity() -> f64 {
    0.3
}

fn default_tool_window() -> usize {
    5
}

fn default_min_tool_pattern() -> usize {
    2
}

fn default_merge_gap() -> i64 {
    5 * 60 * 1000
}

fn default_min_thread_messages() -> usize {
    3
}

// ============================================
// [analysis]
// ============================================

/// Context analyzer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pending analysis requests; further requests are dropped
    #[serde(default = "default_analysis_queue", alias = "queueCapacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_cache_capacity", alias = "cacheCapacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_cache_ttl", alias = "cacheTtlSecs")]
    pub cache_ttl_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: default_analysis_queue(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_analysis_queue() -> usize {
    256
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_cache_ttl() -> u64 {
    600
}

// ============================================
// [sink]
// ============================================

/// Fan-out sink configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Address the WebSocket endpoint binds to
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Per-subscriber queue depth; a full queue evicts the subscriber
    #[serde(default = "default_backlog", alias = "maxSubscriberBacklog")]
    pub max_subscriber_backlog: usize,

    /// Events retained for `since` replay
    #[serde(default = "default_replay_capacity", alias = "replayCapacity")]
    pub replay_capacity: usize,

    #[serde(default = "default_heartbeat_interval", alias = "heartbeatIntervalMs")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout", alias = "heartbeatTimeoutMs")]
    pub heartbeat_timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_subscriber_backlog: default_backlog(),
            replay_capacity: default_replay_capacity(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_backlog() -> usize {
    256
}

fn default_replay_capacity() -> usize {
    4096
}

fn default_heartbeat_interval() -> u64 {
    15_000
}

fn default_heartbeat_timeout() -> u64 {
    45_000
}

// ============================================
// [logging]
// ============================================

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Mirror log output to stderr in addition to the log file
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stderr: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.watcher.extension.is_empty() || self.watcher.extension.contains('.') {
            return Err(Error::Config(
                "watcher.extension must be a bare extension such as \"jsonl\"".to_string(),
            ));
        }
        if self.pipeline.worker_pool_size == 0 {
            return Err(Error::Config(
                "pipeline.worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.pipeline.max_batch_lines == 0 || self.pipeline.queue_capacity == 0 {
            return Err(Error::Config(
                "pipeline.max_batch_lines and pipeline.queue_capacity must be positive"
                    .to_string(),
            ));
        }
        if self.pipeline.retry_base_ms > self.pipeline.retry_max_ms {
            return Err(Error::Config(
                "pipeline.retry_base_ms must not exceed pipeline.retry_max_ms".to_string(),
            ));
        }

        let t = &self.threading;
        if t.time_gap_fast_ms <= 0 || t.time_gap_baseline_ms <= 0 || t.time_gap_slow_ms <= 0 {
            return Err(Error::Config(
                "threading time gaps must be positive".to_string(),
            ));
        }
        if !(t.time_gap_fast_ms <= t.time_gap_baseline_ms
            && t.time_gap_baseline_ms <= t.time_gap_slow_ms)
        {
            return Err(Error::Config(
                "threading gaps must satisfy fast <= baseline <= slow".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&t.tool_similarity_threshold) {
            return Err(Error::Config(
                "threading.tool_similarity_threshold must be between 0 and 1".to_string(),
            ));
        }
        if t.tool_window == 0 {
            return Err(Error::Config(
                "threading.tool_window must be at least 1".to_string(),
            ));
        }

        if self.analysis.queue_capacity == 0 {
            return Err(Error::Config(
                "analysis.queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.sink.max_subscriber_backlog == 0 {
            return Err(Error::Config(
                "sink.max_subscriber_backlog must be at least 1".to_string(),
            ));
        }
        if self.sink.heartbeat_timeout_ms < self.sink.heartbeat_interval_ms {
            return Err(Error::Config(
                "sink.heartbeat_timeout_ms must be >= sink.heartbeat_interval_ms".to_string(),
            ));
        }
        self.sink
            .bind
            .parse::<std::net::SocketAddr>()
            .map_err(|e| Error::Config(format!("sink.bind {:?}: {}", self.sink.bind, e)))?;

        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/threadscope/config.toml` (~/.config/threadscope/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("threadscope").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/threadscope/` (~/.local/share/threadscope/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("threadscope")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/threadscope/` (~/.local/state/threadscope/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("threadscope")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/threadscope/threadscope.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("threadscope.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/threadscope/threadscope.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("threadscope.log")
    }
}
