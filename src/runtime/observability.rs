//! Structured logging setup and in-process runtime counters.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable multi-line output
    Pretty,
    /// Single-line output: timestamp level target fields message
    #[default]
    Compact,
}

/// Logging configuration applied by [`init_logging`].
///
/// `RUST_LOG` takes precedence over `log_level` when set.
///
/// ```rust,no_run
/// # use duraflow::runtime::observability::{ObservabilityConfig, LogFormat};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Level applied to the engine's own targets (e.g. "info", "debug")
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!(
        "warn,duraflow::orchestration={level},duraflow::activity={level},duraflow::runtime={level},\
duraflow::client={level},duraflow::trigger={level}"
    )
}

/// Install a global `tracing` subscriber.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}

/// Snapshot of runtime counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub turns: u64,
    pub orch_completions: u64,
    pub orch_failures: u64,
    pub activity_success: u64,
    pub activity_failures: u64,
    pub activity_retries: u64,
    pub store_retries: u64,
}

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    turns: AtomicU64,
    orch_completions: AtomicU64,
    orch_failures: AtomicU64,
    activity_success: AtomicU64,
    activity_failures: AtomicU64,
    activity_retries: AtomicU64,
    store_retries: AtomicU64,
}

impl RuntimeMetrics {
    pub fn record_turn(&self) {
        self.turns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orchestration_completion(&self) {
        self.orch_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orchestration_failure(&self) {
        self.orch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_activity_success(&self) {
        self.activity_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_activity_failure(&self) {
        self.activity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_activity_retry(&self) {
        self.activity_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_retry(&self) {
        self.store_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            turns: self.turns.load(Ordering::Relaxed),
            orch_completions: self.orch_completions.load(Ordering::Relaxed),
            orch_failures: self.orch_failures.load(Ordering::Relaxed),
            activity_success: self.activity_success.load(Ordering::Relaxed),
            activity_failures: self.activity_failures.load(Ordering::Relaxed),
            activity_retries: self.activity_retries.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
        }
    }
}
