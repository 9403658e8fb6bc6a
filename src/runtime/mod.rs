//! Runtime: hosts orchestrations and activities against a history store.
//!
//! The runtime owns three kinds of background tasks:
//! - the orchestration dispatcher, turning instance signals into replay passes
//! - `worker_concurrency` activity workers fed by a bounded channel
//! - the recovery sweep, re-signalling running instances every `recovery_interval`
use crate::providers::{HistoryStore, InstanceInfo, InstanceStatus};
use crate::{ActivityContext, OrchestrationContext};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

mod dispatchers;
pub mod observability;
pub mod registry;
pub mod replay_engine;
pub mod retry;
mod state;

use dispatchers::worker::ActivityRequest;
pub use observability::{LogFormat, MetricsSnapshot, ObservabilityConfig, RuntimeMetrics};
pub use registry::{ActivityRegistry, OrchestrationRegistry, RegistryError};
pub use retry::{BackoffStrategy, RetryPolicy};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Maximum replay passes running at once across all instances.
    /// Default: 4
    pub orchestration_concurrency: usize,
    /// Number of activity workers.
    /// Default: 4
    pub worker_concurrency: usize,
    /// Capacity of the activity request channel; dispatch waits when it is full.
    /// Default: 256
    pub dispatch_queue_capacity: usize,
    /// How often running instances are re-signalled as a polling fallback.
    /// Default: 1s
    pub recovery_interval: Duration,
    /// Default retry policy for activities registered without their own.
    pub activity_retry: RetryPolicy,
    /// Retry policy for history store calls made by the runtime.
    pub store_retry: RetryPolicy,
    pub observability: ObservabilityConfig,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            orchestration_concurrency: 4,
            worker_concurrency: 4,
            dispatch_queue_capacity: 256,
            recovery_interval: Duration::from_secs(1),
            activity_retry: RetryPolicy::default(),
            store_retry: RetryPolicy::store_default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// High-level orchestration status derived from the instance projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }

    /// Decode a `Completed` output. `None` for any other status.
    pub fn output_typed<T: serde::de::DeserializeOwned>(&self) -> Option<Result<T, String>> {
        match self {
            OrchestrationStatus::Completed { output } => Some(crate::codec::decode(output)),
            _ => None,
        }
    }
}

impl From<&InstanceInfo> for OrchestrationStatus {
    fn from(info: &InstanceInfo) -> Self {
        match info.status {
            InstanceStatus::Running => OrchestrationStatus::Running,
            InstanceStatus::Completed => OrchestrationStatus::Completed {
                output: info.output.clone().unwrap_or_default(),
            },
            InstanceStatus::Failed => OrchestrationStatus::Failed {
                error: info.error.clone().unwrap_or_default(),
            },
            InstanceStatus::Terminated => OrchestrationStatus::Terminated {
                reason: info.error.clone().unwrap_or_default(),
            },
        }
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F>(pub F);

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers.
///
/// Activities run at least once and must tolerate being re-executed with the same
/// `ActivityContext::event_id`.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process runtime driving orchestrations to completion.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn HistoryStore>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: ActivityRegistry,
    signal_tx: mpsc::UnboundedSender<String>,
    work_tx: mpsc::Sender<ActivityRequest>,
    /// instance -> dirty flag, present while a replay pass is scheduled or running
    instance_gate: std::sync::Mutex<HashMap<String, bool>>,
    /// (instance, scheduling event_id) queued or executing in this process
    in_flight: std::sync::Mutex<HashSet<(String, u64)>>,
    orchestration_permits: Arc<Semaphore>,
    metrics: RuntimeMetrics,
    shutdown_flag: AtomicBool,
    runtime_id: String,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start a new runtime on `history_store` with default options.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a new runtime with custom options.
    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = observability::init_logging(&options.observability);

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = mpsc::channel(options.dispatch_queue_capacity.max(1));
        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            activity_registry,
            signal_tx,
            work_tx,
            instance_gate: std::sync::Mutex::new(HashMap::new()),
            in_flight: std::sync::Mutex::new(HashSet::new()),
            orchestration_permits: Arc::new(Semaphore::new(options.orchestration_concurrency.max(1))),
            metrics: RuntimeMetrics::default(),
            shutdown_flag: AtomicBool::new(false),
            runtime_id,
            options,
        });

        let mut joins = runtime.clone().start_work_dispatcher(work_rx);
        joins.push(runtime.clone().start_orchestration_dispatcher(signal_rx));
        joins.push(runtime.clone().start_recovery_sweep());
        runtime.joins.lock().await.extend(joins);

        info!(
            target: "duraflow::runtime",
            runtime_id = %runtime.runtime_id,
            worker_concurrency = runtime.options.worker_concurrency,
            orchestration_concurrency = runtime.options.orchestration_concurrency,
            "Runtime started"
        );
        runtime
    }

    /// Client bound to this runtime's store that wakes instances directly.
    pub fn client(&self) -> crate::Client {
        crate::Client::with_signal(
            self.history_store.clone(),
            self.signal_tx.clone(),
            self.options.store_retry.clone(),
        )
    }

    pub fn history_store(&self) -> Arc<dyn HistoryStore> {
        self.history_store.clone()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop all background tasks. Activities still executing are abandoned; their
    /// outcome is missing from history and they run again after a restart.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
        info!(target: "duraflow::runtime", runtime_id = %self.runtime_id, "Runtime shut down");
    }
}
