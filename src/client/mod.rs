use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::providers::{AppendOutcome, HistoryStore, InstanceInfo, InstanceStatus, ProviderError};
use crate::runtime::OrchestrationStatus;
use crate::runtime::retry::{RetryPolicy, retry_store};
use crate::{Event, EventKind, OrchestrationOutcome, codec};

/// Errors returned by [`Client`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("instance not found: {0}")]
    NotFound(String),
    /// The store kept failing with retryable errors.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(ProviderError),
    /// The store rejected the operation permanently.
    #[error("storage error: {0}")]
    Storage(ProviderError),
    #[error("instance is still running: {0}")]
    InstanceRunning(String),
    #[error("timed out waiting for instance: {0}")]
    Timeout(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        if e.is_retryable() {
            ClientError::StorageUnavailable(e)
        } else {
            ClientError::Storage(e)
        }
    }
}

/// Result of starting an instance under a caller-chosen id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// An instance with this id already exists; nothing was changed.
    AlreadyExists,
}

/// Control-plane API: start, inspect, terminate and purge instances.
///
/// A client communicates with runtimes only through the shared history store.
/// Clients obtained from [`Runtime::client`](crate::Runtime::client) also wake
/// the runtime directly; a standalone client relies on the runtime's recovery
/// sweep to notice new instances.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn HistoryStore>,
    signal: Option<mpsc::UnboundedSender<String>>,
    retry: RetryPolicy,
}

impl Client {
    /// Create a client bound to a history store.
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            signal: None,
            retry: RetryPolicy::store_default(),
        }
    }

    pub(crate) fn with_signal(
        store: Arc<dyn HistoryStore>,
        signal: mpsc::UnboundedSender<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            signal: Some(signal),
            retry,
        }
    }

    /// Retry policy applied to store calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn wake(&self, instance: &str) {
        if let Some(tx) = &self.signal {
            let _ = tx.send(instance.to_string());
        }
    }

    /// Start a new instance under a fresh UUID v4 id and return the id.
    pub async fn start_orchestration(
        &self,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_orchestration_with_id(&instance, orchestration, input).await?;
        Ok(instance)
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        orchestration: &str,
        input: &In,
    ) -> Result<String, ClientError> {
        let payload = codec::encode(input).map_err(ClientError::InvalidPayload)?;
        self.start_orchestration(orchestration, payload).await
    }

    /// Start an instance under `instance`. Starting an id that already exists is
    /// a no-op reported as [`StartOutcome::AlreadyExists`].
    pub async fn start_orchestration_with_id(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<StartOutcome, ClientError> {
        let started = EventKind::OrchestrationStarted {
            name: orchestration.to_string(),
            input: input.into(),
        };
        let outcome = retry_store(&self.retry, "start_orchestration", None, || {
            self.store.append(instance, started.clone())
        })
        .await?;
        match outcome {
            AppendOutcome::Appended(_) => {
                info!(
                    target: "duraflow::client",
                    instance_id = %instance,
                    orchestration_name = %orchestration,
                    "Orchestration started"
                );
                self.wake(instance);
                Ok(StartOutcome::Started)
            }
            AppendOutcome::Duplicate(_) | AppendOutcome::InstanceTerminal => {
                debug!(target: "duraflow::client", instance_id = %instance, "Instance already exists");
                Ok(StartOutcome::AlreadyExists)
            }
        }
    }

    /// Instance projection; `NotFound` for unknown ids.
    pub async fn get_status(&self, instance: &str) -> Result<InstanceInfo, ClientError> {
        retry_store(&self.retry, "get_instance", None, || self.store.get_instance(instance))
            .await?
            .ok_or_else(|| ClientError::NotFound(instance.to_string()))
    }

    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        match self.get_status(instance).await {
            Ok(info) => Ok(OrchestrationStatus::from(&info)),
            Err(ClientError::NotFound(_)) => Ok(OrchestrationStatus::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Move a running instance to `Terminated`. Activities already dispatched may
    /// still finish and have their outcome recorded, but the instance never
    /// advances again. Terminating a terminal instance is a no-op.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        let info = self.get_status(instance).await?;
        if info.status.is_terminal() {
            debug!(
                target: "duraflow::client",
                instance_id = %instance,
                status = info.status.as_str(),
                "Instance already terminal; terminate ignored"
            );
            return Ok(());
        }
        let terminated = EventKind::OrchestrationCompleted {
            outcome: OrchestrationOutcome::Terminated { reason: reason.into() },
        };
        let outcome = retry_store(&self.retry, "terminate", None, || {
            self.store.append(instance, terminated.clone())
        })
        .await?;
        if let AppendOutcome::Appended(event_id) = outcome {
            info!(target: "duraflow::client", instance_id = %instance, event_id, "Orchestration terminated");
        }
        Ok(())
    }

    /// Poll until the instance is terminal or `timeout` elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            let status = self.get_orchestration_status(instance).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout(instance.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms.saturating_mul(2)).min(100);
        }
    }

    /// Full history of an instance; `NotFound` for unknown ids.
    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ClientError> {
        let history = retry_store(&self.retry, "read", None, || self.store.read(instance)).await?;
        if history.is_empty() {
            return Err(ClientError::NotFound(instance.to_string()));
        }
        Ok(history)
    }

    pub async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<String>, ClientError> {
        Ok(retry_store(&self.retry, "list_instances", None, || self.store.list_instances(status)).await?)
    }

    /// Delete a terminal instance and its history.
    pub async fn purge_instance(&self, instance: &str) -> Result<(), ClientError> {
        let info = self.get_status(instance).await?;
        if !info.status.is_terminal() {
            return Err(ClientError::InstanceRunning(instance.to_string()));
        }
        let deleted = retry_store(&self.retry, "delete_instance", None, || self.store.delete_instance(instance)).await?;
        if !deleted {
            return Err(ClientError::NotFound(instance.to_string()));
        }
        info!(target: "duraflow::client", instance_id = %instance, "Instance purged");
        Ok(())
    }
}
