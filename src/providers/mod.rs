use serde::{Deserialize, Serialize};

use crate::{Event, EventKind, OrchestrationOutcome};

pub mod error;
/// In-memory provider for tests.
pub mod in_memory;
/// SQLite provider for durable, crash-recoverable deployments.
pub mod sqlite;

pub use error::ProviderError;

/// Lifecycle state of an instance. Every state except `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Terminated,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "Running",
            InstanceStatus::Completed => "Completed",
            InstanceStatus::Failed => "Failed",
            InstanceStatus::Terminated => "Terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Running" => Some(InstanceStatus::Running),
            "Completed" => Some(InstanceStatus::Completed),
            "Failed" => Some(InstanceStatus::Failed),
            "Terminated" => Some(InstanceStatus::Terminated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }
}

/// Instance projection maintained by the store alongside the history.
///
/// `output` is set for `Completed`; `error` holds the failure message for `Failed`
/// and the reason for `Terminated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub orchestration_name: String,
    pub status: InstanceStatus,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Result of an idempotent append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Event stored under this `event_id`.
    Appended(u64),
    /// An event with the same idempotency key already exists under this `event_id`.
    Duplicate(u64),
    /// The instance is terminal and no longer accepts new scheduling events.
    InstanceTerminal,
}

impl AppendOutcome {
    pub fn event_id(&self) -> Option<u64> {
        match self {
            AppendOutcome::Appended(id) | AppendOutcome::Duplicate(id) => Some(*id),
            AppendOutcome::InstanceTerminal => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DedupClass {
    Started,
    Scheduled,
    ActivityOutcome,
    Terminal,
}

impl DedupClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupClass::Started => "started",
            DedupClass::Scheduled => "scheduled",
            DedupClass::ActivityOutcome => "activity_outcome",
            DedupClass::Terminal => "terminal",
        }
    }
}

/// Per-instance idempotency key of an event.
///
/// | event | key |
/// |---|---|
/// | `OrchestrationStarted` | `(Started, 0)` |
/// | `ActivityScheduled { step }` | `(Scheduled, step)` |
/// | `ActivityCompleted/ActivityFailed { source_event_id }` | `(ActivityOutcome, source_event_id)` |
/// | `OrchestrationCompleted` | `(Terminal, 0)` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub class: DedupClass,
    pub slot: u64,
}

impl IdempotencyKey {
    pub fn of(kind: &EventKind) -> Self {
        let (class, slot) = match kind {
            EventKind::OrchestrationStarted { .. } => (DedupClass::Started, 0),
            EventKind::ActivityScheduled { step, .. } => (DedupClass::Scheduled, *step),
            EventKind::ActivityCompleted { source_event_id, .. } | EventKind::ActivityFailed { source_event_id, .. } => {
                (DedupClass::ActivityOutcome, *source_event_id)
            }
            EventKind::OrchestrationCompleted { .. } => (DedupClass::Terminal, 0),
        };
        Self { class, slot }
    }
}

/// Projection change caused by a terminal event: `(status, output, error)`.
pub(crate) fn terminal_projection(kind: &EventKind) -> Option<(InstanceStatus, Option<String>, Option<String>)> {
    match kind {
        EventKind::OrchestrationCompleted { outcome } => Some(match outcome {
            OrchestrationOutcome::Completed { output } => (InstanceStatus::Completed, Some(output.clone()), None),
            OrchestrationOutcome::Failed { details } => (InstanceStatus::Failed, None, Some(details.display_message())),
            OrchestrationOutcome::Terminated { reason } => (InstanceStatus::Terminated, None, Some(reason.clone())),
        }),
        _ => None,
    }
}

/// Source event an outcome refers to, if `kind` is an activity outcome.
pub(crate) fn outcome_source(kind: &EventKind) -> Option<u64> {
    match kind {
        EventKind::ActivityCompleted { source_event_id, .. } | EventKind::ActivityFailed { source_event_id, .. } => {
            Some(*source_event_id)
        }
        _ => None,
    }
}

/// Durable, append-only history per instance plus the instance projection.
///
/// Appends are atomic and idempotent: appending an event whose
/// [`IdempotencyKey`] is already present returns [`AppendOutcome::Duplicate`]
/// with the existing `event_id` and changes nothing. This is the only
/// synchronization point between the runtime's components.
///
/// Rules every implementation enforces:
/// - `OrchestrationStarted` creates the instance; any other event for a missing
///   instance is a permanent error.
/// - `ActivityScheduled` on a terminal instance returns `InstanceTerminal`.
/// - An activity outcome must reference an existing `ActivityScheduled`.
/// - `OrchestrationCompleted` updates the projection to the terminal status.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one event; the store assigns `event_id` and timestamp.
    async fn append(&self, instance: &str, kind: EventKind) -> Result<AppendOutcome, ProviderError>;

    /// Full history ordered by `event_id`; empty for unknown instances.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    async fn exists(&self, instance: &str) -> Result<bool, ProviderError> {
        Ok(self.get_instance(instance).await?.is_some())
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError>;

    /// Instance ids, optionally filtered by status.
    async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<String>, ProviderError>;

    /// Remove a terminal instance and its history. `Ok(false)` when the instance
    /// does not exist; a permanent error when it is still running.
    async fn delete_instance(&self, instance: &str) -> Result<bool, ProviderError>;
}
