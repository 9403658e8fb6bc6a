//! Durable, replay-driven orchestration engine.
//!
//! An orchestration is ordinary async Rust that schedules *activities* through an
//! [`OrchestrationContext`]. Every decision is recorded as an append-only [`Event`]
//! in a [`providers::HistoryStore`]; whenever new history arrives the runtime
//! re-executes the orchestration from the beginning, answering already-recorded
//! activity calls from history instead of repeating their side effects.
//!
//! - Data model: [`Event`], [`EventKind`], [`Action`], [`ActivityError`], [`ErrorDetails`]
//! - Orchestration surface: [`OrchestrationContext`], [`DurableFuture`]
//! - Activity surface: [`ActivityContext`]
//! - Host: [`Runtime`], [`Client`], [`TriggerAdapter`]
//!
//! ```rust,no_run
//! use duraflow::providers::in_memory::InMemoryHistoryStore;
//! use duraflow::{ActivityRegistry, Client, OrchestrationContext, OrchestrationRegistry, Runtime};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryHistoryStore::default());
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx, name: String| async move { Ok(format!("Hello, {name}!")) })
//!     .build()?;
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("HelloWorld", |ctx: OrchestrationContext, name: String| async move {
//!         let greeting = ctx.schedule_activity("Greet", name).await?;
//!         Ok(greeting)
//!     })
//!     .build()?;
//!
//! let rt = Runtime::start_with_store(store, activities, orchestrations).await;
//! let client = rt.client();
//! let instance = client.start_orchestration("HelloWorld", "Rust").await?;
//! let status = client
//!     .wait_for_orchestration(&instance, std::time::Duration::from_secs(5))
//!     .await?;
//! println!("{status:?}");
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod client;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod trigger;

pub use client::{Client, ClientError, StartOutcome};
pub use futures::DurableFuture;
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry, RegistryError};
pub use runtime::retry::{BackoffStrategy, RetryPolicy};
pub use runtime::{OrchestrationStatus, Runtime, RuntimeOptions};
pub use trigger::TriggerAdapter;

/// Names starting with this prefix are reserved for built-in activities.
pub(crate) const SYSTEM_ACTIVITY_PREFIX: &str = "__system";
pub(crate) const SYSTEM_NOW_ACTIVITY: &str = "__system_now";
pub(crate) const SYSTEM_NEW_GUID_ACTIVITY: &str = "__system_new_guid";

/// Milliseconds since the unix epoch, saturating to zero on a skewed clock.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// Internal codec utilities for typed payloads
pub(crate) mod codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    /// Encode a value as its JSON text.
    pub fn encode<T: Serialize + ?Sized>(v: &T) -> Result<String, String> {
        serde_json::to_string(v).map_err(|e| e.to_string())
    }

    /// Decode JSON text. A payload that is not JSON for `T` is retried as a bare
    /// string, so untyped callers can pass plain text to typed handlers.
    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        match serde_json::from_str::<T>(s) {
            Ok(v) => Ok(v),
            Err(_) => serde_json::from_value(Value::String(s.to_string())).map_err(|e| e.to_string()),
        }
    }

}

/// One entry of an instance's append-only history.
///
/// `event_id` is the per-instance sequence number assigned by the store when the
/// event is appended; it starts at 1 and is strictly increasing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub event_id: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

/// What happened to an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EventKind {
    /// Instance was created for the named orchestration with its input.
    OrchestrationStarted { name: String, input: String },
    /// The orchestration issued its `step`-th activity call.
    ActivityScheduled { step: u64, name: String, input: String },
    /// The activity scheduled by `source_event_id` returned a result.
    ActivityCompleted { source_event_id: u64, result: String },
    /// The activity scheduled by `source_event_id` failed after its retries.
    ActivityFailed { source_event_id: u64, error: ActivityError },
    /// The instance reached a terminal state.
    OrchestrationCompleted { outcome: OrchestrationOutcome },
}

impl EventKind {
    /// Stable type name, used as the persisted event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::OrchestrationStarted { .. } => "OrchestrationStarted",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::OrchestrationCompleted { .. } => "OrchestrationCompleted",
        }
    }
}

/// Terminal result recorded by `OrchestrationCompleted`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status")]
pub enum OrchestrationOutcome {
    Completed { output: String },
    Failed { details: ErrorDetails },
    Terminated { reason: String },
}

/// Why an orchestration failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "category")]
pub enum ErrorDetails {
    /// The orchestration code returned an error or panicked.
    Application { kind: AppErrorKind, message: String },
    /// The runtime could not execute the orchestration as registered.
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppErrorKind {
    OrchestrationFailed,
    Panicked,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigErrorKind {
    UnregisteredOrchestration,
    Nondeterminism,
}

impl ErrorDetails {
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { kind, message } => match kind {
                AppErrorKind::OrchestrationFailed => message.clone(),
                AppErrorKind::Panicked => format!("orchestration panicked: {message}"),
            },
            ErrorDetails::Configuration {
                kind,
                resource,
                message,
            } => {
                let base = match kind {
                    ConfigErrorKind::UnregisteredOrchestration => format!("unregistered orchestration: {resource}"),
                    ConfigErrorKind::Nondeterminism => "nondeterministic orchestration".to_string(),
                };
                match message {
                    Some(m) => format!("{base}: {m}"),
                    None => base,
                }
            }
        }
    }
}

/// Failure of an activity as seen by orchestration code.
///
/// Converts into `String` so orchestrations returning `Result<String, String>` can
/// propagate it with `?`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("activity '{name}' failed: {message}")]
pub struct ActivityError {
    pub name: String,
    pub kind: ActivityErrorKind,
    pub message: String,
    /// Invocation attempts made by the dispatcher (0 when never invoked).
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActivityErrorKind {
    /// The activity implementation returned an error or panicked.
    Application,
    /// No handler is registered under the activity name.
    Unregistered,
    /// An attempt exceeded the retry policy's timeout.
    TimedOut,
    /// A typed payload could not be encoded or decoded.
    Codec,
}

impl ActivityError {
    pub(crate) fn unregistered(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ActivityErrorKind::Unregistered,
            message: format!("unregistered activity: {name}"),
            attempts: 0,
        }
    }

    pub(crate) fn codec(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            kind: ActivityErrorKind::Codec,
            message: message.into(),
            attempts: 0,
        }
    }
}

impl From<ActivityError> for String {
    fn from(e: ActivityError) -> Self {
        e.to_string()
    }
}

/// Decisions produced by a replay turn that the runtime must materialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Append `ActivityScheduled` for `step` and dispatch the activity.
    CallActivity { step: u64, name: String, input: String },
}

#[derive(Debug, Clone)]
struct RecordedStep {
    event_id: u64,
    name: String,
    input: String,
}

#[derive(Debug)]
struct CtxInner {
    instance_id: String,
    // step -> scheduling event recorded in history
    recorded: BTreeMap<u64, RecordedStep>,
    // scheduling event_id -> outcome
    outcomes: HashMap<u64, Result<String, ActivityError>>,
    // replay cursor
    next_step: u64,
    // history already holds the terminal outcome
    finished: bool,
    actions: Vec<Action>,
    nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(instance_id: String, history: &[Event]) -> Self {
        let mut recorded = BTreeMap::new();
        let mut outcomes = HashMap::new();
        let mut finished = false;
        for event in history {
            match &event.kind {
                EventKind::ActivityScheduled { step, name, input } => {
                    recorded.insert(
                        *step,
                        RecordedStep {
                            event_id: event.event_id,
                            name: name.clone(),
                            input: input.clone(),
                        },
                    );
                }
                EventKind::ActivityCompleted {
                    source_event_id,
                    result,
                } => {
                    outcomes.entry(*source_event_id).or_insert_with(|| Ok(result.clone()));
                }
                EventKind::ActivityFailed { source_event_id, error } => {
                    outcomes.entry(*source_event_id).or_insert_with(|| Err(error.clone()));
                }
                EventKind::OrchestrationCompleted { .. } => finished = true,
                EventKind::OrchestrationStarted { .. } => {}
            }
        }
        Self {
            instance_id,
            recorded,
            outcomes,
            next_step: 0,
            finished,
            actions: Vec::new(),
            nondeterminism: None,
        }
    }

    fn claim_step(&mut self, name: &str, input: &str) -> u64 {
        let step = self.next_step;
        self.next_step += 1;
        match self.recorded.get(&step) {
            Some(recorded) => {
                if (recorded.name != name || recorded.input != input) && self.nondeterminism.is_none() {
                    self.nondeterminism = Some(format!(
                        "step {step}: history has ActivityScheduled('{}','{}') but code scheduled ('{name}','{input}')",
                        recorded.name, recorded.input
                    ));
                }
            }
            None => self.actions.push(Action::CallActivity {
                step,
                name: name.to_string(),
                input: input.to_string(),
            }),
        }
        step
    }

    fn outcome_for_step(&self, step: u64) -> Option<Result<String, ActivityError>> {
        let recorded = self.recorded.get(&step)?;
        self.outcomes.get(&recorded.event_id).cloned()
    }
}

/// Handle given to orchestration code for scheduling activities deterministically.
///
/// The context is rebuilt from history on every turn. Each `schedule_activity`
/// call claims the next step; steps already recorded in history resolve from
/// history, new steps become [`Action`]s for the runtime.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Build a context positioned at the first step of `history`.
    pub fn new(instance_id: impl Into<String>, history: &[Event]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance_id.into(), history))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    /// True while the code is re-executing steps that history already records,
    /// or when history already holds the terminal outcome.
    ///
    /// Code after the last recorded step counts as new. If appending the terminal
    /// outcome fails, the next pass re-runs that code and replay-safe logs emitted
    /// there repeat.
    pub fn is_replaying(&self) -> bool {
        let inner = self.lock();
        inner.finished || inner.recorded.range(inner.next_step..).next().is_some()
    }

    /// Schedule an activity by name. The returned future resolves with the
    /// activity's result or its [`ActivityError`].
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name = name.into();
        let input = input.into();
        let step = self.lock().claim_step(&name, &input);
        DurableFuture::new(step, name, self.clone())
    }

    /// Schedule an activity with a serde-encoded input and decode its result.
    pub fn schedule_activity_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> impl Future<Output = Result<Out, ActivityError>> + Send + 'static
    where
        In: Serialize + ?Sized,
        Out: DeserializeOwned + Send + 'static,
    {
        let name = name.into();
        let scheduled = codec::encode(input).map(|payload| self.schedule_activity(name.clone(), payload));
        async move {
            let raw = match scheduled {
                Ok(fut) => fut.await?,
                Err(message) => return Err(ActivityError::codec(&name, message)),
            };
            codec::decode::<Out>(&raw).map_err(|message| ActivityError::codec(&name, message))
        }
    }

    /// Await several activities; results come back in the order of `futures`,
    /// regardless of the order their completions were recorded.
    pub fn join(&self, futures: Vec<DurableFuture>) -> ::futures::future::JoinAll<DurableFuture> {
        ::futures::future::join_all(futures)
    }

    /// Wall-clock time captured by a built-in activity, replay stable.
    pub async fn utc_now(&self) -> Result<SystemTime, ActivityError> {
        let raw = self.schedule_activity(SYSTEM_NOW_ACTIVITY, "").await?;
        let millis = raw
            .parse::<u64>()
            .map_err(|e| ActivityError::codec(SYSTEM_NOW_ACTIVITY, e.to_string()))?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }

    /// A fresh GUID generated by a built-in activity, replay stable.
    pub async fn new_guid(&self) -> Result<String, ActivityError> {
        self.schedule_activity(SYSTEM_NEW_GUID_ACTIVITY, "").await
    }

    pub(crate) fn outcome_for_step(&self, step: u64) -> Option<Result<String, ActivityError>> {
        self.lock().outcome_for_step(step)
    }

    pub(crate) fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }

    pub(crate) fn take_nondeterminism(&self) -> Option<String> {
        self.lock().nondeterminism.take()
    }

    /// Recorded steps the code has not reached.
    pub(crate) fn unclaimed_steps(&self) -> usize {
        let inner = self.lock();
        inner.recorded.range(inner.next_step..).count()
    }
}

/// Information handed to an activity implementation.
///
/// Activities run at least once; `instance_id` together with `event_id` is stable
/// across re-executions and makes a good idempotency key for external side effects.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    activity_name: String,
    event_id: u64,
    attempt: u32,
}

impl ActivityContext {
    pub(crate) fn new(instance_id: String, activity_name: String, event_id: u64, attempt: u32) -> Self {
        Self {
            instance_id,
            activity_name,
            event_id,
            attempt,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// Event id of the `ActivityScheduled` event this invocation serves.
    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    /// 1-based attempt number within the dispatcher's retry policy.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        tracing::info!(
            target: "duraflow::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            event_id = self.event_id,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        tracing::warn!(
            target: "duraflow::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            event_id = self.event_id,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        tracing::error!(
            target: "duraflow::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            event_id = self.event_id,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }
}
