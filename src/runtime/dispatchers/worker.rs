//! Worker (activity) dispatcher implementation for Runtime
//!
//! - Spawns `worker_concurrency` workers sharing one bounded request channel
//! - Executes activities under their retry policy
//! - Appends the outcome, then signals the owning instance

use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::super::retry::{RetryPolicy, retry_store};
use super::super::{ActivityHandler, FnActivity, Runtime, lock};
use crate::providers::AppendOutcome;
use crate::{
    ActivityContext, ActivityError, ActivityErrorKind, EventKind, SYSTEM_NEW_GUID_ACTIVITY, SYSTEM_NOW_ACTIVITY,
};

/// Request to execute the activity scheduled by `event_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRequest {
    pub instance_id: String,
    pub event_id: u64,
    pub name: String,
    pub input: String,
}

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers for executing activities
    pub(in crate::runtime) fn start_work_dispatcher(
        self: Arc<Self>,
        requests: mpsc::Receiver<ActivityRequest>,
    ) -> Vec<JoinHandle<()>> {
        let requests = Arc::new(Mutex::new(requests));
        (0..self.options.worker_concurrency.max(1))
            .map(|worker_idx| {
                let rt = self.clone();
                let requests = requests.clone();
                // Unique worker ID: work-{index}-{runtime_id}
                let worker_id = format!("work-{}-{}", worker_idx, rt.runtime_id);
                tokio::spawn(async move {
                    loop {
                        if rt.shutdown_flag.load(Ordering::Relaxed) {
                            break;
                        }
                        let next = requests.lock().await.recv().await;
                        let Some(request) = next else {
                            break;
                        };
                        rt.execute_activity(&worker_id, request).await;
                    }
                    debug!(target: "duraflow::runtime", worker_id = %worker_id, "Worker exiting");
                })
            })
            .collect()
    }

    /// Queue an activity for execution unless it is already in flight in this
    /// process. Waits while the request channel is full.
    pub(in crate::runtime) async fn dispatch_activity(&self, request: ActivityRequest) {
        let key = (request.instance_id.clone(), request.event_id);
        if !lock(&self.in_flight).insert(key.clone()) {
            debug!(
                target: "duraflow::runtime",
                instance_id = %request.instance_id,
                event_id = request.event_id,
                "Activity already in flight"
            );
            return;
        }
        if let Err(e) = self.work_tx.send(request).await {
            lock(&self.in_flight).remove(&key);
            warn!(
                target: "duraflow::runtime",
                instance_id = %e.0.instance_id,
                event_id = e.0.event_id,
                "Activity dispatch channel closed"
            );
        }
    }

    /// Event ids of this instance's activities currently queued or executing.
    pub(in crate::runtime) fn in_flight_for(&self, instance: &str) -> HashSet<u64> {
        lock(&self.in_flight)
            .iter()
            .filter(|(i, _)| i == instance)
            .map(|(_, event_id)| *event_id)
            .collect()
    }

    async fn execute_activity(&self, worker_id: &str, request: ActivityRequest) {
        let outcome = self.run_with_retry(worker_id, &request).await;
        let kind = match outcome {
            Ok(result) => EventKind::ActivityCompleted {
                source_event_id: request.event_id,
                result,
            },
            Err(error) => EventKind::ActivityFailed {
                source_event_id: request.event_id,
                error,
            },
        };

        let appended = retry_store(
            &self.options.store_retry,
            "append_activity_outcome",
            Some(&self.metrics),
            || self.history_store.append(&request.instance_id, kind.clone()),
        )
        .await;
        match appended {
            Ok(AppendOutcome::Appended(event_id)) => debug!(
                target: "duraflow::runtime",
                instance_id = %request.instance_id,
                source_event_id = request.event_id,
                event_id,
                worker_id = %worker_id,
                "Activity outcome recorded"
            ),
            Ok(AppendOutcome::Duplicate(event_id)) => debug!(
                target: "duraflow::runtime",
                instance_id = %request.instance_id,
                source_event_id = request.event_id,
                event_id,
                worker_id = %worker_id,
                "Activity outcome already recorded"
            ),
            Ok(AppendOutcome::InstanceTerminal) => {}
            Err(e) => error!(
                target: "duraflow::runtime",
                instance_id = %request.instance_id,
                source_event_id = request.event_id,
                worker_id = %worker_id,
                error = %e,
                "Failed to record activity outcome; recovery will re-dispatch it"
            ),
        }

        lock(&self.in_flight).remove(&(request.instance_id.clone(), request.event_id));
        self.signal(request.instance_id);
    }

    fn resolve_activity(&self, name: &str) -> Option<(Arc<dyn ActivityHandler>, Option<RetryPolicy>)> {
        match name {
            SYSTEM_NOW_ACTIVITY => {
                let handler: Arc<dyn ActivityHandler> =
                    Arc::new(FnActivity(|_ctx: ActivityContext, _input: String| async move {
                        Ok::<_, String>(crate::now_millis().to_string())
                    }));
                Some((handler, Some(RetryPolicy::no_retry())))
            }
            SYSTEM_NEW_GUID_ACTIVITY => {
                let handler: Arc<dyn ActivityHandler> =
                    Arc::new(FnActivity(|_ctx: ActivityContext, _input: String| async move {
                        Ok::<_, String>(uuid::Uuid::new_v4().to_string())
                    }));
                Some((handler, Some(RetryPolicy::no_retry())))
            }
            _ => self
                .activity_registry
                .get(name)
                .map(|entry| (entry.handler.clone(), entry.retry.clone())),
        }
    }

    async fn run_with_retry(&self, worker_id: &str, request: &ActivityRequest) -> Result<String, ActivityError> {
        let Some((handler, retry)) = self.resolve_activity(&request.name) else {
            error!(
                target: "duraflow::runtime",
                instance_id = %request.instance_id,
                activity_name = %request.name,
                event_id = request.event_id,
                worker_id = %worker_id,
                outcome = "system_error",
                error_type = "unregistered",
                "Activity failed (unregistered)"
            );
            self.metrics.record_activity_failure();
            return Err(ActivityError::unregistered(&request.name));
        };
        let policy = retry.as_ref().unwrap_or(&self.options.activity_retry);

        let mut attempt = 1u32;
        loop {
            let ctx = ActivityContext::new(
                request.instance_id.clone(),
                request.name.clone(),
                request.event_id,
                attempt,
            );
            debug!(
                target: "duraflow::runtime",
                instance_id = %request.instance_id,
                activity_name = %request.name,
                event_id = request.event_id,
                attempt,
                worker_id = %worker_id,
                "Activity started"
            );
            let start_time = Instant::now();
            let invocation = AssertUnwindSafe(handler.invoke(ctx, request.input.clone())).catch_unwind();
            let result = match policy.timeout {
                Some(limit) => match tokio::time::timeout(limit, invocation).await {
                    Ok(r) => flatten_invocation(r),
                    Err(_) => Err((ActivityErrorKind::TimedOut, format!("attempt timed out after {limit:?}"))),
                },
                None => flatten_invocation(invocation.await),
            };
            let duration_ms = start_time.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    debug!(
                        target: "duraflow::runtime",
                        instance_id = %request.instance_id,
                        activity_name = %request.name,
                        event_id = request.event_id,
                        attempt,
                        worker_id = %worker_id,
                        outcome = "success",
                        duration_ms,
                        result_size = output.len(),
                        "Activity completed"
                    );
                    self.metrics.record_activity_success();
                    return Ok(output);
                }
                Err((kind, message)) if attempt < policy.max_attempts => {
                    let backoff = policy.delay_for_attempt(attempt);
                    warn!(
                        target: "duraflow::runtime",
                        instance_id = %request.instance_id,
                        activity_name = %request.name,
                        event_id = request.event_id,
                        attempt,
                        worker_id = %worker_id,
                        ?kind,
                        duration_ms,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %message,
                        "Activity attempt failed, retrying"
                    );
                    self.metrics.record_activity_retry();
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err((kind, message)) => {
                    warn!(
                        target: "duraflow::runtime",
                        instance_id = %request.instance_id,
                        activity_name = %request.name,
                        event_id = request.event_id,
                        attempt,
                        worker_id = %worker_id,
                        outcome = "app_error",
                        ?kind,
                        duration_ms,
                        error = %message,
                        "Activity failed"
                    );
                    self.metrics.record_activity_failure();
                    return Err(ActivityError {
                        name: request.name.clone(),
                        kind,
                        message,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

type InvocationResult = Result<Result<String, String>, Box<dyn std::any::Any + Send>>;

fn flatten_invocation(r: InvocationResult) -> Result<String, (ActivityErrorKind, String)> {
    match r {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(message)) => Err((ActivityErrorKind::Application, message)),
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                format!("activity panicked: {s}")
            } else if let Some(s) = payload.downcast_ref::<String>() {
                format!("activity panicked: {s}")
            } else {
                "activity panicked".to_string()
            };
            Err((ActivityErrorKind::Application, message))
        }
    }
}
