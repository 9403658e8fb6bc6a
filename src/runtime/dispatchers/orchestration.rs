//! Orchestration dispatcher implementation for Runtime
//!
//! Instances are driven by signals (new instance, new activity outcome) and by a
//! periodic recovery sweep. Each signal schedules a replay pass through the
//! instance gate, which keeps at most one pass per instance in flight and
//! coalesces signals that arrive while a pass is running.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::super::replay_engine::{ReplayEngine, TurnResult};
use super::super::retry::retry_store;
use super::super::state::HistoryView;
use super::super::{Runtime, lock};
use super::worker::ActivityRequest;
use crate::providers::{AppendOutcome, InstanceStatus, ProviderError};
use crate::{Action, ConfigErrorKind, ErrorDetails, EventKind, OrchestrationOutcome};

impl Runtime {
    /// Wake the dispatcher for `instance`.
    pub(crate) fn signal(&self, instance: String) {
        if self.signal_tx.send(instance).is_err() {
            debug!(target: "duraflow::runtime", "Signal channel closed");
        }
    }

    pub(in crate::runtime) fn start_orchestration_dispatcher(
        self: Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(instance) = signals.recv().await {
                if self.shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }
                self.schedule_replay(instance);
            }
        })
    }

    /// Periodically re-signal every running instance. The first sweep runs
    /// immediately and resumes instances left running by a previous process.
    pub(in crate::runtime) fn start_recovery_sweep(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.options.recovery_interval.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                if self.shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }
                let running = retry_store(&self.options.store_retry, "list_instances", Some(&self.metrics), || {
                    self.history_store.list_instances(Some(InstanceStatus::Running))
                })
                .await;
                match running {
                    Ok(instances) => {
                        for instance in instances {
                            self.schedule_replay(instance);
                        }
                    }
                    Err(e) => warn!(target: "duraflow::runtime", error = %e, "Recovery sweep failed"),
                }
            }
        })
    }

    /// Run replay passes for `instance` until no signal arrived during the last
    /// one. A signal for an instance with a pass in flight only marks it dirty.
    fn schedule_replay(self: &Arc<Self>, instance: String) {
        {
            let mut gate = lock(&self.instance_gate);
            if let Some(dirty) = gate.get_mut(&instance) {
                *dirty = true;
                return;
            }
            gate.insert(instance.clone(), false);
        }

        let rt = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = rt.orchestration_permits.clone().acquire_owned().await else {
                lock(&rt.instance_gate).remove(&instance);
                return;
            };
            loop {
                if !rt.shutdown_flag.load(Ordering::Relaxed) {
                    rt.run_replay_pass(&instance).await;
                }
                if !rt.finish_pass(&instance) {
                    break;
                }
            }
        });
    }

    /// Returns true when another pass is needed.
    fn finish_pass(&self, instance: &str) -> bool {
        let mut gate = lock(&self.instance_gate);
        match gate.get_mut(instance) {
            Some(dirty) if *dirty && !self.shutdown_flag.load(Ordering::Relaxed) => {
                *dirty = false;
                true
            }
            _ => {
                gate.remove(instance);
                false
            }
        }
    }

    async fn append_event(&self, instance: &str, kind: EventKind) -> Result<AppendOutcome, ProviderError> {
        retry_store(&self.options.store_retry, "append", Some(&self.metrics), || {
            self.history_store.append(instance, kind.clone())
        })
        .await
    }

    /// One replay pass: read history, recover orphaned activities, run a turn and
    /// materialize its result.
    async fn run_replay_pass(&self, instance: &str) {
        // taken before the read: an activity finishing in between is then either
        // still in this set or already visible in history
        let in_flight = self.in_flight_for(instance);

        let history = match retry_store(&self.options.store_retry, "read", Some(&self.metrics), || {
            self.history_store.read(instance)
        })
        .await
        {
            Ok(h) => h,
            Err(e) => {
                warn!(target: "duraflow::runtime", instance_id = %instance, error = %e, "Failed to read history");
                return;
            }
        };

        let view = HistoryView::from_history(&history);
        if view.is_terminal() {
            debug!(target: "duraflow::runtime", instance_id = %instance, "Instance is terminal, nothing to do");
            return;
        }
        let (Some(name), Some(input)) = (view.orchestration_name.clone(), view.orchestration_input.clone()) else {
            debug!(target: "duraflow::runtime", instance_id = %instance, "No OrchestrationStarted in history");
            return;
        };

        for pending in view.pending_activities() {
            if in_flight.contains(&pending.event_id) {
                continue;
            }
            info!(
                target: "duraflow::runtime",
                instance_id = %instance,
                event_id = pending.event_id,
                activity_name = %pending.name,
                "Re-dispatching activity without a recorded outcome"
            );
            self.dispatch_activity(ActivityRequest {
                instance_id: instance.to_string(),
                event_id: pending.event_id,
                name: pending.name.clone(),
                input: pending.input.clone(),
            })
            .await;
        }

        let Some(handler) = self.orchestration_registry.get(&name) else {
            warn!(
                target: "duraflow::runtime",
                instance_id = %instance,
                orchestration_name = %name,
                "Orchestration is not registered"
            );
            self.complete_instance(
                instance,
                OrchestrationOutcome::Failed {
                    details: ErrorDetails::Configuration {
                        kind: ConfigErrorKind::UnregisteredOrchestration,
                        resource: name,
                        message: None,
                    },
                },
            )
            .await;
            return;
        };

        self.metrics.record_turn();
        let turn = ReplayEngine::new(instance, history).execute(handler, input);
        match turn {
            TurnResult::Continue { actions } => {
                for action in actions {
                    let Action::CallActivity { step, name, input } = action;
                    let scheduled = EventKind::ActivityScheduled {
                        step,
                        name: name.clone(),
                        input: input.clone(),
                    };
                    let event_id = match self.append_event(instance, scheduled).await {
                        Ok(AppendOutcome::Appended(id)) | Ok(AppendOutcome::Duplicate(id)) => id,
                        Ok(AppendOutcome::InstanceTerminal) => {
                            debug!(
                                target: "duraflow::runtime",
                                instance_id = %instance,
                                step,
                                "Instance became terminal, dropping remaining activity calls"
                            );
                            return;
                        }
                        Err(e) => {
                            warn!(
                                target: "duraflow::runtime",
                                instance_id = %instance,
                                step,
                                error = %e,
                                "Failed to record ActivityScheduled; recovery will retry the turn"
                            );
                            return;
                        }
                    };
                    debug!(
                        target: "duraflow::runtime",
                        instance_id = %instance,
                        step,
                        event_id,
                        activity_name = %name,
                        "Activity scheduled"
                    );
                    self.dispatch_activity(ActivityRequest {
                        instance_id: instance.to_string(),
                        event_id,
                        name,
                        input,
                    })
                    .await;
                }
            }
            TurnResult::Completed(output) => {
                self.complete_instance(instance, OrchestrationOutcome::Completed { output })
                    .await;
            }
            TurnResult::Failed(details) => {
                self.complete_instance(instance, OrchestrationOutcome::Failed { details })
                    .await;
            }
        }
    }

    async fn complete_instance(&self, instance: &str, outcome: OrchestrationOutcome) {
        let failed = matches!(outcome, OrchestrationOutcome::Failed { .. });
        match self
            .append_event(instance, EventKind::OrchestrationCompleted { outcome })
            .await
        {
            Ok(AppendOutcome::Appended(event_id)) => {
                if failed {
                    self.metrics.record_orchestration_failure();
                    warn!(target: "duraflow::runtime", instance_id = %instance, event_id, "Orchestration failed");
                } else {
                    self.metrics.record_orchestration_completion();
                    info!(target: "duraflow::runtime", instance_id = %instance, event_id, "Orchestration completed");
                }
            }
            Ok(_) => {
                debug!(target: "duraflow::runtime", instance_id = %instance, "Instance already terminal");
            }
            Err(e) => {
                warn!(
                    target: "duraflow::runtime",
                    instance_id = %instance,
                    error = %e,
                    "Failed to record terminal outcome; recovery will retry"
                );
            }
        }
    }
}
