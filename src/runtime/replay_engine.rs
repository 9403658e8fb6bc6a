use crate::runtime::OrchestrationHandler;
use crate::{Action, AppErrorKind, ConfigErrorKind, ErrorDetails, Event, OrchestrationContext};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tracing::{debug, warn};

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// Orchestration is suspended; `actions` lists newly issued activity calls
    Continue { actions: Vec<Action> },
    /// Orchestration completed with output
    Completed(String),
    /// Orchestration failed with error details
    Failed(ErrorDetails),
}

/// Replays an instance's history through its orchestration for one turn.
pub struct ReplayEngine {
    pub(crate) instance: String,
    pub(crate) history: Vec<Event>,
}

impl ReplayEngine {
    pub fn new(instance: impl Into<String>, history: Vec<Event>) -> Self {
        Self {
            instance: instance.into(),
            history,
        }
    }

    /// Evaluate the orchestration from the beginning against the recorded history.
    pub fn execute(&self, handler: Arc<dyn OrchestrationHandler>, input: String) -> TurnResult {
        debug!(
            target: "duraflow::runtime",
            instance_id = %self.instance,
            history_len = self.history.len(),
            "executing orchestration turn"
        );
        run_turn(&self.instance, &self.history, move |ctx| async move { handler.invoke(ctx, input).await })
    }
}

/// Run one deterministic turn of `orchestrator` against `history`.
///
/// The future is polled exactly once with a no-op waker. A pending future means
/// the orchestration is waiting on activities; the turn reports the calls it
/// issued that history does not record yet. Panics are caught and reported as
/// failures.
pub fn run_turn<F, Fut>(instance: &str, history: &[Event], orchestrator: F) -> TurnResult
where
    F: FnOnce(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(instance, history);

    let polled = catch_unwind(AssertUnwindSafe(|| {
        let fut = pin!(orchestrator(ctx.clone()));
        let mut cx = Context::from_waker(Waker::noop());
        fut.poll(&mut cx)
    }));

    if let Some(message) = ctx.take_nondeterminism() {
        return nondeterminism(instance, message);
    }

    match polled {
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "orchestration panicked".to_string()
            };
            TurnResult::Failed(ErrorDetails::Application {
                kind: AppErrorKind::Panicked,
                message,
            })
        }
        Ok(Poll::Pending) => TurnResult::Continue {
            actions: ctx.take_actions(),
        },
        Ok(Poll::Ready(result)) => {
            let unclaimed = ctx.unclaimed_steps();
            if unclaimed > 0 {
                return nondeterminism(
                    instance,
                    format!("orchestration finished with {unclaimed} recorded activity call(s) never reached"),
                );
            }
            let dropped = ctx.take_actions();
            if !dropped.is_empty() {
                warn!(
                    target: "duraflow::runtime",
                    instance_id = %instance,
                    dropped = dropped.len(),
                    "orchestration completed without awaiting scheduled activities; dropping them"
                );
            }
            match result {
                Ok(output) => TurnResult::Completed(output),
                Err(message) => TurnResult::Failed(ErrorDetails::Application {
                    kind: AppErrorKind::OrchestrationFailed,
                    message,
                }),
            }
        }
    }
}

fn nondeterminism(instance: &str, message: String) -> TurnResult {
    warn!(target: "duraflow::runtime", instance_id = %instance, %message, "nondeterminism detected");
    TurnResult::Failed(ErrorDetails::Configuration {
        kind: ConfigErrorKind::Nondeterminism,
        resource: instance.to_string(),
        message: Some(message),
    })
}

#[cfg(test)]
#[path = "replay_engine_tests.rs"]
mod replay_engine_tests;
