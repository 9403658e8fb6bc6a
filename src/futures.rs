use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{ActivityError, OrchestrationContext};

/// Future returned by [`OrchestrationContext::schedule_activity`].
///
/// Resolves only when history holds an outcome for its step. The engine polls
/// orchestrations exactly once per turn, so a pending `DurableFuture` suspends the
/// turn until the outcome is appended and the instance is replayed.
pub struct DurableFuture {
    step: u64,
    name: String,
    ctx: OrchestrationContext,
}

impl DurableFuture {
    pub(crate) fn new(step: u64, name: String, ctx: OrchestrationContext) -> Self {
        Self { step, name, ctx }
    }

    /// Deterministic ordinal of the activity call within the orchestration.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn activity_name(&self) -> &str {
        &self.name
    }
}

impl Future for DurableFuture {
    type Output = Result<String, ActivityError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.ctx.outcome_for_step(self.step) {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for DurableFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableFuture")
            .field("step", &self.step)
            .field("name", &self.name)
            .finish()
    }
}
