use crate::{Event, EventKind, OrchestrationOutcome};
use std::collections::HashSet;

/// Activity scheduled in history with no recorded outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingActivity {
    pub event_id: u64,
    pub name: String,
    pub input: String,
}

/// Metadata derived from an instance's history in a single scan.
#[derive(Debug, Clone, Default)]
pub struct HistoryView {
    /// Orchestration name (from OrchestrationStarted)
    pub orchestration_name: Option<String>,
    /// Original input (from OrchestrationStarted)
    pub orchestration_input: Option<String>,
    /// Terminal outcome, if the instance has finished
    pub outcome: Option<OrchestrationOutcome>,
    pending: Vec<PendingActivity>,
}

impl HistoryView {
    pub fn from_history(history: &[Event]) -> Self {
        let mut view = Self::default();
        let resolved: HashSet<u64> = history
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ActivityCompleted { source_event_id, .. }
                | EventKind::ActivityFailed { source_event_id, .. } => Some(*source_event_id),
                _ => None,
            })
            .collect();

        for event in history {
            match &event.kind {
                EventKind::OrchestrationStarted { name, input } => {
                    view.orchestration_name = Some(name.clone());
                    view.orchestration_input = Some(input.clone());
                }
                EventKind::ActivityScheduled { name, input, .. } if !resolved.contains(&event.event_id) => {
                    view.pending.push(PendingActivity {
                        event_id: event.event_id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                }
                EventKind::OrchestrationCompleted { outcome } => {
                    view.outcome = Some(outcome.clone());
                }
                _ => {}
            }
        }
        view
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Scheduled activities still waiting for an outcome, in scheduling order.
    pub fn pending_activities(&self) -> &[PendingActivity] {
        &self.pending
    }
}
