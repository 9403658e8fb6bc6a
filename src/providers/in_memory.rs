use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{
    AppendOutcome, HistoryStore, IdempotencyKey, InstanceInfo, InstanceStatus, ProviderError, outcome_source,
    terminal_projection,
};
use crate::{Event, EventKind};

struct InstanceState {
    info: InstanceInfo,
    events: Vec<Event>,
    keys: HashMap<IdempotencyKey, u64>,
}

/// Process-local store. History is lost when the process exits.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, InstanceState>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, instance: &str, kind: EventKind) -> Result<AppendOutcome, ProviderError> {
        let mut g = self.inner.lock().await;
        let now = crate::now_millis();

        if !g.contains_key(instance) {
            let EventKind::OrchestrationStarted { name, input } = &kind else {
                return Err(ProviderError::permanent(
                    "append",
                    format!("instance not found: {instance}"),
                ));
            };
            let info = InstanceInfo {
                instance_id: instance.to_string(),
                orchestration_name: name.clone(),
                status: InstanceStatus::Running,
                input: input.clone(),
                output: None,
                error: None,
                created_at_ms: now,
                updated_at_ms: now,
            };
            let mut keys = HashMap::new();
            keys.insert(IdempotencyKey::of(&kind), 1);
            g.insert(
                instance.to_string(),
                InstanceState {
                    info,
                    events: vec![Event {
                        event_id: 1,
                        timestamp_ms: now,
                        kind,
                    }],
                    keys,
                },
            );
            return Ok(AppendOutcome::Appended(1));
        }

        let state = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("append", format!("instance not found: {instance}")))?;

        let key = IdempotencyKey::of(&kind);
        if let Some(existing) = state.keys.get(&key) {
            return Ok(AppendOutcome::Duplicate(*existing));
        }
        if state.info.status.is_terminal() && matches!(kind, EventKind::ActivityScheduled { .. }) {
            return Ok(AppendOutcome::InstanceTerminal);
        }
        if let Some(source) = outcome_source(&kind) {
            let scheduled = state
                .events
                .iter()
                .any(|e| e.event_id == source && matches!(e.kind, EventKind::ActivityScheduled { .. }));
            if !scheduled {
                return Err(ProviderError::permanent(
                    "append",
                    format!("outcome references unknown ActivityScheduled {source} on {instance}"),
                ));
            }
        }

        let event_id = state.events.last().map(|e| e.event_id + 1).unwrap_or(1);
        if let Some((status, output, error)) = terminal_projection(&kind) {
            state.info.status = status;
            state.info.output = output;
            state.info.error = error;
        }
        state.info.updated_at_ms = now;
        state.keys.insert(key, event_id);
        state.events.push(Event {
            event_id,
            timestamp_ms: now,
            kind,
        });
        Ok(AppendOutcome::Appended(event_id))
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let g = self.inner.lock().await;
        Ok(g.get(instance).map(|s| s.events.clone()).unwrap_or_default())
    }

    async fn exists(&self, instance: &str) -> Result<bool, ProviderError> {
        Ok(self.inner.lock().await.contains_key(instance))
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        Ok(self.inner.lock().await.get(instance).map(|s| s.info.clone()))
    }

    async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<String>, ProviderError> {
        let g = self.inner.lock().await;
        let mut ids: Vec<String> = g
            .values()
            .filter(|s| status.is_none_or(|wanted| s.info.status == wanted))
            .map(|s| s.info.instance_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete_instance(&self, instance: &str) -> Result<bool, ProviderError> {
        let mut g = self.inner.lock().await;
        match g.get(instance) {
            None => Ok(false),
            Some(s) if !s.info.status.is_terminal() => Err(ProviderError::permanent(
                "delete_instance",
                format!("instance is still running: {instance}"),
            )),
            Some(_) => {
                g.remove(instance);
                Ok(true)
            }
        }
    }
}
