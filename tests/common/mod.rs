// Not every test file uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use duraflow::providers::sqlite::SqliteHistoryStore;
use duraflow::providers::{AppendOutcome, HistoryStore, InstanceInfo, InstanceStatus, ProviderError};
use duraflow::{Event, EventKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn event_types(hist: &[Event]) -> Vec<&'static str> {
    hist.iter().map(|e| e.kind.type_name()).collect()
}

pub fn count_scheduled(hist: &[Event], activity: &str) -> usize {
    hist.iter()
        .filter(|e| matches!(&e.kind, EventKind::ActivityScheduled { name, .. } if name == activity))
        .count()
}

pub async fn create_sqlite_store_disk() -> (Arc<SqliteHistoryStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("history.db");
    let store = Arc::new(SqliteHistoryStore::open(&db_path).await.unwrap());
    (store, td)
}

/// Store wrapper that fails the next `n` calls with a retryable error.
pub struct FlakyStore {
    inner: Arc<dyn HistoryStore>,
    failures_left: AtomicU32,
    injected: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn HistoryStore>) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(0),
            injected: AtomicU32::new(0),
        }
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self, operation: &str) -> Result<(), ProviderError> {
        let took = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(ProviderError::retryable(operation, "injected: database is locked"));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FlakyStore {
    async fn append(&self, instance: &str, kind: EventKind) -> Result<AppendOutcome, ProviderError> {
        self.maybe_fail("append")?;
        self.inner.append(instance, kind).await
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.maybe_fail("read")?;
        self.inner.read(instance).await
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        self.maybe_fail("get_instance")?;
        self.inner.get_instance(instance).await
    }

    async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<String>, ProviderError> {
        self.maybe_fail("list_instances")?;
        self.inner.list_instances(status).await
    }

    async fn delete_instance(&self, instance: &str) -> Result<bool, ProviderError> {
        self.maybe_fail("delete_instance")?;
        self.inner.delete_instance(instance).await
    }
}
