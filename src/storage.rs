use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::app::ports::{InsertResult, Sink, SinkRow, SnapshotStore};
use crate::error::{SinkError, StoreError};

type RejectFn = Box<dyn Fn(&[SinkRow]) -> bool + Send + Sync>;

/// In-memory sink for development, dry runs and testing
pub struct InMemorySink {
    tables: Arc<Mutex<HashMap<String, Vec<SinkRow>>>>,
    reachable: bool,
    reject: Option<RejectFn>,
    partial: Option<RejectFn>,
    transient_failures: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySink {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(HashMap::new())),
            reachable: true,
            reject: None,
            partial: None,
            transient_failures: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails, including the pre-flight ping
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::new()
        }
    }

    /// Reject (with a structured error) every batch matching `pred`
    pub fn rejecting<F>(mut self, pred: F) -> Self
    where
        F: Fn(&[SinkRow]) -> bool + Send + Sync + 'static,
    {
        self.reject = Some(Box::new(pred));
        self
    }

    /// Store only the first half of every batch matching `pred`, then report
    /// a structured error alongside the partial count
    pub fn partially_inserting<F>(mut self, pred: F) -> Self
    where
        F: Fn(&[SinkRow]) -> bool + Send + Sync + 'static,
    {
        self.partial = Some(Box::new(pred));
        self
    }

    /// Fail the first `n` insert calls with a transient error
    pub fn failing_first(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn rows(&self, table: &str) -> Vec<SinkRow> {
        let tables = self.tables.lock().unwrap();
        tables.get(table).cloned().unwrap_or_default()
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn ping(&self) -> Result<(), SinkError> {
        if self.reachable {
            Ok(())
        } else {
            Err(SinkError::Unreachable("in-memory sink configured as unreachable".into()))
        }
    }

    async fn insert(&self, table: &str, rows: &[SinkRow]) -> Result<InsertResult, SinkError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.ping().await?;

        let transient = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(SinkError::Io("simulated transient failure".into()));
        }
        if let Some(reject) = &self.reject {
            if reject(rows) {
                return Ok(InsertResult::failed(0, SinkError::Rejected("simulated rejection".into())));
            }
        }

        if let Some(partial) = &self.partial {
            if partial(rows) {
                let kept = rows.len() / 2;
                let mut tables = self.tables.lock().unwrap();
                tables.entry(table.to_string()).or_default().extend(rows[..kept].iter().cloned());
                return Ok(InsertResult::failed(kept, SinkError::Rejected("simulated partial insert".into())));
            }
        }

        let mut tables = self.tables.lock().unwrap();
        tables.entry(table.to_string()).or_default().extend(rows.iter().cloned());
        debug!(table, rows = rows.len(), "in-memory insert");
        Ok(InsertResult::ok(rows.len()))
    }

    async fn count(&self, table: &str) -> Result<usize, SinkError> {
        self.ping().await?;
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(table).map_or(0, |rows| rows.len()))
    }
}

/// In-memory snapshot store; keys are kept ordered
#[derive(Default)]
pub struct InMemorySnapshotStore {
    entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    fail_writes: bool,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write fails with an I/O error
    pub fn read_only() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "snapshot store is read-only",
            )));
        }
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(city: &str) -> SinkRow {
        json!({ "city": city }).as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_sink_counts_inserted_rows() {
        let sink = InMemorySink::new();
        let result = sink.insert("t", &[row("a"), row("b")]).await.unwrap();
        assert_eq!(result.inserted, 2);
        assert!(result.error.is_none());
        assert_eq!(sink.count("t").await.unwrap(), 2);
        assert_eq!(sink.count("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sink_transient_failures_run_out() {
        let sink = InMemorySink::new().failing_first(1);
        assert!(sink.insert("t", &[row("a")]).await.is_err());
        assert!(sink.insert("t", &[row("a")]).await.is_ok());
        assert_eq!(sink.insert_calls(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_store_lists_by_prefix() {
        let store = InMemorySnapshotStore::new();
        store.write("raw/b.json", b"{}").await.unwrap();
        store.write("raw/a.json", b"{}").await.unwrap();
        store.write("staged/x.json", b"{}").await.unwrap();
        assert_eq!(store.list("raw/").await.unwrap(), vec!["raw/a.json", "raw/b.json"]);
    }

    #[tokio::test]
    async fn test_snapshot_store_never_overwrites() {
        let store = InMemorySnapshotStore::new();
        store.write("raw/a.json", b"first").await.unwrap();
        let err = store.write("raw/a.json", b"second").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.read("raw/a.json").await.unwrap(), b"first");
    }
}
