use async_trait::async_trait;

use crate::error::{SinkError, SourceError, StoreError};
use crate::types::Entity;

/// A row as the sink receives it: lower-case column names to JSON values
pub type SinkRow = serde_json::Map<String, serde_json::Value>;

// Extract-side ports
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn name(&self) -> &str;

    /// One request/response round trip. Non-2xx responses are returned as
    /// responses; only transport failures are errors.
    async fn call(&self, entity: &Entity) -> Result<SourceResponse, SourceError>;

    /// Whether a 2xx payload carries no usable data
    fn is_empty_payload(&self, _payload: &serde_json::Value) -> bool {
        false
    }
}

#[derive(Clone, Debug)]
pub struct SourceResponse {
    pub status: u16,
    pub payload: serde_json::Value,
}

impl SourceResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Filesystem-like append-only key/value store for raw snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

// Load-side ports
#[async_trait]
pub trait Sink: Send + Sync {
    /// Pre-flight connectivity check
    async fn ping(&self) -> Result<(), SinkError>;

    /// `Err` means the call itself failed; `Ok` with `error` set means the
    /// sink answered with a structured error (possibly after a partial insert).
    async fn insert(&self, table: &str, rows: &[SinkRow]) -> Result<InsertResult, SinkError>;

    async fn count(&self, table: &str) -> Result<usize, SinkError>;
}

#[derive(Clone, Debug, Default)]
pub struct InsertResult {
    pub inserted: usize,
    pub error: Option<SinkError>,
}

impl InsertResult {
    pub fn ok(inserted: usize) -> Self {
        Self { inserted, error: None }
    }

    pub fn failed(inserted: usize, error: SinkError) -> Self {
        Self {
            inserted,
            error: Some(error),
        }
    }
}
