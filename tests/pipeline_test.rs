use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use airq_etl::app::ports::{Sink, SnapshotStore, SourceClient, SourceResponse};
use airq_etl::config::{Config, SinkConfig};
use airq_etl::constants;
use airq_etl::error::SourceError;
use airq_etl::infra::snapshot_store::{load_snapshots, FsSnapshotStore};
use airq_etl::infra::sqlite_sink::SqliteSink;
use airq_etl::pipeline::orchestrator::{Orchestrator, RunState};
use airq_etl::pipeline::retry::RetryPolicy;
use airq_etl::pipeline::transform::Transformer;
use airq_etl::pipeline::validate::{CheckStatus, CHECK_SINK_ROW_COUNT};
use airq_etl::types::{Entity, SourceKind};

/// Source whose behaviour is chosen per entity; counts calls per entity
struct Upstream {
    name: &'static str,
    payloads: HashMap<&'static str, serde_json::Value>,
    calls: Mutex<HashMap<String, u32>>,
}

impl Upstream {
    fn new(name: &'static str, payloads: Vec<(&'static str, serde_json::Value)>) -> Self {
        Self {
            name,
            payloads: payloads.into_iter().collect(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn calls(&self, key: &str) -> u32 {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SourceClient for Upstream {
    fn name(&self) -> &str {
        self.name
    }

    async fn call(&self, entity: &Entity) -> Result<SourceResponse, SourceError> {
        *self.calls.lock().unwrap().entry(entity.key.clone()).or_default() += 1;
        match self.payloads.get(entity.key.as_str()) {
            Some(payload) => Ok(SourceResponse {
                status: 200,
                payload: payload.clone(),
            }),
            None => Ok(SourceResponse {
                status: 503,
                payload: serde_json::Value::Null,
            }),
        }
    }
}

fn openaq_payload() -> serde_json::Value {
    json!({"results": [{"measurements": [
        {"parameter": "pm25", "value": 42.0, "lastUpdated": "2024-05-01T09:00:00Z"},
        {"parameter": "pm10", "value": 88.0, "lastUpdated": "2024-05-01T09:00:00Z"},
        {"parameter": "no2", "value": 21.5, "lastUpdated": "2024-05-01T10:00:00Z"}
    ]}]})
}

fn open_meteo_payload() -> serde_json::Value {
    json!({"hourly": {
        "time": ["2024-05-01T00:00", "2024-05-01T01:00", "2024-05-01T02:00"],
        "pm10": [60.0, 65.5, null],
        "pm2_5": [31.0, null, null],
        "ozone": [12.0, 14.0, null],
        "uv_index": [0.0, 0.0, 0.1]
    }})
}

fn config(snapshot_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.entities = vec![
        Entity::new("Delhi", 28.7041, 77.1025),
        Entity::new("Bengaluru", 12.9716, 77.5946),
        Entity::new("Kolkata", 22.5726, 88.3639),
    ];
    config.extract.retry = RetryPolicy::new(2, 0);
    config.load.retry = RetryPolicy::new(1, 0);
    config.load.batch_size = 2;
    config.snapshots.dir = snapshot_dir.to_path_buf();
    config.sink = SinkConfig::Memory;
    config
}

#[tokio::test]
async fn test_full_run_with_fallback_and_failed_entity() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = config(&temp_dir.path().join("data"));

    // Delhi: primary keeps failing, fallback answers.
    // Bengaluru: primary answers first time.
    // Kolkata: nothing answers.
    let primary = Arc::new(Upstream::new("openaq", vec![("Bengaluru", openaq_payload())]));
    let fallback = Arc::new(Upstream::new("open-meteo", vec![("Delhi", open_meteo_payload())]));
    let store: Arc<dyn SnapshotStore> = Arc::new(FsSnapshotStore::new(config.snapshots.dir.clone()));
    let sink = Arc::new(SqliteSink::open(&temp_dir.path().join("airq.sqlite"))?);

    let orchestrator = Orchestrator::new(&config, primary.clone(), fallback.clone(), store.clone(), sink.clone());
    let report = orchestrator.run(&CancellationToken::new()).await;

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.snapshots.len(), 2);
    assert_eq!(report.extraction_failures.len(), 1);
    assert_eq!(report.extraction_failures[0].entity_key, "Kolkata");
    assert!(report.degradations.iter().any(|d| d.stage == "extract"));

    assert_eq!(primary.calls("Delhi"), 2);
    assert_eq!(fallback.calls("Delhi"), 1);
    assert_eq!(primary.calls("Bengaluru"), 1);
    assert_eq!(fallback.calls("Bengaluru"), 0);
    assert_eq!(fallback.calls("Kolkata"), 1);

    let sources: Vec<SourceKind> = report.provenance.iter().map(|p| p.source).collect();
    assert!(sources.contains(&SourceKind::Primary));
    assert!(sources.contains(&SourceKind::Fallback));

    // Bengaluru pivots to 2 rows, Delhi keeps 2 of 3 hours.
    assert_eq!(report.staged_rows, 4);
    let load = report.load.as_ref().unwrap();
    assert_eq!(load.inserted, 4);
    assert!(load.failed_batches.is_empty());
    assert_eq!(sink.count(constants::DEFAULT_TABLE).await?, 4);

    let validation = report.validation.as_ref().unwrap();
    assert_eq!(validation.checks[CHECK_SINK_ROW_COUNT].status, CheckStatus::Pass);

    Ok(())
}

#[tokio::test]
async fn test_stored_snapshots_rebuild_the_same_dataset() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = config(&temp_dir.path().join("data"));
    let primary = Arc::new(Upstream::new(
        "openaq",
        vec![("Bengaluru", openaq_payload()), ("Delhi", openaq_payload())],
    ));
    let fallback = Arc::new(Upstream::new("open-meteo", vec![("Kolkata", open_meteo_payload())]));
    let store = Arc::new(FsSnapshotStore::new(config.snapshots.dir.clone()));
    let sink = Arc::new(airq_etl::storage::InMemorySink::new());

    let orchestrator = Orchestrator::new(&config, primary, fallback, store.clone(), sink);
    let extraction = orchestrator.extract_only(&CancellationToken::new()).await?;
    assert_eq!(extraction.snapshots.len(), 3);

    let stored = load_snapshots(&*store, constants::RAW_PREFIX).await?;
    assert_eq!(stored.len(), 3);

    let transformer = Transformer::new(&config.features);
    let from_memory = transformer.transform(extraction.snapshots.values());
    let from_disk = transformer.transform(&stored);
    assert_eq!(serde_json::to_vec(&from_memory)?, serde_json::to_vec(&from_disk)?);
    Ok(())
}

#[tokio::test]
async fn test_sink_rejecting_batches_degrades_validation() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = config(&temp_dir.path().join("data"));
    let primary = Arc::new(Upstream::new(
        "openaq",
        vec![("Bengaluru", openaq_payload()), ("Delhi", openaq_payload()), ("Kolkata", openaq_payload())],
    ));
    let fallback = Arc::new(Upstream::new("open-meteo", vec![]));
    let store = Arc::new(FsSnapshotStore::new(config.snapshots.dir.clone()));
    let sink = Arc::new(
        airq_etl::storage::InMemorySink::new().rejecting(|rows| rows.iter().any(|r| r["city"] == "Kolkata")),
    );

    let report = Orchestrator::new(&config, primary, fallback, store, sink.clone())
        .run(&CancellationToken::new())
        .await;

    assert_eq!(report.state, RunState::Done);
    let load = report.load.as_ref().unwrap();
    assert_eq!(load.total, 6);
    assert_eq!(load.inserted, 4);
    assert_eq!(load.failed_batches.len(), 1);
    assert_eq!(load.failed_batches[0].rows_attempted, 2);
    assert_eq!(load.failed_batches[0].attempts, 2);

    let validation = report.validation.as_ref().unwrap();
    assert!(!validation.passed());
    assert_eq!(validation.checks[CHECK_SINK_ROW_COUNT].status, CheckStatus::Fail);
    Ok(())
}
