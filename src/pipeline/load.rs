use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::app::ports::{Sink, SinkRow};
use crate::constants;
use crate::error::{PipelineError, Result};
use crate::pipeline::retry::{backoff, RetryPolicy};
use crate::pipeline::{Stage, StageOutput};
use crate::types::{CanonicalRecord, Pollutant, StagedDataset};

/// Largest magnitude at which every integral f64 is exactly representable as i64
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// Terminal state of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadOutcome {
    /// 0-based position of the batch in the dataset
    pub batch_index: usize,
    pub rows_attempted: usize,
    /// Rows the sink reported on the last attempt; for a failed batch these
    /// are not counted as inserted.
    pub rows_inserted: usize,
    pub attempts: u32,
    pub terminal_error: Option<String>,
}

impl LoadOutcome {
    pub fn succeeded(&self) -> bool {
        self.terminal_error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub table: String,
    pub total: usize,
    /// Sum of rows in batches that terminally succeeded
    pub inserted: usize,
    pub batches: usize,
    pub succeeded_batches: usize,
    pub failed_batches: Vec<LoadOutcome>,
}

impl LoadReport {
    pub fn failed_rows(&self) -> usize {
        self.failed_batches.iter().map(|b| b.rows_attempted).sum()
    }
}

/// Writes a staged dataset to the sink in contiguous batches
pub struct BulkLoader {
    sink: Arc<dyn Sink>,
    table: String,
    batch_size: usize,
    retry: RetryPolicy,
    workers: usize,
}

impl BulkLoader {
    pub fn new(sink: Arc<dyn Sink>, table: impl Into<String>, batch_size: usize, retry: RetryPolicy, workers: usize) -> Self {
        Self {
            sink,
            table: table.into(),
            batch_size: batch_size.max(1),
            retry,
            workers: workers.max(1),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Current row count of the target table, `None` when the sink cannot say
    pub async fn count_rows(&self) -> Option<usize> {
        match self.sink.count(&self.table).await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(table = %self.table, error = %e, "could not count sink rows");
                None
            }
        }
    }

    /// Only a failed pre-flight is fatal; batch failures end up in the report.
    #[instrument(skip(self, dataset, cancel), fields(table = %self.table, rows = dataset.len()))]
    pub async fn load(&self, dataset: &StagedDataset, cancel: &CancellationToken) -> Result<LoadReport> {
        self.sink.ping().await.map_err(|e| {
            error!(error = %e, "sink pre-flight failed");
            PipelineError::SinkUnreachable(e)
        })?;

        let batches: Vec<(usize, &[CanonicalRecord])> = dataset.records.chunks(self.batch_size).enumerate().collect();
        let batch_count = batches.len();
        info!(batches = batch_count, batch_size = self.batch_size, workers = self.workers, "loading");

        let pending: Vec<_> = batches
            .into_iter()
            .map(|(index, records)| self.load_batch(index, batch_count, records, cancel))
            .collect();
        let mut outcomes: Vec<LoadOutcome> = stream::iter(pending)
            .buffer_unordered(self.workers)
            .collect()
            .await;
        outcomes.sort_by_key(|o| o.batch_index);

        let mut report = LoadReport {
            table: self.table.clone(),
            total: dataset.len(),
            batches: batch_count,
            ..LoadReport::default()
        };
        for outcome in outcomes {
            if outcome.succeeded() {
                report.inserted += outcome.rows_attempted;
                report.succeeded_batches += 1;
            } else {
                report.failed_batches.push(outcome);
            }
        }

        info!(
            inserted = report.inserted,
            failed_batches = report.failed_batches.len(),
            failed_rows = report.failed_rows(),
            "load finished"
        );
        Ok(report)
    }

    async fn load_batch(
        &self,
        index: usize,
        batch_count: usize,
        records: &[CanonicalRecord],
        cancel: &CancellationToken,
    ) -> LoadOutcome {
        let mut outcome = LoadOutcome {
            batch_index: index,
            rows_attempted: records.len(),
            rows_inserted: 0,
            attempts: 0,
            terminal_error: None,
        };
        let raw: Vec<SinkRow> = records.iter().map(to_sink_row).collect();
        let max_attempts = self.retry.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                last_error = if last_error.is_empty() {
                    "cancelled".to_string()
                } else {
                    format!("cancelled ({})", last_error)
                };
                break;
            }
            outcome.attempts = attempt;
            crate::metrics::load::attempt();

            let rows: Vec<SinkRow> = raw.iter().map(normalize_row).collect();
            match self.sink.insert(&self.table, &rows).await {
                Ok(result) if result.error.is_none() => {
                    outcome.rows_inserted = result.inserted;
                    crate::metrics::load::batch_inserted(rows.len());
                    info!(batch = index + 1, of = batch_count, rows = rows.len(), attempt, "batch inserted");
                    return outcome;
                }
                Ok(result) if result.inserted > 0 => {
                    // Some rows already landed; another attempt would write them twice.
                    outcome.rows_inserted = result.inserted;
                    let error = result.error.map(|e| e.to_string()).unwrap_or_default();
                    last_error = format!(
                        "partially inserted {} of {} rows, not retried: {}",
                        result.inserted,
                        rows.len(),
                        error
                    );
                    warn!(batch = index + 1, of = batch_count, attempt, inserted = result.inserted, rows = rows.len(), "partial insert, leaving batch for re-run");
                    break;
                }
                Ok(result) => {
                    outcome.rows_inserted = 0;
                    last_error = result.error.map(|e| e.to_string()).unwrap_or_default();
                }
                Err(e) => {
                    outcome.rows_inserted = 0;
                    last_error = e.to_string();
                }
            }
            warn!(batch = index + 1, of = batch_count, attempt, max_attempts, error = %last_error, "batch insert failed");

            if attempt < max_attempts && !backoff(&self.retry, attempt, cancel).await {
                last_error = format!("cancelled ({})", last_error);
                break;
            }
        }

        crate::metrics::load::batch_failed();
        error!(batch = index + 1, of = batch_count, attempts = outcome.attempts, error = %last_error, "batch failed");
        outcome.terminal_error = Some(last_error);
        outcome
    }
}

/// Canonical record to sink columns; risk level is stored as `risk_flag`
pub fn to_sink_row(record: &CanonicalRecord) -> SinkRow {
    let mut row = SinkRow::new();
    row.insert(constants::COL_CITY.into(), json!(record.city));
    row.insert(
        constants::COL_TIME.into(),
        record.time.map_or(Value::Null, |t| json!(t.to_rfc3339())),
    );
    for pollutant in Pollutant::ALL {
        row.insert(pollutant.column().into(), json!(record.measurements.get(pollutant)));
    }
    row.insert(constants::COL_UV_INDEX.into(), json!(record.uv_index));
    row.insert(constants::COL_AQI_CATEGORY.into(), json!(record.aqi_category.label()));
    row.insert(constants::COL_SEVERITY_SCORE.into(), json!(record.severity_score));
    row.insert(constants::COL_RISK_FLAG.into(), json!(record.risk_level.label()));
    row.insert(constants::COL_HOUR.into(), json!(record.hour));
    row
}

/// Lower-case keys, null for non-finite numbers, integers for integral floats.
/// Applying it twice gives the same row.
pub fn normalize_row(row: &SinkRow) -> SinkRow {
    row.iter()
        .map(|(key, value)| (key.to_lowercase(), normalize_value(value)))
        .collect()
}

fn normalize_value(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if !f.is_finite() => Value::Null,
            Some(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_INT => json!(f as i64),
            _ => value.clone(),
        },
        other => other.clone(),
    }
}

#[async_trait]
impl Stage for BulkLoader {
    type Input = Arc<StagedDataset>;
    type Output = LoadReport;

    fn name(&self) -> &'static str {
        "load"
    }

    async fn run(&self, input: &Arc<StagedDataset>, cancel: &CancellationToken) -> Result<StageOutput<LoadReport>> {
        let report = self.load(input, cancel).await?;
        let reasons = report
            .failed_batches
            .iter()
            .map(|b| {
                format!(
                    "batch {} ({} rows) failed after {} attempts: {}",
                    b.batch_index + 1,
                    b.rows_attempted,
                    b.attempts,
                    b.terminal_error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        Ok(StageOutput::degraded_if(report, reasons))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::InsertResult;
    use crate::error::SinkError;
    use crate::storage::InMemorySink;
    use crate::types::{AqiCategory, Measurements, RiskLevel};
    use chrono::{TimeZone, Utc};

    fn record(i: usize) -> CanonicalRecord {
        CanonicalRecord {
            city: format!("city-{}", i % 5),
            time: Some(Utc.with_ymd_and_hms(2024, 1, 1, (i % 24) as u32, 0, 0).unwrap()),
            measurements: Measurements {
                pm10: Some(40.0),
                pm2_5: Some(12.5),
                ..Measurements::default()
            },
            uv_index: None,
            aqi_category: AqiCategory::Good,
            severity_score: Some(182.5),
            risk_level: RiskLevel::Low,
            hour: Some((i % 24) as u32),
        }
    }

    fn dataset(n: usize) -> StagedDataset {
        StagedDataset {
            records: (0..n).map(record).collect(),
            ..StagedDataset::default()
        }
    }

    /// Cancels the run as soon as the first insert starts, then lets it finish
    struct CancellingSink {
        inner: Arc<InMemorySink>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl Sink for CancellingSink {
        async fn ping(&self) -> std::result::Result<(), SinkError> {
            self.inner.ping().await
        }

        async fn insert(&self, table: &str, rows: &[SinkRow]) -> std::result::Result<InsertResult, SinkError> {
            self.cancel.cancel();
            self.inner.insert(table, rows).await
        }

        async fn count(&self, table: &str) -> std::result::Result<usize, SinkError> {
            self.inner.count(table).await
        }
    }

    fn loader(sink: Arc<InMemorySink>, batch_size: usize, max_retries: u32) -> BulkLoader {
        BulkLoader::new(sink, "air_quality_data", batch_size, RetryPolicy::new(max_retries, 0), 4)
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_abort_load() {
        let sink = Arc::new(InMemorySink::new().rejecting(|rows| rows.len() == 50));
        let report = loader(sink.clone(), 200, 2)
            .load(&dataset(450), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.inserted, 400);
        assert_eq!(report.succeeded_batches, 2);
        assert_eq!(report.failed_batches.len(), 1);
        let failed = &report.failed_batches[0];
        assert_eq!(failed.batch_index, 2);
        assert_eq!(failed.rows_attempted, 50);
        assert_eq!(failed.attempts, 3);
        assert_eq!(sink.insert_calls(), 5);
        assert_eq!(sink.rows("air_quality_data").len(), 400);
    }

    #[tokio::test]
    async fn test_report_partitions_rows() {
        for (n, batch_size) in [(0, 10), (1, 10), (10, 10), (11, 10), (97, 7)] {
            let sink = Arc::new(InMemorySink::new().rejecting(|rows| rows.len() % 2 == 1));
            let report = loader(sink, batch_size, 0)
                .load(&dataset(n), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(report.inserted + report.failed_rows(), n);
            assert_eq!(report.succeeded_batches + report.failed_batches.len(), report.batches);
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let sink = Arc::new(InMemorySink::new().failing_first(2));
        let report = loader(sink.clone(), 100, 2)
            .load(&dataset(100), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.inserted, 100);
        assert!(report.failed_batches.is_empty());
        assert_eq!(sink.insert_calls(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_sink_is_fatal() {
        let sink = Arc::new(InMemorySink::unreachable());
        let err = loader(sink.clone(), 100, 2)
            .load(&dataset(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SinkUnreachable(_)));
        assert_eq!(sink.insert_calls(), 0);
    }

    #[tokio::test]
    async fn test_partial_insert_is_not_retried() {
        let sink = Arc::new(InMemorySink::new().partially_inserting(|rows| rows.len() == 5));
        let report = loader(sink.clone(), 10, 2)
            .load(&dataset(25), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.inserted, 20);
        assert_eq!(report.failed_batches.len(), 1);
        let failed = &report.failed_batches[0];
        assert_eq!(failed.batch_index, 2);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.rows_inserted, 2);
        assert!(failed.terminal_error.as_deref().unwrap().contains("partially inserted 2 of 5"));
        assert_eq!(sink.insert_calls(), 3);
        assert_eq!(sink.rows("air_quality_data").len(), 22);
    }

    #[tokio::test]
    async fn test_cancel_mid_load_finishes_in_flight_batch() {
        let sink = Arc::new(InMemorySink::new());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let loader = BulkLoader::new(
            Arc::new(CancellingSink {
                inner: sink.clone(),
                cancel: trigger,
            }),
            "air_quality_data",
            10,
            RetryPolicy::new(2, 0),
            1,
        );

        let report = loader.load(&dataset(30), &cancel).await.unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(report.inserted, 10);
        assert_eq!(report.succeeded_batches, 1);
        assert_eq!(report.failed_batches.len(), 2);
        for batch in &report.failed_batches {
            assert_eq!(batch.attempts, 0);
            assert_eq!(batch.terminal_error.as_deref(), Some("cancelled"));
        }
        assert_eq!(report.inserted + report.failed_rows(), 30);
        assert_eq!(sink.rows("air_quality_data").len(), 10);
    }

    #[tokio::test]
    async fn test_cancelled_load_records_every_batch() {
        let sink = Arc::new(InMemorySink::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = loader(sink.clone(), 10, 2).load(&dataset(25), &cancel).await.unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.failed_batches.len(), 3);
        assert!(report.failed_batches.iter().all(|b| b.attempts == 0));
        assert_eq!(sink.insert_calls(), 0);
    }

    #[test]
    fn test_sink_row_shape() {
        let row = normalize_row(&to_sink_row(&record(3)));
        let mut keys: Vec<&str> = row.keys().map(String::as_str).collect();
        keys.sort_unstable();
        let mut expected = constants::SINK_COLUMNS.to_vec();
        expected.sort_unstable();
        assert_eq!(keys, expected);
        assert_eq!(row["pm10"], json!(40));
        assert_eq!(row["pm2_5"], json!(12.5));
        assert_eq!(row["risk_flag"], json!("Low Risk"));
        assert_eq!(row["carbon_monoxide"], Value::Null);
        assert_eq!(row["time"], json!("2024-01-01T03:00:00+00:00"));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let mut raw = SinkRow::new();
        raw.insert("PM10".into(), json!(3.0));
        raw.insert("Ozone".into(), json!(2.25));
        raw.insert("hour".into(), json!(5));
        raw.insert("city".into(), json!("Delhi"));
        raw.insert("uv_index".into(), Value::Null);

        let once = normalize_row(&raw);
        assert_eq!(once["pm10"], json!(3));
        assert!(once["pm10"].is_i64());
        assert_eq!(once["ozone"], json!(2.25));
        assert_eq!(normalize_row(&once), once);
    }
}
