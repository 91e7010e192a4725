//! Schema unification and feature derivation.
//!
//! `detect -> flatten -> unify -> clean -> derive`, in that order. The output
//! depends only on the snapshots passed in.

pub mod features;
pub mod flatten;

use async_trait::async_trait;
use chrono::Timelike;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::constants;
use crate::error::{PipelineError, Result};
use crate::pipeline::{Stage, StageOutput};
use crate::types::{
    CanonicalRecord, Measurements, Pollutant, RawSnapshot, SchemaVariant, SnapshotRef, StagedDataset,
    TransformStats,
};
use features::FeatureConfig;
use flatten::{coerce_hour, coerce_number, flatten_open_meteo, flatten_openaq, parse_time, FlatRow};

pub struct Transformer {
    features: FeatureConfig,
}

/// A unified and cleaned row, before derivation
struct CleanRow {
    city: String,
    time: Option<chrono::DateTime<chrono::Utc>>,
    measurements: Measurements,
    uv_index: Option<f64>,
    explicit_hour: Option<u32>,
}

impl Transformer {
    pub fn new(features: &FeatureConfig) -> Self {
        Self {
            features: features.clone(),
        }
    }

    #[instrument(skip_all)]
    pub fn transform<'a, I>(&self, snapshots: I) -> StagedDataset
    where
        I: IntoIterator<Item = &'a RawSnapshot>,
    {
        let mut stats = TransformStats::default();
        let mut provenance = Vec::new();
        let mut flat: Vec<FlatRow> = Vec::new();

        for snapshot in snapshots {
            let rows = match snapshot.schema_variant {
                SchemaVariant::OpenAqLatest => flatten_openaq(&snapshot.entity_key, &snapshot.payload),
                SchemaVariant::OpenMeteoHourly => flatten_open_meteo(&snapshot.entity_key, &snapshot.payload),
                SchemaVariant::Unknown => {
                    warn!(entity = %snapshot.entity_key, key = %snapshot.store_key(), "unrecognized payload schema, skipping");
                    crate::metrics::transform::snapshot_skipped();
                    stats.skipped_snapshots.push(snapshot.store_key());
                    continue;
                }
            };
            debug!(entity = %snapshot.entity_key, variant = ?snapshot.schema_variant, rows = rows.len(), "flattened");
            provenance.push(SnapshotRef {
                key: snapshot.store_key(),
                entity_key: snapshot.entity_key.clone(),
                source: snapshot.source,
                schema_variant: snapshot.schema_variant,
                sha256: snapshot.sha256.clone(),
                rows: rows.len(),
            });
            flat.extend(rows);
        }
        stats.flattened_rows = flat.len();

        let cleaned: Vec<CleanRow> = flat.iter().map(unify).collect();
        let before = cleaned.len();
        let cleaned: Vec<CleanRow> = cleaned
            .into_iter()
            .filter(|row| !row.measurements.all_missing())
            .collect();
        stats.dropped_empty_rows = before - cleaned.len();

        let records = self.derive(cleaned);

        crate::metrics::transform::rows_staged(records.len());
        crate::metrics::transform::rows_dropped(stats.dropped_empty_rows);
        info!(
            snapshots = provenance.len(),
            skipped = stats.skipped_snapshots.len(),
            flattened = stats.flattened_rows,
            dropped = stats.dropped_empty_rows,
            staged = records.len(),
            "transform finished"
        );

        StagedDataset {
            records,
            provenance,
            stats,
        }
    }

    fn derive(&self, rows: Vec<CleanRow>) -> Vec<CanonicalRecord> {
        let aqi = self.features.aqi_ladder();
        let risk = self.features.risk_ladder();
        // An explicit hour column is used as-is as soon as any row carries one;
        // hours come from timestamps only when the whole column is empty.
        let explicit_hours = rows.iter().any(|r| r.explicit_hour.is_some());

        rows.into_iter()
            .map(|row| {
                let severity_score = self.features.severity_score(&row.measurements);
                let hour = if explicit_hours {
                    row.explicit_hour
                } else {
                    row.time.map(|t| t.hour())
                };
                CanonicalRecord {
                    aqi_category: aqi.classify(row.measurements.pm2_5),
                    risk_level: risk.classify(severity_score),
                    city: row.city,
                    time: row.time,
                    measurements: row.measurements,
                    uv_index: row.uv_index,
                    severity_score,
                    hour,
                }
            })
            .collect()
    }
}

/// Map a flattened row onto the canonical columns; absent columns are missing
fn unify(row: &FlatRow) -> CleanRow {
    let mut measurements = Measurements::default();
    for pollutant in Pollutant::ALL {
        measurements.set(pollutant, row.cells.get(pollutant.column()).and_then(coerce_number));
    }
    CleanRow {
        city: row.city.clone(),
        time: row.time.as_deref().and_then(parse_time),
        measurements,
        uv_index: row.cells.get(constants::COL_UV_INDEX).and_then(coerce_number),
        explicit_hour: row.cells.get(constants::COL_HOUR).and_then(coerce_hour),
    }
}

#[async_trait]
impl Stage for Transformer {
    type Input = Vec<RawSnapshot>;
    type Output = Arc<StagedDataset>;

    fn name(&self) -> &'static str {
        "transform"
    }

    async fn run(
        &self,
        input: &Vec<RawSnapshot>,
        _cancel: &CancellationToken,
    ) -> Result<StageOutput<Arc<StagedDataset>>> {
        let dataset = self.transform(input);
        if dataset.is_empty() {
            return Err(PipelineError::EmptyDataset);
        }
        let reasons = dataset
            .stats
            .skipped_snapshots
            .iter()
            .map(|key| format!("unrecognized schema in {}", key))
            .collect();
        Ok(StageOutput::degraded_if(Arc::new(dataset), reasons))
    }
}
