use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::app::ports::{SnapshotStore, SourceClient};
use crate::error::{PipelineError, Result, SourceError};
use crate::infra::snapshot_store::persist_snapshot;
use crate::pipeline::retry::{backoff, RetryPolicy};
use crate::pipeline::{Stage, StageOutput};
use crate::types::{Entity, RawSnapshot, SourceKind};

/// Why an entity produced no snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFailure {
    pub entity_key: String,
    pub primary_attempts: u32,
    pub primary_error: String,
    /// `None` when the fallback was never tried (e.g. cancellation)
    pub fallback_error: Option<String>,
}

impl fmt::Display for EntityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: primary ({} attempts): {}",
            self.entity_key, self.primary_attempts, self.primary_error
        )?;
        if let Some(fallback) = &self.fallback_error {
            write!(f, "; fallback: {}", fallback)?;
        }
        Ok(())
    }
}

/// One outcome per requested entity: a snapshot or a recorded failure
#[derive(Debug, Default)]
pub struct Extraction {
    pub snapshots: BTreeMap<String, RawSnapshot>,
    pub failures: Vec<EntityFailure>,
}

impl Extraction {
    pub fn outcome_count(&self) -> usize {
        self.snapshots.len() + self.failures.len()
    }
}

enum EntityOutcome {
    Snapshot(RawSnapshot),
    Failure(EntityFailure),
}

/// Result of hitting the primary source until it yields data or gives up
enum PrimaryResult {
    Data(serde_json::Value),
    Exhausted { attempts: u32, error: String },
    Cancelled { attempts: u32, error: String },
}

/// Pulls one raw snapshot per entity: primary source with retries, then a
/// single fallback attempt.
pub struct Extractor {
    primary: Arc<dyn SourceClient>,
    fallback: Arc<dyn SourceClient>,
    store: Arc<dyn SnapshotStore>,
    retry: RetryPolicy,
    workers: usize,
}

impl Extractor {
    pub fn new(
        primary: Arc<dyn SourceClient>,
        fallback: Arc<dyn SourceClient>,
        store: Arc<dyn SnapshotStore>,
        retry: RetryPolicy,
        workers: usize,
    ) -> Self {
        Self {
            primary,
            fallback,
            store,
            retry,
            workers: workers.max(1),
        }
    }

    /// Extract every entity. Fails only when no entity could be extracted.
    pub async fn extract(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<Extraction> {
        let mut seen = HashSet::new();
        let unique: Vec<&Entity> = entities
            .iter()
            .filter(|e| {
                let fresh = seen.insert(e.key.clone());
                if !fresh {
                    warn!(entity = %e.key, "duplicate entity ignored");
                }
                fresh
            })
            .collect();
        if unique.is_empty() {
            return Err(PipelineError::NoEntities);
        }

        info!(entities = unique.len(), workers = self.workers, "extracting");
        let pending: Vec<_> = unique.iter().map(|entity| self.extract_entity(entity, cancel)).collect();
        let outcomes: Vec<EntityOutcome> = stream::iter(pending)
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut extraction = Extraction::default();
        for outcome in outcomes {
            match outcome {
                EntityOutcome::Snapshot(snapshot) => {
                    extraction.snapshots.insert(snapshot.entity_key.clone(), snapshot);
                }
                EntityOutcome::Failure(failure) => {
                    crate::metrics::extract::entity_failed();
                    extraction.failures.push(failure);
                }
            }
        }
        extraction.failures.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));

        info!(
            snapshots = extraction.snapshots.len(),
            failures = extraction.failures.len(),
            "extraction finished"
        );
        if extraction.snapshots.is_empty() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled("extract"));
            }
            return Err(PipelineError::AllEntitiesFailed(unique.len()));
        }
        Ok(extraction)
    }

    #[instrument(skip(self, entity, cancel), fields(entity = %entity.key))]
    async fn extract_entity(&self, entity: &Entity, cancel: &CancellationToken) -> EntityOutcome {
        let (attempts, primary_error) = match self.try_primary(entity, cancel).await {
            PrimaryResult::Data(payload) => {
                return self.persist(entity, SourceKind::Primary, payload, 0).await;
            }
            PrimaryResult::Cancelled { attempts, error } => {
                return EntityOutcome::Failure(EntityFailure {
                    entity_key: entity.key.clone(),
                    primary_attempts: attempts,
                    primary_error: error,
                    fallback_error: None,
                });
            }
            PrimaryResult::Exhausted { attempts, error } => (attempts, error),
        };

        if cancel.is_cancelled() {
            return EntityOutcome::Failure(EntityFailure {
                entity_key: entity.key.clone(),
                primary_attempts: attempts,
                primary_error,
                fallback_error: None,
            });
        }

        warn!(error = %primary_error, "primary source gave up, trying fallback");
        crate::metrics::extract::fallback_used();
        crate::metrics::extract::attempt(self.fallback.name());

        let fallback_error = match self.fallback.call(entity).await {
            Ok(resp) if resp.is_success() => {
                if self.fallback.is_empty_payload(&resp.payload) {
                    "empty result".to_string()
                } else {
                    info!("fallback source succeeded");
                    return self.persist(entity, SourceKind::Fallback, resp.payload, attempts).await;
                }
            }
            Ok(resp) => SourceError::Status {
                source_name: self.fallback.name().to_string(),
                status: resp.status,
            }
            .to_string(),
            Err(e) => e.to_string(),
        };

        warn!(primary = %primary_error, fallback = %fallback_error, "both sources failed");
        EntityOutcome::Failure(EntityFailure {
            entity_key: entity.key.clone(),
            primary_attempts: attempts,
            primary_error,
            fallback_error: Some(fallback_error),
        })
    }

    async fn try_primary(&self, entity: &Entity, cancel: &CancellationToken) -> PrimaryResult {
        let max_attempts = self.retry.max_retries.max(1);
        let mut last_error = String::from("not attempted");
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return PrimaryResult::Cancelled {
                    attempts,
                    error: format!("cancelled before attempt {} ({})", attempt, last_error),
                };
            }
            attempts = attempt;
            crate::metrics::extract::attempt(self.primary.name());
            info!(attempt, max_attempts, source = self.primary.name(), "calling primary source");

            let error = match self.primary.call(entity).await {
                Ok(resp) if resp.is_success() => {
                    if self.primary.is_empty_payload(&resp.payload) {
                        // No data is not an error, and retrying will not change it.
                        return PrimaryResult::Exhausted {
                            attempts,
                            error: "empty result".to_string(),
                        };
                    }
                    return PrimaryResult::Data(resp.payload);
                }
                Ok(resp) => SourceError::Status {
                    source_name: self.primary.name().to_string(),
                    status: resp.status,
                },
                Err(e) => e,
            };

            warn!(attempt, error = %error, "primary attempt failed");
            last_error = error.to_string();
            if !error.is_transient() {
                break;
            }
            if attempt < max_attempts && !backoff(&self.retry, attempt, cancel).await {
                return PrimaryResult::Cancelled {
                    attempts,
                    error: format!("cancelled during backoff ({})", last_error),
                };
            }
        }

        PrimaryResult::Exhausted {
            attempts,
            error: last_error,
        }
    }

    async fn persist(
        &self,
        entity: &Entity,
        source: SourceKind,
        payload: serde_json::Value,
        primary_attempts: u32,
    ) -> EntityOutcome {
        let snapshot = RawSnapshot::new(entity.key.clone(), source, Utc::now(), payload);
        match persist_snapshot(self.store.as_ref(), &snapshot).await {
            Ok(key) => {
                crate::metrics::extract::snapshot_persisted(snapshot.payload.to_string().len());
                info!(key = %key, source = %source, variant = ?snapshot.schema_variant, "snapshot persisted");
                EntityOutcome::Snapshot(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "snapshot could not be persisted");
                let error = format!("fetched from {} source but not persisted: {}", source, e);
                EntityOutcome::Failure(EntityFailure {
                    entity_key: entity.key.clone(),
                    primary_attempts,
                    primary_error: error,
                    fallback_error: None,
                })
            }
        }
    }
}

#[async_trait]
impl Stage for Extractor {
    type Input = Vec<Entity>;
    type Output = Extraction;

    fn name(&self) -> &'static str {
        "extract"
    }

    async fn run(&self, input: &Vec<Entity>, cancel: &CancellationToken) -> Result<StageOutput<Extraction>> {
        let extraction = self.extract(input, cancel).await?;
        let reasons = extraction
            .failures
            .iter()
            .map(|f| format!("no snapshot for {}", f))
            .collect();
        Ok(StageOutput::degraded_if(extraction, reasons))
    }
}
