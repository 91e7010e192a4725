use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::app::ports::{Sink, SnapshotStore, SourceClient};
use crate::config::Config;
use crate::pipeline::extract::{EntityFailure, Extraction, Extractor};
use crate::pipeline::load::{BulkLoader, LoadReport};
use crate::pipeline::transform::Transformer;
use crate::pipeline::validate::{ValidationInput, ValidationReport, Validator};
use crate::pipeline::Stage;
use crate::types::{Entity, SnapshotRef, TransformStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Extracting,
    Transforming,
    Loading,
    Validating,
    Done,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Extracting => "extracting",
            RunState::Transforming => "transforming",
            RunState::Loading => "loading",
            RunState::Validating => "validating",
            RunState::Done => "done",
            RunState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage finished with usable but incomplete output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    pub stage: String,
    pub detail: String,
}

/// Everything an operator needs to know about one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    /// Every state the run passed through, starting with `Idle`
    pub transitions: Vec<RunState>,
    pub degradations: Vec<Degradation>,
    pub abort_reason: Option<String>,
    pub extraction_failures: Vec<EntityFailure>,
    /// Store keys of the snapshots that fed the transformer
    pub snapshots: Vec<String>,
    pub provenance: Vec<SnapshotRef>,
    pub transform_stats: Option<TransformStats>,
    pub staged_rows: usize,
    pub load: Option<LoadReport>,
    pub validation: Option<ValidationReport>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Idle,
            transitions: vec![RunState::Idle],
            degradations: Vec::new(),
            abort_reason: None,
            extraction_failures: Vec::new(),
            snapshots: Vec::new(),
            provenance: Vec::new(),
            transform_stats: None,
            staged_rows: 0,
            load: None,
            validation: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Done
    }

    fn transition(&mut self, next: RunState) {
        if self.state.is_terminal() {
            return;
        }
        info!(from = %self.state, to = %next, "state transition");
        self.state = next;
        self.transitions.push(next);
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    fn abort(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(state = %self.state, reason = %reason, "run aborted");
        self.abort_reason = Some(reason);
        self.transition(RunState::Aborted);
    }
}

/// Sequences the stages and decides between degraded and fatal
pub struct Orchestrator {
    entities: Vec<Entity>,
    extractor: Extractor,
    transformer: Transformer,
    loader: BulkLoader,
    validator: Validator,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        primary: Arc<dyn SourceClient>,
        fallback: Arc<dyn SourceClient>,
        store: Arc<dyn SnapshotStore>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            entities: config.entities.clone(),
            extractor: Extractor::new(primary, fallback, store, config.extract.retry, config.extract.workers),
            transformer: Transformer::new(&config.features),
            loader: BulkLoader::new(
                sink,
                config.load.table.clone(),
                config.load.batch_size,
                config.load.retry,
                config.load.workers,
            ),
            validator: Validator::new(&config.validation, &config.features),
        }
    }

    /// Extraction alone, for runs that only refresh the snapshot store
    pub async fn extract_only(&self, cancel: &CancellationToken) -> crate::error::Result<Extraction> {
        self.extractor.extract(&self.entities, cancel).await
    }

    /// Drive one run to `Done` or `Aborted`. Always returns a report.
    pub async fn run(&self, cancel: &CancellationToken) -> RunReport {
        let mut report = RunReport::new();
        let span = info_span!("run", run_id = %report.run_id);
        async {
            info!(entities = self.entities.len(), "pipeline run started");
            self.drive(&mut report, cancel).await;
            crate::metrics::pipeline::run_finished(report.state.as_str());
            match report.state {
                RunState::Done => info!(degradations = report.degradations.len(), "pipeline run finished"),
                _ => warn!(reason = ?report.abort_reason, "pipeline run did not complete"),
            }
        }
        .instrument(span)
        .await;
        report
    }

    async fn drive(&self, report: &mut RunReport, cancel: &CancellationToken) {
        report.transition(RunState::Extracting);
        let Some(extraction) = self.run_stage(&self.extractor, &self.entities, cancel, report).await else {
            return;
        };
        report.extraction_failures = extraction.failures;
        report.snapshots = extraction.snapshots.values().map(|s| s.store_key()).collect();
        let snapshots: Vec<_> = extraction.snapshots.into_values().collect();

        report.transition(RunState::Transforming);
        let Some(staged) = self.run_stage(&self.transformer, &snapshots, cancel, report).await else {
            return;
        };
        report.provenance = staged.provenance.clone();
        report.transform_stats = Some(staged.stats.clone());
        report.staged_rows = staged.len();

        report.transition(RunState::Loading);
        let before = self.loader.count_rows().await;
        let Some(load) = self.run_stage(&self.loader, &staged, cancel, report).await else {
            return;
        };
        let after = self.loader.count_rows().await;
        report.load = Some(load);
        if cancel.is_cancelled() {
            report.abort("cancelled during load");
            return;
        }

        report.transition(RunState::Validating);
        let input = ValidationInput {
            raw_count: staged.stats.flattened_rows,
            staged: Arc::clone(&staged),
            sink_count: before.zip(after).map(|(b, a)| a.saturating_sub(b)),
        };
        let Some(validation) = self.run_stage(&self.validator, &input, cancel, report).await else {
            return;
        };
        report.validation = Some(validation);
        report.transition(RunState::Done);
    }

    /// Run one stage; `None` means the run has been aborted
    async fn run_stage<S: Stage>(
        &self,
        stage: &S,
        input: &S::Input,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Option<S::Output> {
        if cancel.is_cancelled() {
            report.abort(format!("cancelled before {}", stage.name()));
            return None;
        }

        let started = Instant::now();
        let result = stage.run(input, cancel).await;
        crate::metrics::pipeline::stage_duration(stage.name(), started.elapsed().as_secs_f64());

        match result {
            Ok(output) => {
                let (output, reasons) = output.into_parts();
                for detail in reasons {
                    warn!(stage = stage.name(), detail = %detail, "stage degraded");
                    report.degradations.push(Degradation {
                        stage: stage.name().to_string(),
                        detail,
                    });
                }
                Some(output)
            }
            Err(e) => {
                report.abort(format!("{} failed: {}", stage.name(), e));
                None
            }
        }
    }
}
