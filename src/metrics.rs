//! Pipeline metrics, grouped by stage.
//!
//! Every helper is a no-op until a recorder is installed, so library users and
//! tests never need to call [`init_metrics`].

use std::net::SocketAddr;
use tracing::{info, warn};

/// Install the Prometheus exporter listening on `addr`
pub fn init_metrics(addr: &str) {
    let addr: SocketAddr = match addr.parse() {
        Ok(a) => a,
        Err(e) => {
            warn!("Invalid metrics addr '{}': {}", addr, e);
            return;
        }
    };
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
        Err(e) => warn!("Prometheus exporter install failed (possibly already installed): {}", e),
    }
}

pub mod extract {
    pub fn attempt(source: &str) {
        ::metrics::counter!("airq_extract_attempts_total", "source" => source.to_string()).increment(1);
    }

    pub fn fallback_used() {
        ::metrics::counter!("airq_extract_fallbacks_total").increment(1);
    }

    pub fn entity_failed() {
        ::metrics::counter!("airq_extract_entity_failures_total").increment(1);
    }

    pub fn snapshot_persisted(bytes: usize) {
        ::metrics::counter!("airq_snapshots_persisted_total").increment(1);
        ::metrics::histogram!("airq_snapshot_bytes").record(bytes as f64);
    }
}

pub mod transform {
    pub fn rows_staged(n: usize) {
        ::metrics::counter!("airq_rows_staged_total").increment(n as u64);
    }

    pub fn rows_dropped(n: usize) {
        ::metrics::counter!("airq_rows_dropped_total").increment(n as u64);
    }

    pub fn snapshot_skipped() {
        ::metrics::counter!("airq_snapshots_skipped_total").increment(1);
    }
}

pub mod load {
    pub fn attempt() {
        ::metrics::counter!("airq_load_attempts_total").increment(1);
    }

    pub fn batch_inserted(rows: usize) {
        ::metrics::counter!("airq_load_batches_inserted_total").increment(1);
        ::metrics::counter!("airq_load_rows_inserted_total").increment(rows as u64);
    }

    pub fn batch_failed() {
        ::metrics::counter!("airq_load_batches_failed_total").increment(1);
    }
}

pub mod pipeline {
    pub fn stage_duration(stage: &'static str, secs: f64) {
        ::metrics::histogram!("airq_stage_duration_seconds", "stage" => stage).record(secs);
    }

    pub fn run_finished(state: &'static str) {
        ::metrics::counter!("airq_runs_total", "state" => state).increment(1);
    }
}
