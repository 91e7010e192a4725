//! The ETL stages and the orchestrator that sequences them.
//!
//! Every stage is a concrete type implementing [`Stage`]; the orchestrator only
//! sees stage outputs, and decides whether a run continues or aborts.

pub mod extract;
pub mod load;
pub mod orchestrator;
pub mod retry;
pub mod transform;
pub mod validate;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A usable stage result, possibly incomplete
#[derive(Debug)]
pub enum StageOutput<T> {
    Complete(T),
    /// Partial but usable output; `reasons` explain what is missing
    Degraded { output: T, reasons: Vec<String> },
}

impl<T> StageOutput<T> {
    pub fn degraded_if(output: T, reasons: Vec<String>) -> Self {
        if reasons.is_empty() {
            StageOutput::Complete(output)
        } else {
            StageOutput::Degraded { output, reasons }
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, StageOutput::Degraded { .. })
    }

    pub fn into_parts(self) -> (T, Vec<String>) {
        match self {
            StageOutput::Complete(output) => (output, Vec::new()),
            StageOutput::Degraded { output, reasons } => (output, reasons),
        }
    }
}

/// One step of the pipeline with a single entry point. An `Err` is fatal for
/// the run; soft failures travel inside the output.
#[async_trait]
pub trait Stage: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    fn name(&self) -> &'static str;

    async fn run(&self, input: &Self::Input, cancel: &CancellationToken) -> Result<StageOutput<Self::Output>>;
}
