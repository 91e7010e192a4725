pub mod http_client;
pub mod postgrest_sink;
pub mod snapshot_store;
pub mod sqlite_sink;

use std::sync::Arc;
use std::time::Duration;

use crate::app::ports::Sink;
use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::storage::InMemorySink;

/// Build the sink selected in configuration
pub fn build_sink(config: &SinkConfig, timeout: Duration) -> Result<Arc<dyn Sink>, SinkError> {
    let sink: Arc<dyn Sink> = match config {
        SinkConfig::Postgrest { url, api_key } => Arc::new(postgrest_sink::PostgrestSink::new(url, api_key, timeout)?),
        SinkConfig::Sqlite { path } => Arc::new(sqlite_sink::SqliteSink::open(path)?),
        SinkConfig::Memory => Arc::new(InMemorySink::new()),
    };
    Ok(sink)
}
