use thiserror::Error;

/// Failure of a single call to an upstream provider.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("request to {source_name} failed: {message}")]
    Transport { source_name: String, message: String },

    #[error("{source_name} responded with HTTP {status}")]
    Status { source_name: String, status: u16 },

    #[error("{source_name} returned an undecodable body: {message}")]
    Decode { source_name: String, message: String },
}

impl SourceError {
    /// Transient failures are worth another attempt; everything else moves
    /// straight on to the fallback source.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Transport { .. } => true,
            SourceError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            SourceError::Decode { .. } => false,
        }
    }
}

/// Failure reported by (or while talking to) the bulk-insert sink.
#[derive(Error, Debug, Clone)]
pub enum SinkError {
    #[error("sink unreachable: {0}")]
    Unreachable(String),

    #[error("sink rejected the request: {0}")]
    Rejected(String),

    #[error("sink I/O failure: {0}")]
    Io(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("snapshot already exists: {0}")]
    AlreadyExists(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Run-level failures. Anything surfacing as a `PipelineError` aborts the run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no entities configured for extraction")]
    NoEntities,

    #[error("extraction failed for all {0} entities")]
    AllEntitiesFailed(usize),

    #[error("transformation produced no staged rows")]
    EmptyDataset,

    #[error("sink pre-flight failed: {0}")]
    SinkUnreachable(#[source] SinkError),

    #[error("snapshot store error: {0}")]
    Store(#[from] StoreError),

    #[error("run cancelled during {0}")]
    Cancelled(&'static str),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
