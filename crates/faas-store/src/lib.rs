// FaaS stores - function records and invocation metrics
use faas_common::FaasError;
use thiserror::Error;

mod json_file;
mod metrics;
mod registry;

pub use metrics::{InMemoryMetricStore, JsonFileMetricStore, MetricStore};
pub use registry::{FunctionRegistry, InMemoryRegistry, JsonFileRegistry};

// Error Types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt store {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for FaasError {
    fn from(err: StoreError) -> Self {
        FaasError::Registry(err.to_string())
    }
}
