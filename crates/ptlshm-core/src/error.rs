//! Error types for ptlshm

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("shared memory object unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("mapping failed: {0}")]
    MappingFailed(String),

    #[error("invalid region layout: {0}")]
    InvalidLayout(String),

    /// A cycle ended without publishing its pad or its failure
    #[error("initialization failed: {0}")]
    InitFailed(String),

    #[error("bootstrap failed: {0}")]
    BootstrapFailure(String),

    #[error("lifecycle misuse: {0}")]
    LifecycleMisuse(&'static str),

    #[error("wait timed out after {0:?}")]
    Timeout(Duration),

    #[error("network interface error: {0}")]
    Interface(String),
}

pub type Result<T> = std::result::Result<T, Error>;
