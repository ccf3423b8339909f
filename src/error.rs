//! Error types for the relay pipeline.

use crate::catalog::CatalogError;
use crate::source::DecodeError;
use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid journal format: {0}")]
    InvalidFormat(String),

    #[error("Journal is locked by another process")]
    Locked,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Subscription already exists: {0}")]
    SubscriptionExists(String),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Undecodable input: {0}")]
    Decode(#[from] DecodeError),
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Deserialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for PipelineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        PipelineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PipelineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        PipelineError::Deserialization(e.to_string())
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
