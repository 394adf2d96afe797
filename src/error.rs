//! Error types for the subscription registry.

use crate::types::SubscriptionId;
use thiserror::Error;

/// Main error type for registry, store and reaper operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Subscription not found: {0}")]
    NotFound(SubscriptionId),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Malformed recovery entry {id}: {reason}")]
    MalformedRecoveryEntry { id: SubscriptionId, reason: String },

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Subscription log is locked by another process")]
    Locked,
}

impl RegistryError {
    /// Normalise an adapter failure into a `Store` error.
    pub(crate) fn into_store(self) -> Self {
        match self {
            e @ RegistryError::Store(_) => e,
            other => RegistryError::Store(other.to_string()),
        }
    }

    /// True if this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RegistryError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RegistryError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RegistryError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RegistryError::Deserialization(e.to_string())
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
