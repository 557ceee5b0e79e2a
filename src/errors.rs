// src/errors.rs

use std::fmt;
use thiserror::Error;

/// Error taxonomy of a deduplication run.
///
/// Only [`DedupeError::Configuration`] is fatal for a whole run. Record-level
/// variants are turned into report warnings and cluster-level variants into
/// cluster failures by the orchestrator.
#[derive(Debug, Clone, Error)]
pub enum DedupeError {
    #[error("normalization failed for record {record_id}: {reason}")]
    Normalization { record_id: String, reason: String },

    #[error("scoring feature '{feature}' failed for pair ({id_a}, {id_b}): {reason}")]
    Scoring {
        feature: &'static str,
        id_a: String,
        id_b: String,
        reason: String,
    },

    #[error("cluster {cluster_id} confidence {confidence:.3} is below threshold {threshold:.3}")]
    ThresholdViolation {
        cluster_id: String,
        confidence: f64,
        threshold: f64,
    },

    #[error("storage conflict on cluster {cluster_id}: {message}")]
    StorageConflict { cluster_id: String, message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown record: {0}")]
    UnknownRecord(String),

    #[error("unknown cluster: {0}")]
    UnknownCluster(String),
}

pub type DedupeResult<T> = std::result::Result<T, DedupeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StorageErrorKind {
    Transient,
    Permanent,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::Transient => write!(f, "transient"),
            StorageErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Error returned by a repository implementation.
#[derive(Debug, Clone, Error)]
#[error("{kind} storage error: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StorageErrorKind::Transient
    }
}
