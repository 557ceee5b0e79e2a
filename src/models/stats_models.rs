// src/models/stats_models.rs

use serde::{Deserialize, Serialize};

use crate::errors::DedupeError;
use crate::models::cluster::{DuplicateCluster, MergeDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    Normalization,
    Scoring,
    OversizedBlock,
    StorageConflict,
    StorageRetry,
    Rejection,
    Run,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWarning {
    pub kind: WarningKind,
    /// Record id, cluster id or block key the warning is about.
    pub subject: Option<String>,
    pub message: String,
}

impl RunWarning {
    pub fn new(kind: WarningKind, subject: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject,
            message: message.into(),
        }
    }
}

impl From<&DedupeError> for RunWarning {
    fn from(err: &DedupeError) -> Self {
        let (kind, subject) = match err {
            DedupeError::Normalization { record_id, .. } => (WarningKind::Normalization, Some(record_id.clone())),
            DedupeError::Scoring { id_a, id_b, .. } => (WarningKind::Scoring, Some(format!("{}|{}", id_a, id_b))),
            DedupeError::StorageConflict { cluster_id, .. } => (WarningKind::StorageConflict, Some(cluster_id.clone())),
            DedupeError::Storage(_) => (WarningKind::StorageRetry, None),
            DedupeError::ThresholdViolation { cluster_id, .. } => (WarningKind::Rejection, Some(cluster_id.clone())),
            DedupeError::Configuration(_) | DedupeError::UnknownRecord(_) | DedupeError::UnknownCluster(_) => {
                (WarningKind::Run, None)
            }
        };
        Self::new(kind, subject, err.to_string())
    }
}

/// A cluster whose merge could not be committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterFailure {
    pub cluster_id: String,
    pub member_ids: Vec<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Records read from the store.
    pub total: usize,
    /// Records collapsed (or, in dry-run, that would be collapsed) into a survivor.
    pub normalized: usize,
    /// Records in processed clusters that were not merged.
    pub pending: usize,
    pub merged_clusters: usize,
    pub already_merged: usize,
    pub normalization_failures: usize,
    pub blocks: usize,
    pub skipped_blocks: usize,
    pub candidate_pairs: usize,
    pub edges_scored: usize,
    pub clusters_found: usize,
    pub clusters_processed: usize,
    pub rejected_clusters: usize,
    pub failed_clusters: usize,
    pub processing_time: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub total: usize,
    pub normalized: usize,
    pub pending: usize,
}

impl From<&RunStats> for CatalogStats {
    fn from(stats: &RunStats) -> Self {
        Self {
            total: stats.total,
            normalized: stats.normalized,
            pending: stats.pending,
        }
    }
}

/// Everything a run produced. Clusters and decisions are run-scoped and only
/// reported; persisting decisions is the repository's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub run_id: String,
    pub success: bool,
    pub message: String,
    pub dry_run: bool,
    pub force: bool,
    pub threshold: f64,
    pub limit: Option<usize>,
    pub cancelled: bool,
    pub stats: RunStats,
    pub clusters: Vec<DuplicateCluster>,
    pub decisions: Vec<MergeDecision>,
    pub failures: Vec<ClusterFailure>,
    pub warnings: Vec<RunWarning>,
}

impl Report {
    pub fn warning_count(&self, kind: WarningKind) -> usize {
        self.warnings.iter().filter(|w| w.kind == kind).count()
    }
}

/// Response shape of the `normalizeCatalog` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeCatalogResponse {
    pub success: bool,
    pub message: String,
    pub stats: CatalogStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_map_to_warning_kinds() {
        let scoring = RunWarning::from(&DedupeError::Scoring {
            feature: "price_group",
            id_a: "a".to_string(),
            id_b: "b".to_string(),
            reason: "unparsable bracket 'cheap'".to_string(),
        });
        assert_eq!(scoring.kind, WarningKind::Scoring);
        assert_eq!(scoring.subject.as_deref(), Some("a|b"));

        let rejected = RunWarning::from(&DedupeError::ThresholdViolation {
            cluster_id: "cl-1".to_string(),
            confidence: 0.9,
            threshold: 0.95,
        });
        assert_eq!(rejected.kind, WarningKind::Rejection);
        assert_eq!(rejected.subject.as_deref(), Some("cl-1"));

        for err in [
            DedupeError::Configuration("bad threshold".to_string()),
            DedupeError::UnknownRecord("p9".to_string()),
            DedupeError::UnknownCluster("cl-9".to_string()),
        ] {
            let warning = RunWarning::from(&err);
            assert_eq!(warning.kind, WarningKind::Run);
            assert!(warning.subject.is_none());
            assert_eq!(warning.message, err.to_string());
        }
    }
}
