// src/models/cluster.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    Pending,
    Merged,
    Rejected,
}

/// A component of the union-find over qualifying edges, with at least two members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCluster {
    pub cluster_id: String,
    /// Arena indices, ascending.
    #[serde(skip)]
    pub members: Vec<usize>,
    /// Record ids in the same order as `members`.
    pub member_ids: Vec<String>,
    pub canonical_id: String,
    pub canonical_name: String,
    /// Mean score of every scored edge with both endpoints inside the cluster.
    pub confidence: f64,
    pub edge_count: usize,
    pub status: ClusterStatus,
}

impl DuplicateCluster {
    pub fn size(&self) -> usize {
        self.member_ids.len()
    }

    pub fn contains(&self, record_id: &str) -> bool {
        self.member_ids.iter().any(|id| id == record_id)
    }
}

/// Normalized features the survivor is rewritten with when a merge commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurvivorUpdate {
    pub normalized_name: String,
    pub unit_token: Option<String>,
    pub price_group_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeDecision {
    pub cluster_id: String,
    pub survivor_id: String,
    pub merged_ids: Vec<String>,
    pub canonical_name: String,
    pub confidence: f64,
    pub dry_run: bool,
    /// True when the cluster was below threshold and merged only because of `force`.
    pub forced: bool,
    pub executed_at: DateTime<Utc>,
    pub survivor_update: SurvivorUpdate,
}

impl MergeDecision {
    /// Survivor first, then merged ids.
    pub fn all_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.merged_ids.len() + 1);
        ids.push(self.survivor_id.clone());
        ids.extend(self.merged_ids.iter().cloned());
        ids
    }
}

/// A cluster withheld from merging because it fell below the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedGroup {
    pub cluster_id: String,
    pub member_ids: Vec<String>,
    pub confidence: f64,
    pub rejected_at: DateTime<Utc>,
}
