// src/models/matching.rs

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureKind {
    NameOverlap,
    FuzzyName,
    Unit,
    PriceGroup,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::NameOverlap => "name_overlap",
            FeatureKind::FuzzyName => "fuzzy_name",
            FeatureKind::Unit => "unit",
            FeatureKind::PriceGroup => "price_group",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contribution of one feature to a pair score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScore {
    pub kind: FeatureKind,
    pub score: f64,
    pub weight: f64,
    /// Set when the feature failed to compute and contributed zero.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

/// A scored candidate pair. `idx_a < idx_b` always holds, so the unordered
/// pair has exactly one representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    #[serde(skip)]
    pub idx_a: usize,
    #[serde(skip)]
    pub idx_b: usize,
    pub id_a: String,
    pub id_b: String,
    pub score: f64,
    pub matched_features: Vec<FeatureScore>,
}

impl SimilarityEdge {
    pub fn pair(&self) -> (usize, usize) {
        (self.idx_a, self.idx_b)
    }
}
