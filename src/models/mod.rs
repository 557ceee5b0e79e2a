pub mod cluster;
pub mod matching;
pub mod product;
pub mod stats_models;

pub use cluster::{ClusterStatus, DuplicateCluster, MergeDecision, RejectedGroup, SurvivorUpdate};
pub use matching::{FeatureKind, FeatureScore, SimilarityEdge};
pub use product::{NormalizedProduct, NormalizedToken, NormalizedTokens, ProductRecord, TokenKind};
pub use stats_models::{
    CatalogStats, ClusterFailure, NormalizeCatalogResponse, Report, RunStats, RunWarning, WarningKind,
};
