// src/diagnostics/snapshot.rs

use log::info;
use std::collections::HashMap;

use crate::blocking::BlockingIndex;
use crate::candidate_generation::{generate_candidate_edges, plan_candidate_pairs, RejectionIndex};
use crate::clustering::build_clusters;
use crate::errors::{DedupeError, DedupeResult};
use crate::models::cluster::{DuplicateCluster, RejectedGroup};
use crate::models::matching::SimilarityEdge;
use crate::models::product::{NormalizedProduct, ProductRecord};
use crate::normalization::normalize_records;
use crate::pipeline::{load_catalog, load_rejected_groups};
use crate::repository::ProductRepository;
use crate::utils::engine_config::{EngineConfig, RejectedClusterPolicy};

/// Read-only view of the catalog as a run would see it: unmerged records,
/// normalized, blocked and filtered by rejected groups with the same
/// settings as the merge path.
#[derive(Debug)]
pub struct CatalogSnapshot {
    products: Vec<NormalizedProduct>,
    index: BlockingIndex,
    exclusions: RejectionIndex,
    failures: Vec<DedupeError>,
    by_id: HashMap<String, usize>,
}

impl CatalogSnapshot {
    /// `rejected` only takes effect under `RejectedClusterPolicy::Exclude`.
    pub fn build(records: &[ProductRecord], config: &EngineConfig, rejected: &[RejectedGroup]) -> Self {
        let active: Vec<ProductRecord> = records.iter().filter(|r| !r.is_merged()).cloned().collect();
        let outcome = normalize_records(&active);
        let index = BlockingIndex::build(&outcome.products, config.max_block_size);
        let exclusions = match config.rejected_policy {
            RejectedClusterPolicy::Exclude => RejectionIndex::build(rejected, &outcome.products),
            RejectedClusterPolicy::Reevaluate => RejectionIndex::empty(),
        };
        let by_id = outcome
            .products
            .iter()
            .map(|p| (p.id.clone(), p.idx))
            .collect();
        Self {
            products: outcome.products,
            index,
            exclusions,
            failures: outcome.failures,
            by_id,
        }
    }

    pub async fn load(repo: &dyn ProductRepository, config: &EngineConfig) -> DedupeResult<Self> {
        config.validate()?;
        let records = load_catalog(repo, config.read_batch_size, config.retry_policy(), &mut Vec::new()).await?;
        let rejected = load_rejected_groups(repo, config, &mut Vec::new()).await;
        let snapshot = Self::build(&records, config, &rejected);
        info!(
            "Snapshot of {} records ({} normalized, {} blocks)",
            records.len(),
            snapshot.products.len(),
            snapshot.index.block_count()
        );
        Ok(snapshot)
    }

    pub fn products(&self) -> &[NormalizedProduct] {
        &self.products
    }

    pub fn index(&self) -> &BlockingIndex {
        &self.index
    }

    /// True when the pair sits inside a rejected group and runs skip it.
    pub fn is_excluded(&self, a: usize, b: usize) -> bool {
        self.exclusions.excludes(a, b)
    }

    /// Records that failed to normalize and are invisible to every query.
    pub fn failures(&self) -> &[DedupeError] {
        &self.failures
    }

    pub fn get(&self, id: &str) -> Option<&NormalizedProduct> {
        self.by_id.get(id).map(|&idx| &self.products[idx])
    }

    pub fn lookup(&self, id: &str) -> DedupeResult<&NormalizedProduct> {
        self.get(id).ok_or_else(|| DedupeError::UnknownRecord(id.to_string()))
    }

    /// Every candidate edge of the snapshot, scored in plan order.
    pub fn scored_edges(&self) -> Vec<SimilarityEdge> {
        let plan = plan_candidate_pairs(&self.index, None, &self.exclusions);
        generate_candidate_edges(&self.products, &plan)
            .into_iter()
            .flat_map(|batch| batch.edges)
            .collect()
    }

    pub fn clusters(&self, threshold: f64) -> Vec<DuplicateCluster> {
        build_clusters(&self.products, &self.scored_edges(), threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    fn records() -> Vec<ProductRecord> {
        let mut merged = ProductRecord::new("p4", "Coca Cola 330ml", "feed");
        merged.merged_into = Some("p1".to_string());
        vec![
            ProductRecord::new("p1", "Coca Cola 330ml", "feed"),
            ProductRecord::new("p2", "Coca-Cola lon 330 ml", "feed"),
            ProductRecord::new("p3", "   ", "feed"),
            merged,
        ]
    }

    #[test]
    fn test_snapshot_skips_merged_and_broken_records() {
        let snapshot = CatalogSnapshot::build(&records(), &EngineConfig::default(), &[]);
        assert_eq!(snapshot.products().len(), 2);
        assert_eq!(snapshot.failures().len(), 1);
        assert!(snapshot.get("p4").is_none());
        assert!(matches!(snapshot.lookup("p3"), Err(DedupeError::UnknownRecord(_))));
        assert_eq!(snapshot.lookup("p2").unwrap().idx, 1);
        assert_eq!(snapshot.scored_edges().len(), 1);
        assert_eq!(snapshot.clusters(0.85).len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_loads_from_repository() {
        let repo = InMemoryRepository::new(records());
        let snapshot = CatalogSnapshot::load(&repo, &EngineConfig::default()).await.unwrap();
        assert_eq!(snapshot.products().len(), 2);
        assert_eq!(snapshot.index().block_count(), 1);
    }

    #[test]
    fn test_rejected_groups_apply_only_when_excluded() {
        let rejected = RejectedGroup {
            cluster_id: "cl-old".to_string(),
            member_ids: vec!["p1".to_string(), "p2".to_string()],
            confidence: 0.5,
            rejected_at: chrono::Utc::now(),
        };
        let reevaluate = CatalogSnapshot::build(&records(), &EngineConfig::default(), &[rejected.clone()]);
        assert!(!reevaluate.is_excluded(0, 1));
        assert_eq!(reevaluate.scored_edges().len(), 1);

        let config = EngineConfig {
            rejected_policy: RejectedClusterPolicy::Exclude,
            ..EngineConfig::default()
        };
        let exclude = CatalogSnapshot::build(&records(), &config, &[rejected]);
        assert!(exclude.is_excluded(0, 1));
        assert!(exclude.scored_edges().is_empty());
        assert!(exclude.clusters(0.85).is_empty());
    }
}
