// src/diagnostics/queries.rs
// Read-only diagnostic queries over a catalog snapshot. They share the
// scorer and cluster builder with the merge path, so a group reported here
// is the group a run with the same threshold would act on.

use log::debug;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::blocking::shares_block;
use crate::clustering::build_clusters;
use crate::diagnostics::snapshot::CatalogSnapshot;
use crate::errors::{DedupeError, DedupeResult};
use crate::matching::score_pair;
use crate::models::cluster::DuplicateCluster;
use crate::models::matching::FeatureScore;
use crate::models::product::{NormalizedProduct, ProductRecord};
use crate::normalization::normalize_record;
use crate::utils::engine_config::RunOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarProduct {
    pub candidate_id: String,
    pub raw_name: String,
    pub normalized_name: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub id_a: String,
    pub id_b: String,
    pub name_a: String,
    pub name_b: String,
    pub score: f64,
    /// Cluster both records fall into at the query threshold.
    pub cluster_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityReport {
    pub id_a: Option<String>,
    pub id_b: Option<String>,
    pub normalized_a: String,
    pub normalized_b: String,
    pub score: f64,
    pub features: Vec<FeatureScore>,
    /// Whether blocking would ever put the two records in front of the scorer.
    pub same_block: bool,
    pub errors: Vec<String>,
}

fn check_threshold(threshold: f64) -> DedupeResult<()> {
    RunOptions {
        threshold,
        ..RunOptions::default()
    }
    .validate()
}

fn by_score_desc(x: f64, y: f64) -> Ordering {
    y.partial_cmp(&x).unwrap_or(Ordering::Equal)
}

/// Candidates sharing a block with `product_id`, best score first. Pairs a
/// run would skip as previously rejected are left out.
pub fn get_similar_products(
    snapshot: &CatalogSnapshot,
    product_id: &str,
    limit: usize,
) -> DedupeResult<Vec<SimilarProduct>> {
    let product = snapshot.lookup(product_id)?;
    let products = snapshot.products();

    let mut similar: Vec<SimilarProduct> = snapshot
        .index()
        .candidates_for(product.idx)
        .into_iter()
        .filter(|&idx| !snapshot.is_excluded(product.idx, idx))
        .map(|idx| {
            let candidate = &products[idx];
            SimilarProduct {
                candidate_id: candidate.id.clone(),
                raw_name: candidate.raw_name.clone(),
                normalized_name: candidate.normalized_name.clone(),
                score: score_pair(product, candidate).score,
            }
        })
        .collect();
    similar.sort_by(|a, b| by_score_desc(a.score, b.score).then_with(|| a.candidate_id.cmp(&b.candidate_id)));
    similar.truncate(limit);
    debug!("{} similar products for {}", similar.len(), product_id);
    Ok(similar)
}

/// Canonical name of `cluster_id` among the groups formed at `threshold`.
pub fn find_canonical_name(snapshot: &CatalogSnapshot, cluster_id: &str, threshold: f64) -> DedupeResult<String> {
    check_threshold(threshold)?;
    snapshot
        .clusters(threshold)
        .into_iter()
        .find(|c| c.cluster_id == cluster_id)
        .map(|c| c.canonical_name)
        .ok_or_else(|| DedupeError::UnknownCluster(cluster_id.to_string()))
}

pub fn get_product_groups(snapshot: &CatalogSnapshot, threshold: f64) -> DedupeResult<Vec<DuplicateCluster>> {
    check_threshold(threshold)?;
    Ok(snapshot.clusters(threshold))
}

/// Pairs scoring at or above `threshold`, strongest first.
pub fn find_duplicates(
    snapshot: &CatalogSnapshot,
    threshold: f64,
    limit: Option<usize>,
) -> DedupeResult<Vec<DuplicatePair>> {
    check_threshold(threshold)?;
    let products = snapshot.products();
    let edges = snapshot.scored_edges();

    let clusters = build_clusters(products, &edges, threshold);
    let cluster_of: HashMap<usize, &str> = clusters
        .iter()
        .flat_map(|c| c.members.iter().map(move |&m| (m, c.cluster_id.as_str())))
        .collect();

    let mut qualifying: Vec<_> = edges.iter().filter(|e| e.score >= threshold).collect();
    qualifying.sort_by(|a, b| by_score_desc(a.score, b.score).then_with(|| a.pair().cmp(&b.pair())));

    let pairs = qualifying
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|edge| DuplicatePair {
            id_a: edge.id_a.clone(),
            id_b: edge.id_b.clone(),
            name_a: products[edge.idx_a].normalized_name.clone(),
            name_b: products[edge.idx_b].normalized_name.clone(),
            score: edge.score,
            cluster_id: cluster_of.get(&edge.idx_a).map(|id| id.to_string()),
        })
        .collect();
    Ok(pairs)
}

fn similarity_report(a: &NormalizedProduct, b: &NormalizedProduct, ids: Option<(&str, &str)>) -> SimilarityReport {
    let breakdown = score_pair(a, b);
    SimilarityReport {
        id_a: ids.map(|(x, _)| x.to_string()),
        id_b: ids.map(|(_, y)| y.to_string()),
        normalized_a: a.normalized_name.clone(),
        normalized_b: b.normalized_name.clone(),
        score: breakdown.score,
        features: breakdown.features,
        same_block: shares_block(a, b),
        errors: breakdown.errors.iter().map(|e| e.to_string()).collect(),
    }
}

/// Scores two raw names as if they were catalog records.
pub fn test_similarity(raw_a: &str, raw_b: &str) -> DedupeResult<SimilarityReport> {
    let a = normalize_record(&ProductRecord::new("a", raw_a, "adhoc"))?;
    let mut b = normalize_record(&ProductRecord::new("b", raw_b, "adhoc"))?;
    b.idx = 1;
    Ok(similarity_report(&a, &b, None))
}

pub fn test_similarity_by_id(snapshot: &CatalogSnapshot, id_a: &str, id_b: &str) -> DedupeResult<SimilarityReport> {
    let a = snapshot.lookup(id_a)?;
    let b = snapshot.lookup(id_b)?;
    Ok(similarity_report(a, b, Some((id_a, id_b))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{normalize_catalog, CancellationFlag, ProgressSink};
    use crate::pipeline::orchestrator::run_normalization;
    use crate::repository::{InMemoryRepository, ProductRepository};
    use crate::utils::engine_config::{EngineConfig, RejectedClusterPolicy};
    use std::sync::Arc;

    fn records() -> Vec<ProductRecord> {
        vec![
            ProductRecord::new("p1", "Coca Cola 330ml", "feed-a"),
            ProductRecord::new("p2", "Coca-Cola lon 330 ml", "feed-b"),
            ProductRecord::new("p3", "Coca Cola Zero 330ml", "feed-a"),
            ProductRecord::new("p4", "Pepsi 330ml", "feed-a"),
            ProductRecord::new("p5", "Tiger 330ml", "feed-a"),
            ProductRecord::new("p6", "Tiger lon 330ml", "feed-b"),
        ]
    }

    fn snapshot() -> CatalogSnapshot {
        CatalogSnapshot::build(&records(), &EngineConfig::default(), &[])
    }

    #[test]
    fn test_similar_products_are_ranked() {
        let snapshot = snapshot();
        let similar = get_similar_products(&snapshot, "p1", 10).unwrap();
        let ids: Vec<&str> = similar.iter().map(|s| s.candidate_id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p3"]);
        assert!(similar[0].score > similar[1].score);

        assert_eq!(get_similar_products(&snapshot, "p1", 1).unwrap().len(), 1);
        assert!(get_similar_products(&snapshot, "p4", 5).unwrap().is_empty());
        assert!(matches!(
            get_similar_products(&snapshot, "nope", 5),
            Err(DedupeError::UnknownRecord(_))
        ));
    }

    #[test]
    fn test_groups_and_canonical_names() {
        let snapshot = snapshot();
        let groups = get_product_groups(&snapshot, 0.85).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].member_ids, vec!["p1", "p2"]);
        assert_eq!(groups[1].member_ids, vec!["p5", "p6"]);

        let name = find_canonical_name(&snapshot, &groups[1].cluster_id, 0.85).unwrap();
        assert_eq!(name, "tiger lon 330ml");
        assert!(matches!(
            find_canonical_name(&snapshot, "cl-missing", 0.85),
            Err(DedupeError::UnknownCluster(_))
        ));
        assert!(matches!(
            get_product_groups(&snapshot, 2.0),
            Err(DedupeError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicates_are_strongest_first_and_limited() {
        let snapshot = snapshot();
        let pairs = find_duplicates(&snapshot, 0.85, None).unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.score >= 0.85 && p.cluster_id.is_some()));
        assert_eq!((pairs[0].id_a.as_str(), pairs[0].id_b.as_str()), ("p1", "p2"));

        let all = find_duplicates(&snapshot, 0.0, None).unwrap();
        assert!(all.len() > pairs.len());
        assert!(all.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(find_duplicates(&snapshot, 0.0, Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_similarity_of_raw_names() {
        let report = test_similarity("Coca Cola 330ml", "Coca-Cola lon 330 ml").unwrap();
        assert!((report.score - 1.0).abs() < 1e-12);
        assert!(report.same_block);
        assert!(report.id_a.is_none());

        let report = test_similarity("Coca Cola 330ml", "Pepsi 330ml").unwrap();
        assert!(!report.same_block);
        assert!(report.score < 0.5);

        assert!(matches!(
            test_similarity("", "Pepsi 330ml"),
            Err(DedupeError::Normalization { .. })
        ));
    }

    #[test]
    fn test_similarity_by_id_is_symmetric() {
        let snapshot = snapshot();
        let ab = test_similarity_by_id(&snapshot, "p1", "p3").unwrap();
        let ba = test_similarity_by_id(&snapshot, "p3", "p1").unwrap();
        assert_eq!(ab.score.to_bits(), ba.score.to_bits());
        assert_eq!(ab.id_a.as_deref(), Some("p1"));
        assert!(test_similarity_by_id(&snapshot, "p1", "p404").is_err());
    }

    #[tokio::test]
    async fn test_groups_match_what_a_run_merges() {
        let repo = Arc::new(InMemoryRepository::new(records()));
        let config = EngineConfig::default();
        let groups = get_product_groups(&snapshot(), config.threshold).unwrap();

        let dyn_repo: Arc<dyn ProductRepository> = repo.clone();
        let report = run_normalization(dyn_repo, &config, ProgressSink::disabled(), CancellationFlag::new())
            .await
            .unwrap();
        assert_eq!(report.clusters, groups);

        let response = normalize_catalog(repo, &config, config.run_options()).await;
        assert_eq!(response.stats.normalized, groups.iter().map(|g| g.size() - 1).sum::<usize>());
    }

    #[tokio::test]
    async fn test_excluded_groups_stay_hidden_like_in_a_run() {
        // Adjacent price brackets score ~0.967, the outer pair ~0.933
        let repo = Arc::new(InMemoryRepository::new(vec![
            ProductRecord::new("a", "Tiger lon 330ml", "feed").with_price_group("pg3"),
            ProductRecord::new("b", "Tiger lon 330ml", "feed").with_price_group("pg4"),
            ProductRecord::new("c", "Tiger lon 330ml", "feed").with_price_group("pg5"),
        ]));
        let dyn_repo: Arc<dyn ProductRepository> = repo.clone();
        let mut config = EngineConfig {
            threshold: 0.96,
            dry_run: false,
            ..EngineConfig::default()
        };
        let first = run_normalization(dyn_repo.clone(), &config, ProgressSink::disabled(), CancellationFlag::new())
            .await
            .unwrap();
        assert_eq!(first.stats.rejected_clusters, 1);

        config.dry_run = true;
        config.rejected_policy = RejectedClusterPolicy::Exclude;
        let snapshot = CatalogSnapshot::load(dyn_repo.as_ref(), &config).await.unwrap();
        let groups = get_product_groups(&snapshot, config.threshold).unwrap();
        let report = run_normalization(dyn_repo.clone(), &config, ProgressSink::disabled(), CancellationFlag::new())
            .await
            .unwrap();
        assert_eq!(report.clusters, groups);
        assert!(groups.is_empty());
        assert!(find_duplicates(&snapshot, config.threshold, None).unwrap().is_empty());
        assert!(get_similar_products(&snapshot, "a", 10).unwrap().is_empty());

        config.rejected_policy = RejectedClusterPolicy::Reevaluate;
        let snapshot = CatalogSnapshot::load(dyn_repo.as_ref(), &config).await.unwrap();
        assert_eq!(get_product_groups(&snapshot, config.threshold).unwrap().len(), 1);
        assert_eq!(get_similar_products(&snapshot, "a", 10).unwrap().len(), 2);
    }
}
