// src/clustering/create_clusters.rs

use log::{debug, info};
use petgraph::unionfind::UnionFind;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::models::cluster::{ClusterStatus, DuplicateCluster};
use crate::models::matching::SimilarityEdge;
use crate::models::product::NormalizedProduct;
use crate::resolution::resolve_canonical;

const CLUSTER_ID_PREFIX: &str = "cl-";
const CLUSTER_ID_HEX_LEN: usize = 16;

/// Stable cluster id derived from the sorted member ids.
pub fn cluster_id_for(member_ids: &[String]) -> String {
    let mut sorted: Vec<&str> = member_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}{}", CLUSTER_ID_PREFIX, &digest[..CLUSTER_ID_HEX_LEN])
}

/// Single-writer union-find over the product arena.
///
/// Every scored edge is remembered (for cluster confidence); only edges at or
/// above the threshold union their endpoints.
pub struct ClusterBuilder {
    threshold: f64,
    union_find: UnionFind<usize>,
    scored: Vec<(usize, usize, f64)>,
    qualifying: usize,
}

impl ClusterBuilder {
    pub fn new(product_count: usize, threshold: f64) -> Self {
        Self {
            threshold,
            union_find: UnionFind::new(product_count),
            scored: Vec::new(),
            qualifying: 0,
        }
    }

    /// Returns true when the edge qualified and was unioned.
    pub fn add_edge(&mut self, edge: &SimilarityEdge) -> bool {
        self.scored.push((edge.idx_a, edge.idx_b, edge.score));
        if edge.score >= self.threshold {
            self.qualifying += 1;
            self.union_find.union(edge.idx_a, edge.idx_b);
            true
        } else {
            false
        }
    }

    pub fn add_edges<'a>(&mut self, edges: impl IntoIterator<Item = &'a SimilarityEdge>) {
        for edge in edges {
            self.add_edge(edge);
        }
    }

    pub fn edges_seen(&self) -> usize {
        self.scored.len()
    }

    pub fn qualifying_edges(&self) -> usize {
        self.qualifying
    }

    /// Turns components with two or more members into clusters, ordered by
    /// their smallest member index. `products` must be the arena the edges
    /// index into.
    pub fn build(mut self, products: &[NormalizedProduct]) -> Vec<DuplicateCluster> {
        let labels = self.union_find.into_labeling();

        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (idx, &label) in labels.iter().enumerate() {
            components.entry(label).or_default().push(idx);
        }
        components.retain(|_, members| members.len() > 1);

        // Sum in pair order so confidence does not depend on arrival order
        self.scored.sort_by(|x, y| (x.0, x.1).cmp(&(y.0, y.1)));
        let mut edge_scores: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
        for &(a, b, score) in &self.scored {
            if labels[a] == labels[b] && components.contains_key(&labels[a]) {
                edge_scores.entry(labels[a]).or_default().push(score);
            }
        }

        let mut clusters: Vec<DuplicateCluster> = components
            .into_iter()
            .filter_map(|(label, members)| {
                let scores = edge_scores.remove(&label).unwrap_or_default();
                let member_products: Vec<&NormalizedProduct> = members.iter().map(|&i| &products[i]).collect();
                let canonical = resolve_canonical(&member_products)?;
                let member_ids: Vec<String> = member_products.iter().map(|p| p.id.clone()).collect();
                let confidence = if scores.is_empty() {
                    0.0
                } else {
                    scores.iter().sum::<f64>() / scores.len() as f64
                };
                Some(DuplicateCluster {
                    cluster_id: cluster_id_for(&member_ids),
                    canonical_id: canonical.id.clone(),
                    canonical_name: canonical.normalized_name.clone(),
                    members,
                    member_ids,
                    confidence,
                    edge_count: scores.len(),
                    status: ClusterStatus::Pending,
                })
            })
            .collect();
        clusters.sort_by_key(|c| c.members.first().copied().unwrap_or(usize::MAX));

        for cluster in &clusters {
            debug!(
                "Cluster {}: {} members, {} edges, confidence {:.3}, canonical '{}'",
                cluster.cluster_id,
                cluster.size(),
                cluster.edge_count,
                cluster.confidence,
                cluster.canonical_name
            );
        }
        info!(
            "Built {} clusters from {} scored edges ({} at or above threshold {:.2})",
            clusters.len(),
            self.scored.len(),
            self.qualifying,
            self.threshold
        );
        clusters
    }
}

/// Convenience wrapper used by the diagnostic queries.
pub fn build_clusters(products: &[NormalizedProduct], edges: &[SimilarityEdge], threshold: f64) -> Vec<DuplicateCluster> {
    let mut builder = ClusterBuilder::new(products.len(), threshold);
    builder.add_edges(edges);
    builder.build(products)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::product::ProductRecord;
    use crate::normalization::normalize_records;

    fn products(n: usize) -> Vec<NormalizedProduct> {
        let records: Vec<ProductRecord> = (0..n)
            .map(|i| ProductRecord::new(format!("p{}", i), format!("Item number{} 100g", i), "feed"))
            .collect();
        normalize_records(&records).products
    }

    fn edge(a: usize, b: usize, score: f64) -> SimilarityEdge {
        SimilarityEdge {
            idx_a: a,
            idx_b: b,
            id_a: format!("p{}", a),
            id_b: format!("p{}", b),
            score,
            matched_features: Vec::new(),
        }
    }

    #[test]
    fn test_single_qualifying_edge_joins_components() {
        let p = products(5);
        let edges = vec![edge(0, 1, 0.95), edge(2, 3, 0.9), edge(1, 2, 0.86), edge(3, 4, 0.2)];
        let clusters = build_clusters(&p, &edges, 0.85);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_ids, vec!["p0", "p1", "p2", "p3"]);
        assert_eq!(clusters[0].edge_count, 3);
        let expected = (0.95 + 0.9 + 0.86) / 3.0;
        assert!((clusters[0].confidence - expected).abs() < 1e-12);
        assert_eq!(clusters[0].status, ClusterStatus::Pending);
    }

    #[test]
    fn test_internal_sub_threshold_edges_count_toward_confidence() {
        let p = products(3);
        let edges = vec![edge(0, 1, 0.9), edge(1, 2, 0.9), edge(0, 2, 0.3)];
        let clusters = build_clusters(&p, &edges, 0.85);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].edge_count, 3);
        assert!((clusters[0].confidence - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_singletons_are_not_emitted() {
        let p = products(3);
        let clusters = build_clusters(&p, &[edge(0, 1, 0.5)], 0.85);
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_cluster_ids_are_order_independent() {
        let a = cluster_id_for(&["p2".to_string(), "p1".to_string()]);
        let b = cluster_id_for(&["p1".to_string(), "p2".to_string()]);
        assert_eq!(a, b);
        assert!(a.starts_with("cl-"));
        assert_eq!(a.len(), 3 + 16);
        assert_ne!(a, cluster_id_for(&["p1".to_string(), "p3".to_string()]));
    }

    #[test]
    fn test_confidence_ignores_edge_arrival_order() {
        let p = products(4);
        let forward = vec![edge(0, 1, 0.91), edge(1, 2, 0.87), edge(2, 3, 0.99), edge(0, 3, 0.13)];
        let mut backward = forward.clone();
        backward.reverse();
        let x = build_clusters(&p, &forward, 0.85);
        let y = build_clusters(&p, &backward, 0.85);
        assert_eq!(x[0].confidence.to_bits(), y[0].confidence.to_bits());
        assert_eq!(x[0].cluster_id, y[0].cluster_id);
    }
}
