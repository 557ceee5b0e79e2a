// src/candidate_generation/candidate_generation.rs

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::blocking::BlockingIndex;
use crate::matching::score_edge;
use crate::models::cluster::RejectedGroup;
use crate::models::matching::SimilarityEdge;
use crate::models::product::NormalizedProduct;
use crate::models::stats_models::RunWarning;
use crate::pipeline::progress::CancellationFlag;

/// Pairs per work unit; large blocks are split so workers stay balanced.
const WORK_UNIT_PAIRS: usize = 512;

/// Products that were withheld together in an earlier run. Used to skip
/// pairs inside a rejected group under the `Exclude` policy.
#[derive(Debug, Default)]
pub struct RejectionIndex {
    groups_by_idx: HashMap<usize, Vec<usize>>,
}

impl RejectionIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build(groups: &[RejectedGroup], products: &[NormalizedProduct]) -> Self {
        let idx_by_id: HashMap<&str, usize> = products.iter().map(|p| (p.id.as_str(), p.idx)).collect();
        let mut groups_by_idx: HashMap<usize, Vec<usize>> = HashMap::new();
        for (group_no, group) in groups.iter().enumerate() {
            for id in &group.member_ids {
                if let Some(&idx) = idx_by_id.get(id.as_str()) {
                    groups_by_idx.entry(idx).or_default().push(group_no);
                }
            }
        }
        debug!(
            "Rejection index: {} groups covering {} loaded products",
            groups.len(),
            groups_by_idx.len()
        );
        Self { groups_by_idx }
    }

    pub fn is_empty(&self) -> bool {
        self.groups_by_idx.is_empty()
    }

    /// True when both products belong to the same rejected group.
    pub fn excludes(&self, a: usize, b: usize) -> bool {
        match (self.groups_by_idx.get(&a), self.groups_by_idx.get(&b)) {
            (Some(ga), Some(gb)) => ga.iter().any(|g| gb.contains(g)),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub block_key: String,
    pub pairs: Vec<(usize, usize)>,
}

/// Intra-block pairs in block-iteration order, deduplicated across blocks.
#[derive(Debug, Default)]
pub struct CandidatePlan {
    pub units: Vec<WorkUnit>,
    /// Distinct pairs across all active blocks (after exclusions).
    pub total_pairs: usize,
    /// Pairs that will actually be scored (≤ `total_pairs` under a limit).
    pub planned_pairs: usize,
    pub excluded_pairs: usize,
    pub truncated: bool,
}

pub fn plan_candidate_pairs(
    index: &BlockingIndex,
    limit: Option<usize>,
    exclusions: &RejectionIndex,
) -> CandidatePlan {
    let mut plan = CandidatePlan::default();
    let mut seen: HashSet<(usize, usize)> = HashSet::new();

    for (key, members) in index.blocks() {
        let mut current = WorkUnit {
            block_key: key.to_string(),
            pairs: Vec::new(),
        };
        for (i, &a) in members.iter().enumerate() {
            for &b in &members[i + 1..] {
                if !seen.insert((a, b)) {
                    continue;
                }
                if exclusions.excludes(a, b) {
                    plan.excluded_pairs += 1;
                    continue;
                }
                plan.total_pairs += 1;
                if limit.map_or(false, |l| plan.planned_pairs >= l) {
                    plan.truncated = true;
                    continue;
                }
                plan.planned_pairs += 1;
                current.pairs.push((a, b));
                if current.pairs.len() == WORK_UNIT_PAIRS {
                    let full = std::mem::take(&mut current.pairs);
                    plan.units.push(WorkUnit {
                        block_key: key.to_string(),
                        pairs: full,
                    });
                }
            }
        }
        if !current.pairs.is_empty() {
            plan.units.push(current);
        }
    }

    if plan.truncated {
        info!(
            "Candidate limit reached: scoring {} of {} pairs",
            plan.planned_pairs, plan.total_pairs
        );
    }
    debug!(
        "Planned {} pairs in {} work units ({} excluded by rejections)",
        plan.planned_pairs,
        plan.units.len(),
        plan.excluded_pairs
    );
    plan
}

/// Edges scored for one work unit plus any scoring warnings.
#[derive(Debug, Clone)]
pub struct ScoredBatch {
    pub block_key: String,
    pub edges: Vec<SimilarityEdge>,
    pub warnings: Vec<RunWarning>,
}

pub fn score_work_unit(products: &[NormalizedProduct], unit: &WorkUnit) -> ScoredBatch {
    let mut edges = Vec::with_capacity(unit.pairs.len());
    let mut warnings = Vec::new();
    for &(a, b) in &unit.pairs {
        let (edge, errors) = score_edge(&products[a], &products[b]);
        for e in &errors {
            warn!("{}", e);
            warnings.push(RunWarning::from(e));
        }
        edges.push(edge);
    }
    ScoredBatch {
        block_key: unit.block_key.clone(),
        edges,
        warnings,
    }
}

/// Scores a plan on the current thread, in plan order.
pub fn generate_candidate_edges(products: &[NormalizedProduct], plan: &CandidatePlan) -> Vec<ScoredBatch> {
    plan.units.iter().map(|unit| score_work_unit(products, unit)).collect()
}

/// Scores a plan on `max_workers` blocking workers. Batches arrive on a
/// bounded channel in completion order; the receiver sees the channel close
/// once every worker is done or has observed cancellation.
pub fn stream_candidate_edges(
    products: Arc<Vec<NormalizedProduct>>,
    plan: CandidatePlan,
    max_workers: usize,
    cancel: CancellationFlag,
) -> (mpsc::Receiver<ScoredBatch>, Vec<JoinHandle<()>>) {
    let workers = max_workers.max(1).min(plan.units.len().max(1));
    let (tx, rx) = mpsc::channel::<ScoredBatch>(workers * 2);

    // Round-robin assignment keeps each worker's share fixed up front.
    let mut shares: Vec<Vec<WorkUnit>> = (0..workers).map(|_| Vec::new()).collect();
    for (i, unit) in plan.units.into_iter().enumerate() {
        shares[i % workers].push(unit);
    }

    let handles = shares
        .into_iter()
        .enumerate()
        .map(|(worker_id, share)| {
            let products = Arc::clone(&products);
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                for unit in share {
                    if cancel.is_cancelled() {
                        debug!("Scoring worker {} stopping: cancelled", worker_id);
                        return;
                    }
                    let batch = score_work_unit(&products, &unit);
                    if tx.blocking_send(batch).is_err() {
                        debug!("Scoring worker {} stopping: receiver dropped", worker_id);
                        return;
                    }
                }
            })
        })
        .collect();

    (rx, handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::product::ProductRecord;
    use crate::normalization::normalize_records;
    use chrono::Utc;

    fn products(names: &[&str]) -> Vec<NormalizedProduct> {
        let records: Vec<ProductRecord> = names
            .iter()
            .enumerate()
            .map(|(i, n)| ProductRecord::new(format!("p{}", i), *n, "feed"))
            .collect();
        normalize_records(&records).products
    }

    #[test]
    fn test_pairs_are_deduplicated_across_blocks() {
        // p0 and p2 have no unit, so they meet in nescafe|-, nescafe|g and nescafe|pcs
        let p = products(&["Nescafe Gold", "Nescafe Gold 200g", "Nescafe Classic", "Nescafe 20 pcs"]);
        let index = BlockingIndex::build(&p, 1000);
        let plan = plan_candidate_pairs(&index, None, &RejectionIndex::empty());
        let pairs: Vec<(usize, usize)> = plan.units.iter().flat_map(|u| u.pairs.clone()).collect();
        assert_eq!(pairs, vec![(0, 2), (0, 1), (1, 2), (0, 3), (2, 3)]);
        assert_eq!(plan.total_pairs, 5);
        assert!(!plan.truncated);
    }

    #[test]
    fn test_limit_truncates_in_block_order() {
        let p = products(&["Tiger 330ml", "Tiger lon 330ml", "Bia Tiger 330ml", "Sapporo 330ml", "Sapporo lon 330ml"]);
        let index = BlockingIndex::build(&p, 1000);
        let plan = plan_candidate_pairs(&index, Some(1), &RejectionIndex::empty());
        assert_eq!(plan.planned_pairs, 1);
        assert_eq!(plan.total_pairs, 2);
        assert!(plan.truncated);
        // "sapporo|ml" sorts before "tiger|ml"
        assert_eq!(plan.units[0].block_key, "sapporo|ml");
        assert_eq!(plan.units[0].pairs, vec![(3, 4)]);
    }

    #[test]
    fn test_rejected_groups_are_excluded() {
        let p = products(&["Tiger 330ml", "Tiger lon 330ml", "Tiger chai 330ml"]);
        let index = BlockingIndex::build(&p, 1000);
        let rejected = RejectedGroup {
            cluster_id: "cl-old".to_string(),
            member_ids: vec!["p0".to_string(), "p1".to_string()],
            confidence: 0.5,
            rejected_at: Utc::now(),
        };
        let exclusions = RejectionIndex::build(&[rejected], &p);
        assert!(exclusions.excludes(0, 1));
        assert!(!exclusions.excludes(0, 2));
        let plan = plan_candidate_pairs(&index, None, &exclusions);
        assert_eq!(plan.excluded_pairs, 1);
        assert_eq!(plan.planned_pairs, 2);
    }

    #[tokio::test]
    async fn test_streamed_edges_match_sequential_scoring() {
        let p = products(&[
            "Coca Cola 330ml",
            "Coca-Cola lon 330 ml",
            "Coca Cola Zero 330ml",
            "Pepsi 330ml",
            "Pepsi lon 330ml",
        ]);
        let index = BlockingIndex::build(&p, 1000);
        let sequential: Vec<SimilarityEdge> =
            generate_candidate_edges(&p, &plan_candidate_pairs(&index, None, &RejectionIndex::empty()))
                .into_iter()
                .flat_map(|b| b.edges)
                .collect();

        let plan = plan_candidate_pairs(&index, None, &RejectionIndex::empty());
        let (mut rx, handles) = stream_candidate_edges(Arc::new(p), plan, 3, CancellationFlag::new());
        let mut streamed = Vec::new();
        while let Some(batch) = rx.recv().await {
            streamed.extend(batch.edges);
        }
        for h in handles {
            h.await.unwrap();
        }
        streamed.sort_by_key(|e| e.pair());
        let mut expected = sequential;
        expected.sort_by_key(|e| e.pair());
        assert_eq!(streamed, expected);
    }

    #[tokio::test]
    async fn test_cancelled_stream_scores_nothing() {
        let p = products(&["Tiger 330ml", "Tiger lon 330ml"]);
        let index = BlockingIndex::build(&p, 1000);
        let plan = plan_candidate_pairs(&index, None, &RejectionIndex::empty());
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let (mut rx, handles) = stream_candidate_edges(Arc::new(p), plan, 2, cancel);
        assert!(rx.recv().await.is_none());
        for h in handles {
            h.await.unwrap();
        }
    }
}
