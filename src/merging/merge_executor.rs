// src/merging/merge_executor.rs
// Turns clusters into merge decisions and commits them through the repository.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::errors::{DedupeError, DedupeResult};
use crate::merging::retry::RetryPolicy;
use crate::models::cluster::{ClusterStatus, DuplicateCluster, MergeDecision, RejectedGroup, SurvivorUpdate};
use crate::models::product::NormalizedProduct;
use crate::models::stats_models::{ClusterFailure, RunWarning, WarningKind};
use crate::pipeline::progress::{CancellationFlag, ProgressEvent, ProgressSink};
use crate::repository::{ProductRepository, WriteOutcome};
use crate::resolution::resolve_canonical;

#[derive(Debug, Clone, Copy)]
pub struct MergePolicy {
    pub threshold: f64,
    pub force: bool,
    pub dry_run: bool,
    pub max_concurrent_merges: usize,
    pub retry: RetryPolicy,
}

/// What happened to the clusters handed to the executor.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Processed clusters with their final status, in input order.
    pub clusters: Vec<DuplicateCluster>,
    pub decisions: Vec<MergeDecision>,
    pub failures: Vec<ClusterFailure>,
    pub warnings: Vec<RunWarning>,
    /// Clusters left untouched because the run was cancelled.
    pub skipped: Vec<DuplicateCluster>,
    pub rejected: usize,
    /// Records in rejected or failed clusters.
    pub pending_records: usize,
    pub cancelled: bool,
}

impl MergeOutcome {
    pub fn merged_records(&self) -> usize {
        self.decisions.iter().map(|d| d.merged_ids.len()).sum()
    }
}

enum CommitResult {
    Committed(MergeDecision, Vec<RunWarning>),
    Failed(DedupeError, Vec<RunWarning>),
    /// Cancelled before the write started.
    Skipped,
}

enum Disposition {
    Decided(MergeDecision),
    Rejected,
    Pending(JoinHandle<CommitResult>),
    Failed(DedupeError),
    Skipped,
}

pub struct MergeExecutor {
    repo: Arc<dyn ProductRepository>,
    products: Arc<Vec<NormalizedProduct>>,
    policy: MergePolicy,
    progress: ProgressSink,
    cancel: CancellationFlag,
}

impl MergeExecutor {
    pub fn new(
        repo: Arc<dyn ProductRepository>,
        products: Arc<Vec<NormalizedProduct>>,
        policy: MergePolicy,
        progress: ProgressSink,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            repo,
            products,
            policy,
            progress,
            cancel,
        }
    }

    /// Builds the decision for a cluster, or `ThresholdViolation` when it is
    /// below threshold and `force` is off.
    pub fn decide(&self, cluster: &DuplicateCluster) -> DedupeResult<MergeDecision> {
        let forced = cluster.confidence < self.policy.threshold;
        if forced && !self.policy.force {
            return Err(DedupeError::ThresholdViolation {
                cluster_id: cluster.cluster_id.clone(),
                confidence: cluster.confidence,
                threshold: self.policy.threshold,
            });
        }
        let members: Vec<&NormalizedProduct> = cluster.members.iter().map(|&i| &self.products[i]).collect();
        build_decision(cluster, &members, forced, self.policy.dry_run)
    }

    pub async fn execute(&self, clusters: Vec<DuplicateCluster>) -> MergeOutcome {
        let semaphore = Arc::new(Semaphore::new(self.policy.max_concurrent_merges.max(1)));
        let mut outcome = MergeOutcome::default();
        let mut dispositions: Vec<(DuplicateCluster, Disposition)> = Vec::with_capacity(clusters.len());

        for cluster in clusters {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                dispositions.push((cluster, Disposition::Skipped));
                continue;
            }

            let decision = match self.decide(&cluster) {
                Ok(decision) => decision,
                Err(DedupeError::ThresholdViolation { confidence, threshold, .. }) => {
                    debug!(
                        "Cluster {} withheld: confidence {:.3} < {:.3}",
                        cluster.cluster_id, confidence, threshold
                    );
                    if !self.policy.dry_run {
                        self.record_rejection(&cluster, &mut outcome.warnings).await;
                    }
                    dispositions.push((cluster, Disposition::Rejected));
                    continue;
                }
                Err(e) => {
                    error!("Cluster {} could not be resolved: {}", cluster.cluster_id, e);
                    dispositions.push((cluster, Disposition::Failed(e)));
                    continue;
                }
            };
            if decision.forced {
                info!(
                    "Cluster {} below threshold ({:.3}) merged by force",
                    cluster.cluster_id, cluster.confidence
                );
            }

            if self.policy.dry_run {
                dispositions.push((cluster, Disposition::Decided(decision)));
                continue;
            }

            let handle = self.spawn_commit(Arc::clone(&semaphore), cluster.clone(), decision);
            dispositions.push((cluster, Disposition::Pending(handle)));
        }

        for (mut cluster, disposition) in dispositions {
            match disposition {
                Disposition::Decided(decision) => {
                    self.emit_processed(&cluster);
                    outcome.decisions.push(decision);
                    outcome.clusters.push(cluster);
                }
                Disposition::Rejected => {
                    cluster.status = ClusterStatus::Rejected;
                    self.emit_processed(&cluster);
                    outcome.rejected += 1;
                    outcome.pending_records += cluster.size();
                    outcome.clusters.push(cluster);
                }
                Disposition::Pending(handle) => {
                    let result = handle.await.unwrap_or_else(|e| {
                        CommitResult::Failed(
                            DedupeError::StorageConflict {
                                cluster_id: cluster.cluster_id.clone(),
                                message: format!("merge task aborted: {}", e),
                            },
                            Vec::new(),
                        )
                    });
                    match result {
                        CommitResult::Committed(decision, warnings) => {
                            cluster.status = ClusterStatus::Merged;
                            outcome.warnings.extend(warnings);
                            outcome.decisions.push(decision);
                        }
                        CommitResult::Failed(err, warnings) => {
                            outcome.warnings.extend(warnings);
                            outcome.failures.push(failure_for(&cluster, &err));
                            outcome.pending_records += cluster.size();
                        }
                        CommitResult::Skipped => {
                            outcome.cancelled = true;
                            outcome.skipped.push(cluster);
                            continue;
                        }
                    }
                    self.emit_processed(&cluster);
                    outcome.clusters.push(cluster);
                }
                Disposition::Failed(err) => {
                    outcome.failures.push(failure_for(&cluster, &err));
                    outcome.pending_records += cluster.size();
                    self.emit_processed(&cluster);
                    outcome.clusters.push(cluster);
                }
                Disposition::Skipped => outcome.skipped.push(cluster),
            }
        }

        info!(
            "Merge executor: {} decisions ({} records), {} rejected, {} failed{}",
            outcome.decisions.len(),
            outcome.merged_records(),
            outcome.rejected,
            outcome.failures.len(),
            if self.policy.dry_run { " [dry-run]" } else { "" }
        );
        outcome
    }

    fn spawn_commit(
        &self,
        semaphore: Arc<Semaphore>,
        cluster: DuplicateCluster,
        decision: MergeDecision,
    ) -> JoinHandle<CommitResult> {
        let repo = Arc::clone(&self.repo);
        let products = Arc::clone(&self.products);
        let cancel = self.cancel.clone();
        let retry = self.policy.retry;
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Merge semaphore closed");
                    return CommitResult::Skipped;
                }
            };
            if cancel.is_cancelled() {
                return CommitResult::Skipped;
            }
            let members: Vec<&NormalizedProduct> = cluster.members.iter().map(|&i| &products[i]).collect();
            let mut warnings = Vec::new();
            match commit_with_retry(repo.as_ref(), decision, &members, retry, &mut warnings).await {
                Ok(decision) => CommitResult::Committed(decision, warnings),
                Err(e) => {
                    warn!("Cluster {} failed: {}", cluster.cluster_id, e);
                    CommitResult::Failed(e, warnings)
                }
            }
        })
    }

    async fn record_rejection(&self, cluster: &DuplicateCluster, warnings: &mut Vec<RunWarning>) {
        let group = RejectedGroup {
            cluster_id: cluster.cluster_id.clone(),
            member_ids: cluster.member_ids.clone(),
            confidence: cluster.confidence,
            rejected_at: Utc::now(),
        };
        if let Err(e) = self.repo.record_rejection(&group).await {
            warn!("Failed to record rejection of {}: {}", cluster.cluster_id, e);
            warnings.push(RunWarning::new(
                WarningKind::Rejection,
                Some(cluster.cluster_id.clone()),
                format!("rejection not recorded: {}", e),
            ));
        }
    }

    fn emit_processed(&self, cluster: &DuplicateCluster) {
        self.progress.emit(ProgressEvent::ClusterProcessed {
            cluster_id: cluster.cluster_id.clone(),
            status: cluster.status,
        });
    }
}

fn failure_for(cluster: &DuplicateCluster, err: &DedupeError) -> ClusterFailure {
    ClusterFailure {
        cluster_id: cluster.cluster_id.clone(),
        member_ids: cluster.member_ids.clone(),
        error: err.to_string(),
    }
}

/// Survivor is the canonical member; everyone else is merged into it.
pub fn build_decision(
    cluster: &DuplicateCluster,
    members: &[&NormalizedProduct],
    forced: bool,
    dry_run: bool,
) -> DedupeResult<MergeDecision> {
    let survivor = resolve_canonical(members).ok_or_else(|| DedupeError::StorageConflict {
        cluster_id: cluster.cluster_id.clone(),
        message: "cluster has no members".to_string(),
    })?;
    Ok(MergeDecision {
        cluster_id: cluster.cluster_id.clone(),
        survivor_id: survivor.id.clone(),
        merged_ids: members
            .iter()
            .filter(|p| p.id != survivor.id)
            .map(|p| p.id.clone())
            .collect(),
        canonical_name: survivor.normalized_name.clone(),
        confidence: cluster.confidence,
        dry_run,
        forced,
        executed_at: Utc::now(),
        survivor_update: SurvivorUpdate {
            normalized_name: survivor.normalized_name.clone(),
            unit_token: survivor.unit_token.clone(),
            price_group_token: survivor.price_group_token.clone(),
        },
    })
}

/// Writes a decision. A conflict triggers one reload-and-rebuild followed by
/// a single retry; transient errors back off and retry up to the policy's
/// attempt budget; anything else fails the cluster.
pub async fn commit_with_retry(
    repo: &dyn ProductRepository,
    decision: MergeDecision,
    members: &[&NormalizedProduct],
    retry: RetryPolicy,
    warnings: &mut Vec<RunWarning>,
) -> DedupeResult<MergeDecision> {
    let mut decision = decision;
    let mut conflict_retried = false;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match repo.write_merge(&decision).await {
            Ok(WriteOutcome::Applied) => {
                debug!(
                    "Committed cluster {}: {} <- {:?}",
                    decision.cluster_id, decision.survivor_id, decision.merged_ids
                );
                return Ok(decision);
            }
            Ok(WriteOutcome::Conflict) => {
                if conflict_retried {
                    return Err(DedupeError::StorageConflict {
                        cluster_id: decision.cluster_id.clone(),
                        message: "conflict persisted after reload".to_string(),
                    });
                }
                conflict_retried = true;
                warn!("Conflict on cluster {}, reloading members", decision.cluster_id);
                warnings.push(RunWarning::new(
                    WarningKind::StorageConflict,
                    Some(decision.cluster_id.clone()),
                    "stale records on write; reloaded and retried",
                ));
                decision = rebuild_after_conflict(repo, &decision, members).await?;
                attempt = 0;
            }
            Err(e) if e.is_transient() && retry.should_retry(attempt) => {
                let delay = retry.backoff_for(attempt);
                warn!(
                    "Transient error on cluster {} (attempt {}/{}), retrying in {:?}: {}",
                    decision.cluster_id, attempt, retry.max_attempts, delay, e
                );
                warnings.push(RunWarning::new(
                    WarningKind::StorageRetry,
                    Some(decision.cluster_id.clone()),
                    format!("attempt {} failed: {}", attempt, e),
                ));
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(DedupeError::Storage(e)),
        }
    }
}

/// Drops members that another writer merged in the meantime and re-resolves
/// the survivor among the rest.
async fn rebuild_after_conflict(
    repo: &dyn ProductRepository,
    decision: &MergeDecision,
    members: &[&NormalizedProduct],
) -> DedupeResult<MergeDecision> {
    let current = repo.reload_records(&decision.all_ids()).await?;
    let unmerged: HashMap<&str, bool> = current
        .iter()
        .map(|r| (r.id.as_str(), !r.is_merged()))
        .collect();
    let remaining: Vec<&NormalizedProduct> = members
        .iter()
        .copied()
        .filter(|p| unmerged.get(p.id.as_str()).copied().unwrap_or(false))
        .collect();

    if remaining.len() < 2 {
        return Err(DedupeError::StorageConflict {
            cluster_id: decision.cluster_id.clone(),
            message: format!("only {} member(s) still unmerged after reload", remaining.len()),
        });
    }
    debug!(
        "Cluster {} rebuilt with {} of {} members",
        decision.cluster_id,
        remaining.len(),
        members.len()
    );

    let survivor = resolve_canonical(&remaining).ok_or_else(|| DedupeError::StorageConflict {
        cluster_id: decision.cluster_id.clone(),
        message: "no survivor after reload".to_string(),
    })?;
    Ok(MergeDecision {
        survivor_id: survivor.id.clone(),
        merged_ids: remaining
            .iter()
            .filter(|p| p.id != survivor.id)
            .map(|p| p.id.clone())
            .collect(),
        canonical_name: survivor.normalized_name.clone(),
        executed_at: Utc::now(),
        survivor_update: SurvivorUpdate {
            normalized_name: survivor.normalized_name.clone(),
            unit_token: survivor.unit_token.clone(),
            price_group_token: survivor.price_group_token.clone(),
        },
        ..decision.clone()
    })
}
