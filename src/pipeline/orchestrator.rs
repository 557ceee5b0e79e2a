// src/pipeline/orchestrator.rs
// One normalization run: load, normalize, block, score, cluster, merge, report.

use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::blocking::BlockingIndex;
use crate::candidate_generation::{plan_candidate_pairs, stream_candidate_edges, RejectionIndex};
use crate::clustering::ClusterBuilder;
use crate::errors::DedupeResult;
use crate::merging::{MergeExecutor, MergePolicy, RetryPolicy};
use crate::models::cluster::RejectedGroup;
use crate::models::product::ProductRecord;
use crate::models::stats_models::{Report, RunStats, RunWarning, WarningKind};
use crate::normalization::normalize_records;
use crate::pipeline::progress::{CancellationFlag, ProgressEvent, ProgressSink};
use crate::repository::ProductRepository;
use crate::utils::engine_config::{EngineConfig, RejectedClusterPolicy};

/// Reads the whole catalog page by page; a short page ends the scan.
/// Transient read errors are retried under `retry`.
pub async fn load_catalog(
    repo: &dyn ProductRepository,
    batch_size: usize,
    retry: RetryPolicy,
    warnings: &mut Vec<RunWarning>,
) -> DedupeResult<Vec<ProductRecord>> {
    let mut records = Vec::new();
    let mut offset = 0;
    loop {
        let mut attempt: u32 = 0;
        let page = loop {
            attempt += 1;
            match repo.read_batch(offset, batch_size).await {
                Ok(page) => break page,
                Err(e) if e.is_transient() && retry.should_retry(attempt) => {
                    warn!("Read at offset {} failed (attempt {}): {}", offset, attempt, e);
                    warnings.push(RunWarning::new(
                        WarningKind::StorageRetry,
                        None,
                        format!("read at offset {} retried: {}", offset, e),
                    ));
                    tokio::time::sleep(retry.backoff_for(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        let len = page.len();
        records.extend(page);
        debug!("Loaded {} records (offset {})", len, offset);
        if len < batch_size {
            break;
        }
        offset += len;
    }
    Ok(records)
}

/// Groups withheld by earlier runs, when the policy excludes them. A store
/// that cannot supply them downgrades the run to re-evaluation.
pub async fn load_rejected_groups(
    repo: &dyn ProductRepository,
    config: &EngineConfig,
    warnings: &mut Vec<RunWarning>,
) -> Vec<RejectedGroup> {
    if config.rejected_policy != RejectedClusterPolicy::Exclude {
        return Vec::new();
    }
    match repo.load_rejections().await {
        Ok(groups) => {
            debug!("Loaded {} rejected groups", groups.len());
            groups
        }
        Err(e) => {
            warn!("Could not load rejected groups, re-evaluating them: {}", e);
            warnings.push(RunWarning::new(
                WarningKind::Rejection,
                None,
                format!("rejected groups unavailable: {}", e),
            ));
            Vec::new()
        }
    }
}

/// Runs the engine against `repo`. Only configuration problems and a failed
/// catalog load return `Err`; everything else ends up in the report.
pub async fn run_normalization(
    repo: Arc<dyn ProductRepository>,
    config: &EngineConfig,
    progress: ProgressSink,
    cancel: CancellationFlag,
) -> DedupeResult<Report> {
    config.validate()?;
    let start = Instant::now();
    let run_id = Uuid::new_v4().to_string();
    info!("Starting normalization run {}", run_id);
    config.log_config();

    let mut stats = RunStats::default();
    let mut warnings: Vec<RunWarning> = Vec::new();

    // Phase 1: load and drop records already merged by earlier runs
    let records = load_catalog(repo.as_ref(), config.read_batch_size, config.retry_policy(), &mut warnings).await?;
    stats.total = records.len();
    let active: Vec<ProductRecord> = records.into_iter().filter(|r| !r.is_merged()).collect();
    stats.already_merged = stats.total - active.len();
    info!(
        "Loaded {} records ({} already merged)",
        stats.total, stats.already_merged
    );
    progress.emit(ProgressEvent::Loaded {
        total: stats.total,
        already_merged: stats.already_merged,
    });

    // Phase 2: normalization
    let outcome = normalize_records(&active);
    stats.normalization_failures = outcome.failures.len();
    warnings.extend(outcome.failures.iter().map(RunWarning::from));
    let products = Arc::new(outcome.products);
    progress.emit(ProgressEvent::Normalized {
        normalized: products.len(),
        failed: stats.normalization_failures,
    });

    // Phase 3: blocking and pair planning
    let rejected = load_rejected_groups(repo.as_ref(), config, &mut warnings).await;
    let exclusions = RejectionIndex::build(&rejected, &products);
    let index = BlockingIndex::build(&products, config.max_block_size);
    warnings.extend(index.warnings());
    let plan = plan_candidate_pairs(&index, config.limit, &exclusions);
    stats.blocks = index.block_count();
    stats.skipped_blocks = index.skipped_blocks().len();
    stats.candidate_pairs = plan.total_pairs;
    progress.emit(ProgressEvent::BlocksIndexed {
        blocks: stats.blocks,
        skipped: stats.skipped_blocks,
        planned_pairs: plan.planned_pairs,
    });

    // Phase 4: parallel scoring feeding the single cluster builder
    let mut builder = ClusterBuilder::new(products.len(), config.threshold);
    let (mut rx, handles) =
        stream_candidate_edges(Arc::clone(&products), plan, config.max_workers, cancel.clone());
    while let Some(batch) = rx.recv().await {
        stats.edges_scored += batch.edges.len();
        builder.add_edges(&batch.edges);
        warnings.extend(batch.warnings);
        progress.emit(ProgressEvent::BlockScored {
            block_key: batch.block_key,
            edges: batch.edges.len(),
        });
    }
    for result in join_all(handles).await {
        if let Err(e) = result {
            warn!("Scoring worker failed: {}", e);
            warnings.push(RunWarning::new(WarningKind::Run, None, format!("scoring worker failed: {}", e)));
        }
    }
    debug!(
        "Scored {} edges, {} at or above threshold",
        stats.edges_scored,
        builder.qualifying_edges()
    );

    // Phase 5: clusters
    let mut clusters = builder.build(&products);
    stats.clusters_found = clusters.len();
    progress.emit(ProgressEvent::ClustersBuilt {
        clusters: stats.clusters_found,
    });

    let mut cancelled = cancel.is_cancelled();
    let mut report_clusters = Vec::new();
    let mut decisions = Vec::new();
    let mut failures = Vec::new();

    // Phase 6: merge (skipped entirely if scoring was cancelled)
    if cancelled {
        info!("Run {} cancelled during scoring; no merges attempted", run_id);
        report_clusters = clusters;
    } else {
        let beyond_limit = match config.limit {
            Some(limit) if clusters.len() > limit => clusters.split_off(limit),
            _ => Vec::new(),
        };
        let executor = MergeExecutor::new(
            Arc::clone(&repo),
            Arc::clone(&products),
            MergePolicy {
                threshold: config.threshold,
                force: config.force,
                dry_run: config.dry_run,
                max_concurrent_merges: config.max_concurrent_merges,
                retry: config.retry_policy(),
            },
            progress.clone(),
            cancel.clone(),
        );
        let merged = executor.execute(clusters).await;

        stats.clusters_processed = merged.clusters.len();
        stats.rejected_clusters = merged.rejected;
        stats.failed_clusters = merged.failures.len();
        stats.merged_clusters = merged.decisions.len();
        stats.normalized = merged.merged_records();
        stats.pending = merged.pending_records;
        cancelled |= merged.cancelled;

        warnings.extend(merged.warnings);
        report_clusters.extend(merged.clusters);
        report_clusters.extend(merged.skipped);
        report_clusters.extend(beyond_limit);
        decisions = merged.decisions;
        failures = merged.failures;
    }

    stats.processing_time = start.elapsed().as_secs_f64();
    let success = failures.is_empty() && !cancelled;
    let message = run_message(&stats, config.dry_run, cancelled);
    info!("Run {} finished in {:.2}s: {}", run_id, stats.processing_time, message);
    progress.emit(ProgressEvent::Finished { success });

    Ok(Report {
        run_id,
        success,
        message,
        dry_run: config.dry_run,
        force: config.force,
        threshold: config.threshold,
        limit: config.limit,
        cancelled,
        stats,
        clusters: report_clusters,
        decisions,
        failures,
        warnings,
    })
}

fn run_message(stats: &RunStats, dry_run: bool, cancelled: bool) -> String {
    let mut message = format!(
        "{} records scanned, {} {} into {} clusters, {} pending",
        stats.total,
        stats.normalized,
        if dry_run { "would be merged" } else { "merged" },
        stats.merged_clusters,
        stats.pending
    );
    if stats.failed_clusters > 0 {
        message.push_str(&format!(", {} clusters failed", stats.failed_clusters));
    }
    if cancelled {
        message.push_str(" (cancelled)");
    }
    message
}
