// src/pipeline/mod.rs
pub mod orchestrator;
pub mod progress;

use log::error;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use crate::models::stats_models::{CatalogStats, NormalizeCatalogResponse};
use crate::repository::ProductRepository;
use crate::utils::engine_config::EngineConfig;

pub use orchestrator::{load_catalog, load_rejected_groups, run_normalization};
pub use progress::{CancellationFlag, ProgressEvent, ProgressSink};
pub use crate::utils::engine_config::RunOptions;

/// Normalizes the catalog behind `repo` with `options` layered over `config`.
/// Never fails: a run that could not start comes back with `success == false`.
pub async fn normalize_catalog(
    repo: Arc<dyn ProductRepository>,
    config: &EngineConfig,
    options: RunOptions,
) -> NormalizeCatalogResponse {
    run_to_response(repo, config.clone().with_run_options(&options), ProgressSink::disabled(), CancellationFlag::new())
        .await
}

/// Starts a run in the background. Progress events arrive on the returned
/// receiver; cancelling the flag stops scoring and any merge not yet started.
pub fn spawn_normalize_catalog(
    repo: Arc<dyn ProductRepository>,
    config: EngineConfig,
    options: RunOptions,
) -> (
    JoinHandle<NormalizeCatalogResponse>,
    UnboundedReceiver<ProgressEvent>,
    CancellationFlag,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationFlag::new();
    let config = config.with_run_options(&options);
    let handle = tokio::spawn(run_to_response(repo, config, ProgressSink::new(tx), cancel.clone()));
    (handle, rx, cancel)
}

async fn run_to_response(
    repo: Arc<dyn ProductRepository>,
    config: EngineConfig,
    progress: ProgressSink,
    cancel: CancellationFlag,
) -> NormalizeCatalogResponse {
    match run_normalization(repo, &config, progress.clone(), cancel).await {
        Ok(report) => NormalizeCatalogResponse {
            success: report.success,
            message: report.message.clone(),
            stats: CatalogStats::from(&report.stats),
            report: Some(report),
        },
        Err(e) => {
            error!("Normalization run aborted: {}", e);
            progress.emit(ProgressEvent::Finished { success: false });
            NormalizeCatalogResponse {
                success: false,
                message: e.to_string(),
                stats: CatalogStats::default(),
                report: None,
            }
        }
    }
}
