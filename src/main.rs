// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar};
use log::{info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;

use dedupe_lib::diagnostics::{self, CatalogSnapshot};
use dedupe_lib::pipeline::{spawn_normalize_catalog, ProgressEvent, RunOptions};
use dedupe_lib::repository::{InMemoryRepository, PgProductRepository, ProductRepository};
use dedupe_lib::utils::db_connect::{connect, get_pool_status};
use dedupe_lib::utils::engine_config::{EngineConfig, RejectedClusterPolicy};
use dedupe_lib::utils::env::{load_env, load_env_from_file};
use dedupe_lib::utils::get_memory_usage;
use dedupe_lib::utils::progress_config::{add_bar, ProgressConfig};

#[derive(Parser)]
#[command(author, version, about = "Product catalog normalization and deduplication", long_about = None)]
struct Cli {
    /// JSON catalog file; PostgreSQL (POSTGRES_* variables) is used when omitted
    #[arg(long, global = true)]
    catalog_file: Option<PathBuf>,

    /// Env file to load instead of the nearest .env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Find duplicate clusters and merge them (dry-run unless --dry-run false)
    Normalize {
        #[arg(long)]
        dry_run: Option<bool>,
        /// Maximum candidate edges scored and clusters processed
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        threshold: Option<f64>,
        /// Merge clusters below the threshold too
        #[arg(long)]
        force: bool,
        #[arg(long)]
        rejected_policy: Option<RejectedClusterPolicy>,
    },
    /// Rank the records most similar to one product
    Similar {
        product_id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Canonical name of a cluster reported by `groups`
    Canonical {
        cluster_id: String,
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Duplicate groups at a threshold
    Groups {
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Duplicate pairs at a threshold, strongest first
    Duplicates {
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Score two raw names, or two record ids with --by-id
    TestSimilarity {
        a: String,
        b: String,
        #[arg(long)]
        by_id: bool,
    },
}

enum Store {
    File(Arc<InMemoryRepository>, PathBuf),
    Postgres(Arc<PgProductRepository>),
}

impl Store {
    async fn open(catalog_file: Option<&PathBuf>) -> Result<Self> {
        match catalog_file {
            Some(path) => {
                let repo = InMemoryRepository::from_json_file(path)?;
                Ok(Store::File(Arc::new(repo), path.clone()))
            }
            None => {
                let pool = connect().await.context("Failed to connect to database")?;
                let (total, idle, in_use) = get_pool_status(&pool);
                info!(
                    "Successfully connected to the database ({} connections, {} idle, {} in use)",
                    total, idle, in_use
                );
                Ok(Store::Postgres(Arc::new(PgProductRepository::new(pool))))
            }
        }
    }

    fn repo(&self) -> Arc<dyn ProductRepository> {
        match self {
            Store::File(repo, _) => Arc::clone(repo) as Arc<dyn ProductRepository>,
            Store::Postgres(repo) => Arc::clone(repo) as Arc<dyn ProductRepository>,
        }
    }
}

async fn load_snapshot(catalog_file: Option<&PathBuf>, config: &EngineConfig) -> Result<CatalogSnapshot> {
    let store = Store::open(catalog_file).await?;
    Ok(CatalogSnapshot::load(store.repo().as_ref(), config).await?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::init_from_env(env_logger::Env::default().default_filter_or(default_filter));

    match &cli.env_file {
        Some(path) => load_env_from_file(path),
        None => load_env(),
    }
    let config = EngineConfig::from_env();
    let catalog_file = cli.catalog_file.as_ref();

    match cli.command {
        Command::Normalize {
            dry_run,
            limit,
            threshold,
            force,
            rejected_policy,
        } => {
            let mut config = config;
            if let Some(policy) = rejected_policy {
                config.rejected_policy = policy;
            }
            let options = RunOptions {
                dry_run: dry_run.unwrap_or(config.dry_run),
                limit: limit.or(config.limit),
                threshold: threshold.unwrap_or(config.threshold),
                force: force || config.force,
            };
            let store = Store::open(catalog_file).await?;
            run_normalize(&store, config, options).await
        }
        Command::Similar { product_id, limit } => {
            let snapshot = load_snapshot(catalog_file, &config).await?;
            print_json(&diagnostics::get_similar_products(&snapshot, &product_id, limit)?)
        }
        Command::Canonical { cluster_id, threshold } => {
            let snapshot = load_snapshot(catalog_file, &config).await?;
            let name =
                diagnostics::find_canonical_name(&snapshot, &cluster_id, threshold.unwrap_or(config.threshold))?;
            print_json(&serde_json::json!({ "cluster_id": cluster_id, "canonical_name": name }))
        }
        Command::Groups { threshold } => {
            let snapshot = load_snapshot(catalog_file, &config).await?;
            print_json(&diagnostics::get_product_groups(
                &snapshot,
                threshold.unwrap_or(config.threshold),
            )?)
        }
        Command::Duplicates { threshold, limit } => {
            let snapshot = load_snapshot(catalog_file, &config).await?;
            print_json(&diagnostics::find_duplicates(
                &snapshot,
                threshold.unwrap_or(config.threshold),
                limit,
            )?)
        }
        Command::TestSimilarity { a, b, by_id } => {
            let report = if by_id {
                let snapshot = load_snapshot(catalog_file, &config).await?;
                diagnostics::test_similarity_by_id(&snapshot, &a, &b)?
            } else {
                diagnostics::test_similarity(&a, &b)?
            };
            print_json(&report)
        }
    }
}

async fn run_normalize(store: &Store, config: EngineConfig, options: RunOptions) -> Result<()> {
    let start_time = Instant::now();
    let progress_config = ProgressConfig::from_env();
    let (handle, events, cancel) = spawn_normalize_catalog(store.repo(), config, options);

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run (committed clusters stay committed)");
            ctrl_c_cancel.cancel();
        }
    });

    let progress_task = tokio::spawn(render_progress(events, progress_config));
    let response = handle.await.context("Normalization task panicked")?;
    if let Err(e) = progress_task.await {
        warn!("Progress display failed: {}", e);
    }

    if let Store::File(repo, path) = store {
        if !options.dry_run && response.report.is_some() {
            repo.save_json_file(path)
                .await
                .with_context(|| format!("Failed to write catalog back to {}", path.display()))?;
            info!("Catalog written back to {}", path.display());
        }
    }

    info!(
        "Normalization completed in {:.2?}: {}",
        start_time.elapsed(),
        response.message
    );
    print_json(&response)?;
    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn render_progress(mut events: UnboundedReceiver<ProgressEvent>, config: ProgressConfig) {
    let multi: Option<MultiProgress> = config.create_multi_progress();
    let mut scoring: Option<ProgressBar> = None;
    let mut merging: Option<ProgressBar> = None;

    while let Some(event) = events.recv().await {
        match event {
            ProgressEvent::Loaded { total, already_merged } => {
                info!("📦 Loaded {} records ({} already merged)", total, already_merged);
            }
            ProgressEvent::Normalized { normalized, failed } => {
                info!("🧹 Normalized {} records ({} skipped)", normalized, failed);
            }
            ProgressEvent::BlocksIndexed {
                blocks,
                skipped,
                planned_pairs,
            } => {
                info!(
                    "🧱 {} blocks ({} oversized skipped), {} pairs to score",
                    blocks, skipped, planned_pairs
                );
                if let Some(mp) = &multi {
                    let pb = add_bar(mp, planned_pairs as u64, "");
                    pb.set_message("Scoring pairs");
                    scoring = Some(pb);
                }
            }
            ProgressEvent::BlockScored { block_key, edges } => {
                if let Some(pb) = &scoring {
                    pb.inc(edges as u64);
                    if config.should_show_detailed() {
                        pb.set_message(format!("Scoring {}", block_key));
                    }
                }
            }
            ProgressEvent::ClustersBuilt { clusters } => {
                if let Some(pb) = scoring.take() {
                    pb.finish_with_message("Scoring complete");
                }
                let mut message = format!("🔗 {} duplicate clusters", clusters);
                if config.should_show_memory() {
                    message.push_str(&format!(" (memory: {} MB)", get_memory_usage().await));
                }
                info!("{}", message);
                if let Some(mp) = &multi {
                    let pb = add_bar(mp, clusters as u64, "  ");
                    pb.set_message("Merging clusters");
                    merging = Some(pb);
                }
            }
            ProgressEvent::ClusterProcessed { cluster_id, status } => {
                if let Some(pb) = &merging {
                    pb.inc(1);
                    if config.should_show_detailed() {
                        pb.set_message(format!("{} {:?}", cluster_id, status));
                    }
                }
            }
            ProgressEvent::Finished { success } => {
                for pb in [scoring.take(), merging.take()].into_iter().flatten() {
                    pb.finish_with_message(if success { "Done" } else { "Finished with failures" });
                }
            }
        }
    }
}
