use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use ranklab::config::Config;
use ranklab::credentials::CredentialVault;
use ranklab::dispatcher::{CancelHub, Dispatcher};
use ranklab::evaluator::http::{HttpEvaluator, ItemBank};
use ranklab::plan::SubjectTaxonomy;
use ranklab::queue::InMemoryQueue;
use ranklab::server::{self, AppState};
use ranklab::store::Store;
use ranklab::store::cache::CacheIndex;
use ranklab::store::samples::SampleStore;
use ranklab::store::tasks::TaskRegistry;
use ranklab::worker::{WorkerContext, spawn_workers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("ranklab starting");

    let config = Config::from_env();

    let store = Store::open(&config.db_path)
        .map_err(|e| anyhow::anyhow!("failed to open store at {:?}: {e}", config.db_path))?;
    let registry = TaskRegistry::new(store.clone());
    let samples = SampleStore::new(store.clone());
    let cache = CacheIndex::new(store.clone(), config.cache_ttl, config.min_evaluator_version);

    let queue = Arc::new(InMemoryQueue::new(config.lease_ttl));
    let vault = Arc::new(CredentialVault::new(config.credential_envelope_ttl)?);
    let cancels = Arc::new(CancelHub::new());

    let bank = match env::var("RANKLAB_ITEM_BANK") {
        Ok(path) => match ItemBank::from_json_file(&PathBuf::from(&path)) {
            Ok(bank) => {
                tracing::info!(items = bank.len(), path = path, "item bank loaded");
                bank
            }
            Err(e) => {
                tracing::warn!("item bank unusable ({e}) — evaluator will be unavailable");
                ItemBank::default()
            }
        },
        Err(_) => {
            tracing::warn!("RANKLAB_ITEM_BANK not set — evaluator will be unavailable");
            ItemBank::default()
        }
    };
    let evaluator = Arc::new(HttpEvaluator::new(bank));

    let dispatcher = Dispatcher::new(
        &config,
        SubjectTaxonomy::default(),
        registry.clone(),
        cache.clone(),
        queue.clone(),
        vault.clone(),
        cancels.clone(),
    );

    let shutdown = CancellationToken::new();
    let worker_ctx = Arc::new(WorkerContext {
        registry: registry.clone(),
        samples,
        cache: cache.clone(),
        queue: queue.clone(),
        vault,
        evaluator: evaluator.clone(),
        cancels,
        config: config.clone(),
    });
    let workers = spawn_workers(worker_ctx, shutdown.clone());
    tracing::info!(count = workers.len(), "workers started");

    let state = Arc::new(AppState {
        dispatcher,
        registry,
        cache,
        store,
        queue,
        evaluator,
        config: config.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    shutdown.cancel();
    for handle in workers {
        let _ = handle.await;
    }

    tracing::info!("ranklab shutting down");
    Ok(())
}
