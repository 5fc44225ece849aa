//! Entry point for the debrid resolver service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use debrid_core::cache::{DurableTier, MemoryTier};
use debrid_core::cli::Args;
use debrid_core::config::{ResolverConfig, load_file_config};
use debrid_core::debrid::{AdapterContext, ProviderKey, build_provider_http_client};
use debrid_core::repository::{InMemoryTorrentRepository, SqliteTorrentRepository, TorrentRepository};
use debrid_core::server::{self, ResolverState};
use debrid_core::{
    CredentialBlacklist, Database, KnownCached, MagnetBuilder, Orchestrator, TwoTierCache,
    build_default_provider_registry,
};
use tracing::{debug, info, warn};

const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.default_log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let file_config = load_file_config(args.config.as_deref())?;
    let config = ResolverConfig::from_sources(&args, file_config.as_ref())?;
    info!(listen = %config.listen, host = %config.host, "debrid resolver starting");

    let cache = build_cache(&config).await?;
    let repository = build_repository(&config).await?;
    let magnets = Arc::new(MagnetBuilder::new(repository));

    let context = AdapterContext {
        http: config.provider_http(),
        known_cached: KnownCached::new(cache.clone()),
        magnets: Arc::clone(&magnets),
    };
    let registry = build_default_provider_registry(&context);

    match build_provider_http_client(ProviderKey::RealDebrid, &context.http) {
        Ok(client) => {
            let url = config.best_trackers_url.clone();
            tokio::spawn(async move { magnets.bootstrap_best_trackers(&client, &url).await });
        }
        Err(error) => warn!(error = %error, "skipping best trackers bootstrap"),
    }

    if cache.is_enabled() {
        let purge_cache = cache.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_PURGE_INTERVAL);
            loop {
                interval.tick().await;
                purge_cache.purge_expired().await;
            }
        });
    }

    let orchestrator = Orchestrator::new(
        registry,
        cache,
        CredentialBlacklist::new(),
        config.orchestrator(),
    );
    let state = ResolverState {
        orchestrator,
        host: config.host.clone(),
    };
    let router = server::router(state, config.videos_dir.clone());
    server::serve(router, config.listen).await
}

async fn build_cache(config: &ResolverConfig) -> Result<TwoTierCache> {
    let Some(path) = config.cache_db.as_deref() else {
        info!("no durable cache configured; results are not memoized");
        return Ok(TwoTierCache::disabled());
    };
    let db = Database::new(path)
        .await
        .with_context(|| format!("Cannot open cache database '{}'", path.display()))?;
    debug!(path = %path.display(), "durable cache ready");
    Ok(TwoTierCache::new(
        MemoryTier::new(config.memory_cache_capacity),
        DurableTier::new(db),
    ))
}

async fn build_repository(config: &ResolverConfig) -> Result<Arc<dyn TorrentRepository>> {
    match config.catalog_db.as_deref() {
        Some(path) => {
            let repository = SqliteTorrentRepository::open(path)
                .await
                .with_context(|| format!("Cannot open torrent catalog '{}'", path.display()))?;
            Ok(Arc::new(repository))
        }
        None => {
            debug!("no torrent catalog configured; magnets carry no trackers");
            Ok(Arc::new(InMemoryTorrentRepository::new()))
        }
    }
}
