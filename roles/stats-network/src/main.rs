use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use hashrate_stats::SqliteStorage;
use stats_network::{
    api,
    args::process_cli_args,
    config::StatsNetworkConfig,
    credentials::{CredentialProvider, LoginTokenProvider, StaticTokenProvider},
    scheduler::start_cycle_scheduler,
    sources::{
        ApoolSource, CachedSource, HashrateSource, HttpFetcher, MinerlabSource, NetworkSource,
        RetryingSource, SolutionsSource,
    },
    AggregationEngine,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = process_cli_args()?;

    // Setup tracing with optional file output
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt().with_env_filter(env_filter);

    if let Some(log_file) = config.log_file() {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| format!("Failed to open log file {}: {}", log_file.display(), e))?;
        fmt_layer
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .init();
    } else {
        fmt_layer.init();
    }

    info!("Starting stats-network service");
    info!("HTTP server: {}", config.server.http_listen_address);
    info!("Database: {}", config.storage.db_path.display());
    info!("Cycle interval: {} seconds", config.schedule.interval_secs);

    let storage = Arc::new(SqliteStorage::new(&config.storage.db_path).await?);
    let http = HttpFetcher::new(config.request_timeout())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let credentials = build_credentials(&config, &http, shutdown_rx.clone());
    let sources = build_sources(&config, &http, credentials);

    let engine = Arc::new(AggregationEngine::new(
        sources,
        storage,
        config.engine_settings(),
    ));

    let http_address = config.server.http_listen_address.clone();
    let engine_for_http = engine.clone();
    let shutdown_for_http = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = api::run_http_server(http_address, engine_for_http, shutdown_for_http).await
        {
            error!("HTTP server error: {}", e);
        }
    });

    let scheduler = tokio::spawn(start_cycle_scheduler(
        engine,
        config.cycle_interval(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for the running cycle to finish");
    let _ = shutdown_tx.send(true);
    scheduler.await?;

    info!("stats-network stopped");
    Ok(())
}

fn build_credentials(
    config: &StatsNetworkConfig,
    http: &HttpFetcher,
    shutdown: watch::Receiver<bool>,
) -> Arc<dyn CredentialProvider> {
    let credentials = &config.credentials;

    if let Some(api_key) = &credentials.api_key {
        info!("Using configured network API key");
        return Arc::new(StaticTokenProvider::new(Some(api_key.clone())));
    }

    match (&credentials.username, &credentials.password) {
        (Some(username), Some(password)) => {
            info!("Using login credentials for the network API");
            let provider = Arc::new(LoginTokenProvider::new(
                http.client().clone(),
                &config.sources.network_base_url,
                username.clone(),
                password.clone(),
                config.retry_policy(),
            ));
            provider
                .clone()
                .spawn_refresh_loop(config.token_refresh_interval(), shutdown);
            provider as Arc<dyn CredentialProvider>
        }
        _ => {
            warn!("No network API credentials configured, requests will be unauthenticated");
            Arc::new(StaticTokenProvider::new(None))
        }
    }
}

fn build_sources(
    config: &StatsNetworkConfig,
    http: &HttpFetcher,
    credentials: Arc<dyn CredentialProvider>,
) -> Vec<Arc<dyn HashrateSource>> {
    let urls = &config.sources;
    let network: Arc<dyn HashrateSource> = Arc::new(NetworkSource::new(
        http.clone(),
        urls.network_base_url.clone(),
        credentials,
    ));
    let apool: Arc<dyn HashrateSource> =
        Arc::new(ApoolSource::new(http.clone(), urls.apool_base_url.clone()));
    let solutions: Arc<dyn HashrateSource> = Arc::new(SolutionsSource::new(
        http.clone(),
        urls.solutions_base_url.clone(),
    ));
    let minerlab: Arc<dyn HashrateSource> = Arc::new(MinerlabSource::new(
        http.clone(),
        urls.minerlab_base_url.clone(),
    ));

    // Retries happen inside the cache so only a final failure reaches the engine
    [network, apool, solutions, minerlab]
        .into_iter()
        .map(|source| {
            let retrying: Arc<dyn HashrateSource> =
                Arc::new(RetryingSource::new(source, config.retry_policy()));
            Arc::new(CachedSource::new(retrying, config.cache_ttl())) as Arc<dyn HashrateSource>
        })
        .collect()
}
