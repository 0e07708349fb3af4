//! Image Cache Proxy
//!
//! Hosts the persistent image cache behind a small local HTTP API so UI
//! code can resolve remote image URLs to cached bytes.

mod error;
mod server;
mod types;

use crate::error::Result;
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ProxyConfig;
use image_cache::{CacheConfig, CacheManager};
use image_fetcher::HttpTransport;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("image_cache=info".parse()?)
        .add_directive("image_cache_proxy=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting image cache proxy...");

    let config = load_config();
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache.cache_dir);
    info!("State dir: {:?}", config.cache.state_dir);
    info!(
        "Max cache size: {} MB, max entries: {}",
        config.cache.max_size / (1024 * 1024),
        config.cache.max_entries
    );
    info!("Max age: {} seconds", config.cache.max_age.as_secs());

    let transport = HttpTransport::with_timeout(Duration::from_secs(config.fetch_timeout_secs))?;
    let cache = CacheManager::new(config.cache, Arc::new(transport));
    if let Err(e) = cache.initialize().await {
        warn!(error = %e, "Image cache failed to initialize; serving with an empty index");
    }

    let state: SharedState = Arc::new(ServerState::new(cache));

    start_server(state, config.port).await?;

    Ok(())
}

fn load_config() -> ProxyConfig {
    let defaults = ProxyConfig::default();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(defaults.port);

    let fetch_timeout_secs = std::env::var("FETCH_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(defaults.fetch_timeout_secs);

    ProxyConfig {
        port,
        fetch_timeout_secs,
        cache: CacheConfig::from_env(),
    }
}
