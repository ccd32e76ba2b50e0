use anyhow::Context as _;
use futures::future::{self, Either};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

use groove::clock::{Clock, SystemClock};
use groove::config::Config;
use groove::crypto::Vault;
use groove::reaper::Reaper;
use groove::service::{self, Context, Settings};
use groove::spotify::SurfSpotify;
use groove::store::{CredentialStore, MemoryStore, PgStore};
use groove::LOG;

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn CredentialStore>> {
    if config.db_url == "memory" {
        slog::warn!(LOG, "using in-memory store, nothing will be persisted");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.db_url)
        .await
        .context("error connecting to database")?;
    let store = PgStore::new(pool);
    store.migrate().await.context("error running migrations")?;
    Ok(Arc::new(store))
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> anyhow::Result<()> {
    let mut signals = Signals::new(&[SIGINT, SIGTERM]).context("error installing signal handlers")?;
    let signal = async_std::task::spawn_blocking(move || signals.forever().next()).await;
    slog::info!(LOG, "received shutdown signal"; "signal" => signal);
    Ok(())
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    // try sourcing a .env if one exists
    dotenv::dotenv().ok();
    let config = Config::load()?;
    config.initialize()?;

    let store = connect_store(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let vault = Vault::new(config.enc_key.as_bytes())?;
    let settings = Settings::from_config(&config)?;
    let spotify = Arc::new(SurfSpotify::new(settings.spotify.clone()));
    let ctx = Context::new(store.clone(), clock.clone(), spotify, vault, settings);

    // catalog browsing for unlinked users depends on it
    ctx.tokens()
        .ensure_default_link()
        .await
        .context("default spotify link check failed")?;

    let reaper = Reaper::new(store, clock).start(config.reaper_interval());

    let serve = Box::pin(service::start(ctx, config.listen_addr()));
    let outcome = match future::select(serve, Box::pin(shutdown_signal())).await {
        Either::Left((res, _)) => res,
        Either::Right((res, _)) => res,
    };

    reaper.stop(config.shutdown_grace()).await;
    slog::info!(LOG, "shutdown complete");
    outcome
}
