use std::sync::Arc;

use bbb_core::config::EngineConfig;
use bbb_core::crawler::{Crawler, NullCrawler};
use bbb_core::store::JobStore;
use bbb_core::store_memory::MemoryStore;
use bbb_core::Engine;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let database_url = parse_database_url();
    let config = EngineConfig::from_env();

    let store: Arc<dyn JobStore> = match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("connecting to PostgreSQL");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = bbb_core::store_postgres::PostgresJobStore::new(pool);
            pg.migrate().await?;
            tracing::info!("using PostgresJobStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "--database-url / DATABASE_URL set but postgres feature not enabled, using MemoryStore"
            );
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("using MemoryStore (no database URL configured)");
            Arc::new(MemoryStore::new())
        }
    };

    // No production Crawler implementation ships in this workspace (the
    // HTTP transport and its headers/user-agent policy are out of scope);
    // NullCrawler stands in so the engine is runnable end to end in the
    // absence of one.
    let crawler: Arc<dyn Crawler> = Arc::new(NullCrawler::new());

    let engine = Arc::new(Engine::new(store, crawler, config));

    engine.start().await;
    tracing::info!("blue banded bee engine running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining");
    engine.stop().await;

    Ok(())
}

/// Parse database URL from `--database-url <url>` CLI arg or `DATABASE_URL` env var.
fn parse_database_url() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = args
        .windows(2)
        .find(|w| w[0] == "--database-url")
        .map(|w| w[1].clone())
    {
        return Some(url);
    }
    std::env::var("DATABASE_URL").ok()
}
