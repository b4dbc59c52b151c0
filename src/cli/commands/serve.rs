use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::cache::{LatestCache, MemoryCache, NoopCache};
use crate::cli::config::Config;
use crate::cli::ServeArgs;
use crate::native::build_router;
use crate::store::{MeasurementStore, SqliteBackend};

pub async fn execute_serve(config: Config, args: ServeArgs) -> Result<()> {
    let listen = args.listen.unwrap_or(config.listen_addr);
    let database = args.database.unwrap_or(config.database_path);

    if let Some(parent) = database.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let backend = SqliteBackend::open(&database, config.page_limit)
        .with_context(|| format!("Failed to open database {}", database.display()))?;
    let cache: Arc<dyn LatestCache> = if config.cache && !args.no_cache {
        Arc::new(MemoryCache::new())
    } else {
        Arc::new(NoopCache)
    };
    let store = Arc::new(MeasurementStore::new(Arc::new(backend), cache));

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(addr = %listen, database = %database.display(), "receiver listening");

    axum::serve(listener, build_router(store))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
