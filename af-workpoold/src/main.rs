use af_workpool::db::{backup_database, create_pool, run_migrations};
use af_workpoold::{bootstrap, Config};
use anyhow::Result;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = af_logging::init_from_env();

    info!("Starting af-workpoold...");

    let config = Config::from_env();
    info!(
        "Configuration loaded: db_path={}, backend={}, max_concurrent_operations={}",
        config.db_path.display(),
        config.backend,
        config.max_concurrent_operations
    );

    if let Some(backup_path) = backup_database(&config.db_path)? {
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(&config.db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let daemon = bootstrap(&config, pool.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let pools = daemon.workpools.list().await?;
    info!("{} workpools were running", pools.len());
    pool.close().await;

    Ok(())
}
