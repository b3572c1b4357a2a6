//! Workpool daemon wiring.

pub mod config;

pub use config::{BackendKind, Config};

use af_workpool::simulator::Simulator;
use af_workpool::{Dispatcher, Repository, Services, VmImageManager, WorkpoolManager};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

/// Running managers over a migrated database.
pub struct Daemon {
    pub images: VmImageManager,
    pub workpools: WorkpoolManager,
}

fn build_services(config: &Config, pool: SqlitePool) -> anyhow::Result<Services> {
    let (vc, provisioner) = match config.backend_kind()? {
        BackendKind::Simulator => {
            let simulator = Simulator::new(config.vc.clone());
            let vc: Arc<dyn af_workpool::VcManager> = Arc::new(simulator.clone());
            let provisioner: Arc<dyn af_workpool::Provisioner> = Arc::new(simulator);
            (vc, provisioner)
        }
    };

    Ok(Services {
        repository: Repository::new(pool),
        vc,
        provisioner,
        dispatcher: Dispatcher::new(config.max_concurrent_operations),
        guest_password: config.guest_password.clone(),
    })
}

/// Rehydrate images, then pools, from the database.
pub async fn bootstrap(config: &Config, pool: SqlitePool) -> anyhow::Result<Daemon> {
    let services = build_services(config, pool)?;

    let images = VmImageManager::new(services.clone());
    let image_count = images.initialize().await?;
    let workpools = WorkpoolManager::new(services, images.clone());
    let workpool_count = workpools.initialize().await?;
    info!(
        "Started {} VM images and {} workpools",
        image_count, workpool_count
    );

    Ok(Daemon { images, workpools })
}
