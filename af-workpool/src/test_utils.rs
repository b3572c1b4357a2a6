//! Helpers shared by this crate's tests and by crates that test against it.

use crate::backend::Services;
use crate::dispatch::Dispatcher;
use crate::model::{VcConfig, VmLocation, WorkpoolModel};
use crate::repository::Repository;
use crate::simulator::Simulator;
use crate::workpool::WorkpoolHandle;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // A single connection keeps every query on the same in-memory database.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

pub fn test_vc_config() -> VcConfig {
    VcConfig {
        host: "vc.example.test".to_string(),
        datacenter: "dc1".to_string(),
        username: "administrator".to_string(),
        password: "secret".to_string(),
        vm_location: VmLocation {
            compute_resource: "cluster".to_string(),
            datastore_name: "datastore1".to_string(),
            resource_pool: "pool".to_string(),
        },
    }
}

/// Services over a fresh database and a simulator, which is returned for
/// steering the test.
pub async fn test_services() -> (Services, Simulator) {
    let simulator = Simulator::new(test_vc_config());
    let services = Services {
        repository: Repository::new(create_test_db().await),
        vc: Arc::new(simulator.clone()),
        provisioner: Arc::new(simulator.clone()),
        dispatcher: Dispatcher::new(4),
        guest_password: "guest-secret".to_string(),
    };
    (services, simulator)
}

/// Poll until `check` accepts the workpool model, failing after five seconds.
pub async fn wait_for_workpool(
    handle: &WorkpoolHandle,
    check: impl Fn(&WorkpoolModel) -> bool,
) -> WorkpoolModel {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let model = handle.model().await.expect("Workpool stopped");
        if check(&model) {
            return model;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Timed out waiting on workpool, last seen: {:?}",
            model
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `check` holds, failing after five seconds.
pub async fn wait_until(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "Timed out waiting");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn test_pattern() -> crate::model::VmPattern {
    use crate::model::{OsInfo, OsRegistration, OsType, VmPattern};

    VmPattern {
        os_info: OsInfo {
            os_type: OsType::Win7,
            variant: "enterprise".to_string(),
        },
        os_registration: OsRegistration {
            user_name: "packager".to_string(),
            organization: "Example Corp".to_string(),
            product_key: String::new(),
        },
        iso_path: "[datastore1] iso/win7.iso".to_string(),
        network_name: "VM Network".to_string(),
    }
}
