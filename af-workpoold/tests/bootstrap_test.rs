//! Daemon startup against a real database file

use af_workpool::db::{create_pool, run_migrations};
use af_workpool::test_utils::wait_for_workpool;
use af_workpool::{WorkpoolKind, WorkpoolModel, WorkpoolState};
use af_workpoold::{bootstrap, Config};
use std::path::Path;

fn test_config(db_path: &Path) -> Config {
    Config {
        db_path: db_path.to_path_buf(),
        max_concurrent_operations: 2,
        backend: "simulator".to_string(),
        vc: af_workpool::test_utils::test_vc_config(),
        guest_password: "guest-secret".to_string(),
    }
}

#[tokio::test]
async fn test_bootstrap_restores_stored_workpools() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("workpool.db");
    let config = test_config(&db_path);

    let pool = create_pool(&db_path).await.expect("Failed to open database");
    run_migrations(&pool).await.expect("Failed to migrate");
    let first = bootstrap(&config, pool).await.expect("Failed to bootstrap");
    assert!(first.workpools.list().await.expect("Failed to list").is_empty());

    let handle = first
        .workpools
        .create(WorkpoolModel::new("restored", WorkpoolKind::Custom, 0))
        .await
        .expect("Failed to create workpool");
    wait_for_workpool(&handle, |m| m.state == WorkpoolState::Available).await;

    let pool = create_pool(&db_path).await.expect("Failed to reopen database");
    let second = bootstrap(&config, pool).await.expect("Failed to bootstrap again");
    let names: Vec<String> = second
        .workpools
        .list()
        .await
        .expect("Failed to list")
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(names, vec!["restored".to_string()]);
}

#[tokio::test]
async fn test_bootstrap_rejects_unknown_backend() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("workpool.db");
    let mut config = test_config(&db_path);
    config.backend = "hyperv".to_string();

    let pool = create_pool(&db_path).await.expect("Failed to open database");
    run_migrations(&pool).await.expect("Failed to migrate");
    assert!(bootstrap(&config, pool).await.is_err());
}
