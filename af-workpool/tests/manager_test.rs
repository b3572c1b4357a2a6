//! Integration tests for the workpool and VM image registries

use af_workpool::model::{OsInfo, OsRegistration, OsType};
use af_workpool::test_utils::{test_pattern, test_services, wait_for_workpool, wait_until};
use af_workpool::{
    DeleteMethod, InstanceModel, VmImageManager, VmImageModel, WorkpoolError, WorkpoolKind,
    WorkpoolManager, WorkpoolModel, WorkpoolState,
};
use std::time::Duration;

fn xp() -> OsInfo {
    OsInfo {
        os_type: OsType::WinXpPro,
        variant: String::new(),
    }
}

#[tokio::test]
async fn test_duplicate_workpool_name_is_rejected() {
    let (services, _simulator) = test_services().await;
    let images = VmImageManager::new(services.clone());
    let workpools = WorkpoolManager::new(services, images);

    workpools
        .create(WorkpoolModel::new("builders", WorkpoolKind::Custom, 0))
        .await
        .expect("Failed to create workpool");

    let result = workpools
        .create(WorkpoolModel::new("builders", WorkpoolKind::Custom, 0))
        .await;
    match result {
        Err(WorkpoolError::InvalidInput(message)) => {
            assert_eq!(message, "The given name is already in use.")
        }
        other => panic!("Expected a name clash, got {:?}", other.map(|h| h.id().to_string())),
    }
    assert_eq!(workpools.list().await.expect("Failed to list").len(), 1);
}

#[tokio::test]
async fn test_duplicate_image_name_is_rejected() {
    let (services, simulator) = test_services().await;
    let images = VmImageManager::new(services);
    let moid = simulator.add_vm("golden");

    images
        .create(VmImageModel::imported("golden", &moid, xp(), OsRegistration::default()))
        .await
        .expect("Failed to create image");

    let result = images
        .create(VmImageModel::imported("golden", &moid, xp(), OsRegistration::default()))
        .await;
    assert!(matches!(result, Err(WorkpoolError::InvalidInput(_))));

    let unnamed = images
        .create(VmImageModel::installed("  ", test_pattern()))
        .await;
    assert!(matches!(unnamed, Err(WorkpoolError::InvalidInput(_))));
}

#[tokio::test]
async fn test_invalid_workpool_requests_are_rejected() {
    let (services, _simulator) = test_services().await;
    let images = VmImageManager::new(services.clone());
    let workpools = WorkpoolManager::new(services.clone(), images);

    let negative = workpools
        .create(WorkpoolModel::new("negative", WorkpoolKind::Custom, -1))
        .await;
    assert!(matches!(negative, Err(WorkpoolError::InvalidInput(_))));

    let orphan = workpools
        .create(WorkpoolModel::new(
            "orphan",
            WorkpoolKind::Clone {
                vm_image_id: "no-such-image".to_string(),
            },
            1,
        ))
        .await;
    assert!(matches!(orphan, Err(WorkpoolError::NotFound(_))));

    let stored = services
        .repository
        .find_all_workpools()
        .await
        .expect("Failed to list");
    assert!(stored.is_empty());
}

#[tokio::test]
async fn test_initialize_restores_stored_workpools() {
    let (services, simulator) = test_services().await;
    let moid = simulator.add_vm("golden");
    {
        let images = VmImageManager::new(services.clone());
        let workpools = WorkpoolManager::new(services.clone(), images.clone());
        images
            .create(VmImageModel::imported("golden", &moid, xp(), OsRegistration::default()))
            .await
            .expect("Failed to create image");
        let pool = workpools
            .create(WorkpoolModel::new("builders", WorkpoolKind::Custom, 0))
            .await
            .expect("Failed to create workpool");
        wait_for_workpool(&pool, |m| m.state == WorkpoolState::Available).await;
    }

    let images = VmImageManager::new(services.clone());
    let workpools = WorkpoolManager::new(services, images.clone());
    assert_eq!(images.initialize().await.expect("Failed to load images"), 1);
    assert_eq!(workpools.initialize().await.expect("Failed to load workpools"), 1);

    let restored = workpools
        .find_by_name("builders")
        .await
        .expect("Failed to query")
        .expect("Workpool was not restored");
    let model = wait_for_workpool(&restored, |m| m.state == WorkpoolState::Available).await;
    assert_eq!(model.kind, WorkpoolKind::Custom);
    assert!(images
        .find_by_name("golden")
        .await
        .expect("Failed to query")
        .is_some());
}

#[tokio::test]
async fn test_deleted_workpool_leaves_the_registry() {
    let (services, _simulator) = test_services().await;
    let images = VmImageManager::new(services.clone());
    let workpools = WorkpoolManager::new(services, images);

    let pool = workpools
        .create(WorkpoolModel::new("short-lived", WorkpoolKind::Custom, 0))
        .await
        .expect("Failed to create workpool");
    wait_for_workpool(&pool, |m| m.state == WorkpoolState::Available).await;
    let id = pool.id().to_string();

    workpools
        .delete(&id, DeleteMethod::DeleteFromDisk)
        .await
        .expect("Failed to delete workpool");

    let registry = workpools.clone();
    wait_until(move || registry.get(&id).is_none()).await;
    assert!(workpools.list().await.expect("Failed to list").is_empty());

    let missing = workpools.delete("gone", DeleteMethod::DeleteFromDisk).await;
    assert!(matches!(missing, Err(WorkpoolError::NotFound(_))));
}

#[tokio::test]
async fn test_reset_resets_available_workpools() {
    let (services, simulator) = test_services().await;
    let images = VmImageManager::new(services.clone());
    let workpools = WorkpoolManager::new(services, images);

    let pool = workpools
        .create(WorkpoolModel::new("builders", WorkpoolKind::Custom, 0))
        .await
        .expect("Failed to create workpool");
    wait_for_workpool(&pool, |m| m.state == WorkpoolState::Available).await;
    let moid = simulator.add_vm("hand-made");
    pool.add_instance(InstanceModel::existing(&moid, "builder", "pw", true))
        .await
        .expect("Failed to add instance");

    tokio::time::timeout(Duration::from_secs(5), pool.acquire())
        .await
        .expect("Timed out acquiring a lease")
        .expect("Failed to acquire a lease");

    workpools.reset().await.expect("Failed to reset workpools");

    let model = wait_for_workpool(&pool, |m| {
        m.state == WorkpoolState::Available && m.leases.is_empty()
    })
    .await;
    assert_eq!(model.instances.len(), 1);
    assert_eq!(simulator.power_offs(), 1);
}
