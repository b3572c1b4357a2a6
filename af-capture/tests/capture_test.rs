//! Integration tests for full capture runs
//!
//! Each test drives a ticket through the service against a simulated
//! workpool and a scripted guest.

mod common;

use af_capture::request::TEMPORARY_SNAPSHOT;
use af_capture::{CaptureState, Status};
use af_workpool::test_utils::wait_until;
use common::{harness, ticket_request, Harness, PROJECT_ID};
use std::sync::atomic::Ordering;
use std::sync::Arc;

async fn run_to_end(harness: &Harness, automatic: bool, install: &str) -> Status {
    let ticket = harness
        .service
        .create(ticket_request(harness, automatic, install), harness.project.clone())
        .await
        .expect("Failed to create ticket");
    let status = harness.service.status(ticket).expect("Failed to find ticket");
    wait_until(|| status.is_finished()).await;
    status
}

async fn assert_lease_returned(harness: &Harness) {
    let model = harness.workpool.model().await.expect("Failed to read workpool");
    assert!(model.leases.is_empty(), "Lease was not returned: {:?}", model.leases);
}

#[tokio::test]
async fn test_automatic_capture_succeeds() {
    let harness = harness(true).await;
    let status = run_to_end(&harness, true, "setup.exe").await;

    assert!(status.is_request_success(), "States: {:?}", status.states());
    assert!(!status.contains(CaptureState::Failure));
    assert!(status.contains(CaptureState::VmReleased));
    assert_eq!(status.percent(), 100);
    assert_eq!(status.project_id(), Some(PROJECT_ID));
    assert_eq!(status.last_error(), "");
    assert!(status.last_command().is_none());
    assert_eq!(harness.project.refreshes.load(Ordering::SeqCst), 1);

    let guest = &harness.guest;
    let mount_input = guest
        .position(r#"output net use I: "\\fs01\apps\office" "share-pw" /user:capture"#)
        .expect("Input share was not mounted");
    let mount_output = guest
        .position(r#"output net use O: "\\fs01\projects\office" "share-pw" /user:capture"#)
        .expect("Output share was not mounted");
    let copy = guest
        .position(r#"batch c:\ copy "I:\setup.exe" c:\jobdir"#)
        .expect("Inputs were not copied");
    let pre_snapshot = guest
        .position_ending_with(r#"snapshot.exe" c:\precapture.snapshot"#)
        .expect("No pre-capture snapshot");
    let install = guest
        .position(r#"batch c:\jobdir "I:\setup.exe""#)
        .expect("Installer did not run");
    let post_snapshot = guest
        .position_ending_with(r#"snapshot.exe" c:\postcapture.snapshot"#)
        .expect("No post-capture snapshot");
    let build = guest.position("batch O: build.bat").expect("Project was not built");
    let unmount = guest
        .position("output net use I: /delete /yes")
        .expect("Input share was not unmounted");

    assert!(mount_input < mount_output);
    assert!(mount_output < copy);
    assert!(copy < pre_snapshot);
    assert!(pre_snapshot < install);
    assert!(install < post_snapshot);
    assert!(post_snapshot < build);
    assert!(build < unmount);
    assert!(guest.position("output net use O: /delete /yes").is_some());
    assert!(guest.has_call_starting_with(r"mkdir c:\thinapp-"));
    assert!(guest.position(r"upload c:\jobdir\setoption.exe").is_some());

    assert!(harness
        .simulator
        .snapshot_names(&harness.moid)
        .contains(&TEMPORARY_SNAPSHOT.to_string()));
    assert_lease_returned(&harness).await;
}

#[tokio::test]
async fn test_automatic_capture_visits_phases_in_order() {
    let harness = harness(true).await;
    let status = run_to_end(&harness, true, "setup.exe").await;

    let expected = [
        CaptureState::AcquiringVm,
        CaptureState::VmAcquired,
        CaptureState::PoweringOnVm,
        CaptureState::WaitingForTools,
        CaptureState::InstallingThinApp,
        CaptureState::MountingFileSharesToGuest,
        CaptureState::PreCaptureWait,
        CaptureState::PreCaptureDone,
        CaptureState::TakingPreCaptureSnapshot,
        CaptureState::PreInstallationWait,
        CaptureState::PreInstallationDone,
        CaptureState::InstallationWait,
        CaptureState::InstallationDone,
        CaptureState::PostInstallationWait,
        CaptureState::PostInstallationDone,
        CaptureState::TakingPostCaptureSnapshot,
        CaptureState::GeneratingProject,
        CaptureState::PreProjectBuildWait,
        CaptureState::PreProjectBuildDone,
        CaptureState::BuildingProject,
        CaptureState::RefreshingProject,
        CaptureState::RefreshingProjectDone,
        CaptureState::VmReleased,
        CaptureState::Success,
        CaptureState::Finished,
    ];
    for state in expected {
        assert!(status.contains(state), "Missing {}", state);
    }
    assert!(!status.contains(CaptureState::NeedsLoginWait));
    assert!(!status.contains(CaptureState::Downloading));
}

#[tokio::test]
async fn test_automatic_capture_requires_autologon() {
    let harness = harness(false).await;
    let status = run_to_end(&harness, true, "setup.exe").await;

    assert!(status.contains(CaptureState::Failure));
    assert!(!status.is_request_success());
    assert!(status.last_error().contains("non-autologon"));
    assert!(!harness.guest.has_call_starting_with("output net use"));
    assert_lease_returned(&harness).await;
}

#[tokio::test]
async fn test_unresponsive_guest_fails_capture() {
    let harness = harness(true).await;
    harness.guest.configure(|s| s.fail_echo = true);
    let status = run_to_end(&harness, true, "setup.exe").await;

    assert!(status.contains(CaptureState::Failure));
    assert!(status.last_error().contains("not responding"));
    let echoes = harness
        .guest
        .calls()
        .iter()
        .filter(|c| c.as_str() == "script echo test")
        .count();
    assert_eq!(echoes, 2);
}

#[tokio::test]
async fn test_build_with_leftover_fragments_fails() {
    let harness = harness(true).await;
    harness
        .guest
        .configure(|s| s.leftover_count = Some("2".to_string()));
    let status = run_to_end(&harness, true, "setup.exe").await;

    assert!(status.contains(CaptureState::Failure));
    assert!(status.contains(CaptureState::BuildingProject));
    assert!(!status.contains(CaptureState::RefreshingProject));
    assert_eq!(
        status.last_error(),
        "Build incomplete. Found package.ro.tvr* files."
    );
    assert_eq!(harness.project.refreshes.load(Ordering::SeqCst), 0);
    // Failed runs keep the guest event logs.
    assert!(harness.guest.has_call_starting_with("script cscript"));
    assert!(harness.guest.position("output net use O: /delete /yes").is_some());
    assert_lease_returned(&harness).await;
}

#[tokio::test]
async fn test_mount_failure_is_reported() {
    let harness = harness(true).await;
    harness.guest.configure(|s| s.fail_mount = true);
    let status = run_to_end(&harness, true, "setup.exe").await;

    assert!(status.contains(CaptureState::Failure));
    let error = status.last_error();
    assert!(error.starts_with(r"Failed to mount \\fs01\apps\office to drive I:"), "{}", error);
    assert!(!error.contains('\r'));
    assert!(!harness.guest.has_call_starting_with("output net use I: /delete"));
}

#[tokio::test]
async fn test_download_failure_stops_before_mounting() {
    let harness = harness(true).await;
    let mut request = ticket_request(&harness, true, "%D /S");
    request
        .inputs
        .push(af_capture::ProjectFile::new("http://127.0.0.1:1/setup.exe"));
    let ticket = harness
        .service
        .create(request, harness.project.clone())
        .await
        .expect("Failed to create ticket");
    let status = harness.service.status(ticket).expect("Failed to find ticket");
    wait_until(|| status.is_finished()).await;

    assert!(status.contains(CaptureState::Downloading));
    assert!(status.contains(CaptureState::InstallerDownloadFailed));
    assert!(status.contains(CaptureState::Failure));
    assert!(status.last_error().contains("http://127.0.0.1:1/setup.exe"));
    assert!(!status.contains(CaptureState::MountingFileSharesToGuest));
    assert!(!harness.guest.has_call_starting_with("output net use"));

    let download_dir = harness
        .download_root
        .join(format!("installers/project-{}", PROJECT_ID));
    assert!(!download_dir.exists());
    assert_lease_returned(&harness).await;
}

#[tokio::test]
async fn test_manual_capture_waits_for_user() {
    let harness = harness(false).await;
    let ticket = harness
        .service
        .create(ticket_request(&harness, false, "unused"), harness.project.clone())
        .await
        .expect("Failed to create ticket");
    let status = harness.service.status(ticket).expect("Failed to find ticket");

    wait_until(|| status.contains(CaptureState::NeedsLoginWait)).await;
    assert!(!status.contains(CaptureState::InstallingThinApp));
    harness
        .service
        .next(ticket, CaptureState::NeedsLoginWait)
        .expect("Failed to continue after login");

    wait_until(|| status.contains(CaptureState::PreCaptureWait)).await;
    assert!(harness.guest.position(r"upload C:\setoption.exe").is_some());
    harness
        .service
        .next(ticket, CaptureState::PreCaptureWait)
        .expect("Failed to continue after pre-capture");

    wait_until(|| status.contains(CaptureState::InstallationWait)).await;
    assert!(harness.guest.position("output explorer I:").is_some());
    assert!(!status.contains(CaptureState::TakingPostCaptureSnapshot));
    harness
        .service
        .next(ticket, CaptureState::InstallationWait)
        .expect("Failed to continue after installation");

    wait_until(|| status.is_finished()).await;
    assert!(status.is_request_success(), "States: {:?}", status.states());
    assert!(!status.contains(CaptureState::PreInstallationWait));
    assert!(!status.contains(CaptureState::PreProjectBuildWait));
    assert!(harness.guest.position("batch O: build.bat").is_some());
    assert_lease_returned(&harness).await;
}

#[tokio::test]
async fn test_cancel_kills_blocked_install() {
    let harness = harness(true).await;
    harness
        .guest
        .configure(|s| s.block_on = Some("hang.exe".to_string()));
    let ticket = harness
        .service
        .create(ticket_request(&harness, true, "hang.exe"), harness.project.clone())
        .await
        .expect("Failed to create ticket");
    let status = harness.service.status(ticket).expect("Failed to find ticket");

    let monitor = harness.monitor.clone();
    wait_until(|| monitor.is_tracking(PROJECT_ID)).await;
    assert!(status.contains(CaptureState::InstallationWait));
    assert!(status.last_command().is_some());

    harness.service.cancel(ticket).expect("Failed to cancel");
    wait_until(|| status.is_finished()).await;

    assert!(status.is_request_cancelled(), "States: {:?}", status.states());
    assert!(!status.contains(CaptureState::Failure));
    assert!(!status.contains(CaptureState::InstallationDone));
    assert_eq!(status.last_error(), "");
    assert!(harness.guest.position("output net use I: /delete /yes").is_some());
    assert!(harness.guest.position("output net use O: /delete /yes").is_some());
    assert!(!monitor.is_tracking(PROJECT_ID));
    assert_lease_returned(&harness).await;
}

#[tokio::test]
async fn test_cancel_during_tools_wait_leaves_guest_untouched() {
    let harness = harness(true).await;
    harness.simulator.hold_tools();
    let ticket = harness
        .service
        .create(ticket_request(&harness, true, "setup.exe"), harness.project.clone())
        .await
        .expect("Failed to create ticket");
    let status = harness.service.status(ticket).expect("Failed to find ticket");
    wait_until(|| status.contains(CaptureState::WaitingForTools)).await;

    harness.service.cancel(ticket).expect("Failed to cancel");
    harness.simulator.release_tools();
    wait_until(|| status.is_finished()).await;

    assert!(status.is_request_cancelled(), "States: {:?}", status.states());
    assert_eq!(harness.simulator.screen_changes(), 0);
    assert!(!harness.guest.has_call_starting_with("script echo test"));
    assert_lease_returned(&harness).await;
}

#[tokio::test]
async fn test_cancel_during_manual_snapshot_skips_install_window() {
    let harness = harness(true).await;
    let ticket = harness
        .service
        .create(ticket_request(&harness, false, "unused"), harness.project.clone())
        .await
        .expect("Failed to create ticket");
    let status = harness.service.status(ticket).expect("Failed to find ticket");
    wait_until(|| status.contains(CaptureState::PreCaptureWait)).await;

    let service = harness.service.clone();
    let cancel: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
        let _ = service.cancel(ticket);
    });
    harness
        .guest
        .configure(|s| s.on_batch = Some(("precapture.snapshot".to_string(), cancel)));
    harness
        .service
        .next(ticket, CaptureState::PreCaptureWait)
        .expect("Failed to continue after pre-capture");
    wait_until(|| status.is_finished()).await;

    assert!(status.is_request_cancelled(), "States: {:?}", status.states());
    assert!(harness
        .guest
        .position_ending_with(r#"snapshot.exe" c:\precapture.snapshot"#)
        .is_some());
    assert!(!harness.guest.has_call_starting_with("output explorer"));
    assert_lease_returned(&harness).await;
}

#[tokio::test]
async fn test_cancel_while_waiting_for_vm() {
    let harness = harness(true).await;
    let held = harness.workpool.acquire().await.expect("Failed to hold the VM");

    let ticket = harness
        .service
        .create(ticket_request(&harness, true, "setup.exe"), harness.project.clone())
        .await
        .expect("Failed to create ticket");
    let status = harness.service.status(ticket).expect("Failed to find ticket");
    wait_until(|| status.contains(CaptureState::AcquiringVm)).await;

    harness.service.cancel(ticket).expect("Failed to cancel");
    wait_until(|| status.is_finished()).await;
    assert!(status.is_request_cancelled());
    assert!(!status.contains(CaptureState::VmAcquired));
    assert!(harness.guest.calls().is_empty());

    // The abandoned request must not swallow the VM once it is free again.
    harness
        .workpool
        .release(&held)
        .await
        .expect("Failed to release held lease");
    let again = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        harness.workpool.acquire(),
    )
    .await
    .expect("Timed out re-acquiring")
    .expect("Failed to re-acquire");
    assert_eq!(again.instance.id, held.instance.id);
}
