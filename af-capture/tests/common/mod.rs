//! Shared fixtures for capture tests: a scripted guest, in-memory datastores
//! and a service wired to a simulated workpool.

#![allow(dead_code)]

use af_capture::capturer::CaptureContext;
use af_capture::download::HttpDownloader;
use af_capture::packager::{RuntimePackager, ThinAppRuntime};
use af_capture::plan::OutputLocation;
use af_capture::{
    CaptureConfig, CaptureError, CaptureService, Command, ConversionPhase, Datastore,
    DatastoreDirectory, GuestCommands, GuestConnector, PhaseCommands, ProcessMonitor,
    ProgramOutput, Project, ProjectFile, RequestFactory, Result, RunProgramOptions,
    TicketRequest,
};
use af_workpool::simulator::Simulator;
use af_workpool::test_utils::{test_services, wait_for_workpool};
use af_workpool::{
    InstanceModel, LeaseModel, VmImageManager, WorkpoolHandle, WorkpoolKind, WorkpoolManager,
    WorkpoolModel, WorkpoolState,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const PROJECT_ID: i64 = 41;

/// Knobs and call log shared by every guest session of a test.
#[derive(Default)]
pub struct GuestScript {
    pub calls: Vec<String>,
    pub fail_echo: bool,
    pub fail_mount: bool,
    /// `dir ... | find /c` output for leftover build fragments.
    pub leftover_count: Option<String>,
    /// Batch scripts containing this text block until killed.
    pub block_on: Option<String>,
    /// Called while a batch script containing the text runs.
    pub on_batch: Option<(String, Arc<dyn Fn() + Send + Sync>)>,
}

#[derive(Clone, Default)]
pub struct GuestState {
    script: Arc<Mutex<GuestScript>>,
}

impl GuestState {
    pub fn configure(&self, change: impl FnOnce(&mut GuestScript)) {
        change(&mut self.script.lock().expect("Guest script poisoned"));
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().expect("Guest script poisoned").calls.clone()
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn position_ending_with(&self, suffix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.ends_with(suffix))
    }

    pub fn has_call_starting_with(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    fn record(&self, call: String) {
        self.script.lock().expect("Guest script poisoned").calls.push(call);
    }

    fn with<T>(&self, read: impl FnOnce(&GuestScript) -> T) -> T {
        read(&self.script.lock().expect("Guest script poisoned"))
    }
}

pub struct FakeGuest {
    state: GuestState,
    monitor: ProcessMonitor,
    command_id: i64,
}

#[async_trait]
impl GuestCommands for FakeGuest {
    async fn upload_file(&self, _host_source: &Path, guest_dest: &str) -> Result<()> {
        self.state.record(format!("upload {}", guest_dest));
        Ok(())
    }

    async fn download_file(&self, guest_source: &str, _host_dest: &Path) -> Result<()> {
        self.state.record(format!("download {}", guest_source));
        Ok(())
    }

    async fn create_directory(&self, guest_dir: &str) -> Result<()> {
        self.state.record(format!("mkdir {}", guest_dir));
        Ok(())
    }

    async fn run_program(
        &self,
        _options: &RunProgramOptions,
        program: &str,
        args: &[&str],
    ) -> Result<()> {
        self.state.record(format!("run {} {}", program, args.join(" ")));
        Ok(())
    }

    async fn run_program_with_output(
        &self,
        _options: &RunProgramOptions,
        program: &str,
        args: &[&str],
    ) -> Result<ProgramOutput> {
        self.state
            .record(format!("output {} {}", program, args.join(" ")).trim_end().to_string());

        let mounting = program == "net" && !args.contains(&"/delete");
        if mounting && self.state.with(|s| s.fail_mount) {
            return Err(CaptureError::CommandFailed {
                command: "net".to_string(),
                exit_code: 2,
                output: "System error 53 has occurred.\r\n\r\nThe network path was not found."
                    .to_string(),
            });
        }
        if program == "cmd.exe" {
            let count = self
                .state
                .with(|s| s.leftover_count.clone())
                .unwrap_or_else(|| "0".to_string());
            return Ok(ProgramOutput::success(format!("{}\r\n", count)));
        }
        Ok(ProgramOutput::success(""))
    }

    async fn run_batch_script_with_output(
        &self,
        _options: &RunProgramOptions,
        working_dir: &str,
        _env: &BTreeMap<String, String>,
        commands: &[String],
    ) -> Result<ProgramOutput> {
        let joined = commands.join(" && ");
        self.state.record(format!("batch {} {}", working_dir, joined));

        let hook = self.state.with(|s| {
            s.on_batch
                .as_ref()
                .filter(|(text, _)| joined.contains(text))
                .map(|(_, hook)| hook.clone())
        });
        if let Some(hook) = hook {
            hook();
        }

        let blocks = self
            .state
            .with(|s| s.block_on.clone())
            .is_some_and(|text| joined.contains(&text));
        if blocks {
            let mut process = self.monitor.track(self.command_id);
            process.killed().await;
            return Err(CaptureError::guest(format!("Killed: {}", joined)));
        }
        Ok(ProgramOutput::success(""))
    }

    async fn run_script(&self, _shell: &str, script: &str) -> Result<()> {
        self.state.record(format!("script {}", script));
        if script == "echo test" && self.state.with(|s| s.fail_echo) {
            return Err(CaptureError::guest("The guest is not logged in"));
        }
        Ok(())
    }
}

pub struct FakeConnector {
    state: GuestState,
    monitor: ProcessMonitor,
}

impl GuestConnector for FakeConnector {
    fn connect(&self, _lease: &LeaseModel, command_id: i64) -> Result<Arc<dyn GuestCommands>> {
        Ok(Arc::new(FakeGuest {
            state: self.state.clone(),
            monitor: self.monitor.clone(),
            command_id,
        }))
    }
}

pub struct FakeDatastores {
    download_root: PathBuf,
}

#[async_trait]
impl DatastoreDirectory for FakeDatastores {
    async fn datastore(&self, id: &str) -> Result<Datastore> {
        if id == "missing" {
            return Err(CaptureError::InvalidInput(format!("No datastore {}", id)));
        }
        Ok(Datastore {
            id: id.to_string(),
            name: id.to_string(),
            server: "fs01".to_string(),
            share: id.to_string(),
            username: "capture".to_string(),
            password: "share-pw".to_string(),
            mount_path: None,
        })
    }

    async fn download_datastore(&self) -> Result<Datastore> {
        Ok(Datastore {
            id: "downloads".to_string(),
            name: "downloads".to_string(),
            server: "fs01".to_string(),
            share: "downloads".to_string(),
            username: "capture".to_string(),
            password: "share-pw".to_string(),
            mount_path: Some(self.download_root.clone()),
        })
    }
}

pub struct FakePackager {
    dir: PathBuf,
}

#[async_trait]
impl RuntimePackager for FakePackager {
    async fn create_package(&self, runtime: &ThinAppRuntime) -> Result<PathBuf> {
        let path = self.dir.join(format!("package-{}.exe", runtime.version));
        tokio::fs::write(&path, b"MZ").await?;
        Ok(path)
    }
}

#[derive(Default)]
pub struct FakeProject {
    pub refreshes: AtomicUsize,
}

#[async_trait]
impl Project for FakeProject {
    fn id(&self) -> i64 {
        PROJECT_ID
    }

    async fn refresh(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub service: CaptureService,
    pub simulator: Simulator,
    pub guest: GuestState,
    pub monitor: ProcessMonitor,
    pub workpool: WorkpoolHandle,
    pub moid: String,
    pub project: Arc<FakeProject>,
    pub download_root: PathBuf,
    _dirs: TempDir,
}

pub fn test_capture_config() -> CaptureConfig {
    CaptureConfig {
        http_proxy_host: String::new(),
        http_proxy_port: 0,
        http_non_proxy_hosts: String::new(),
        setproxy_exe: PathBuf::from("tools/setproxy.exe"),
        setoption_exe: PathBuf::from("tools/setoption.exe"),
        backup_eventlogs_script: PathBuf::from("tools/backupeventlogs.vbs"),
        installers_dir: "installers/".to_string(),
        poll_interval_ms: 10,
        login_echo_attempts: 2,
        login_echo_interval_ms: 10,
    }
}

/// A service over a custom workpool holding one VM.
pub async fn harness(autologon: bool) -> Harness {
    let (services, simulator) = test_services().await;
    let images = VmImageManager::new(services.clone());
    let workpools = WorkpoolManager::new(services.clone(), images);
    let workpool = workpools
        .create(WorkpoolModel::new("capture-pool", WorkpoolKind::Custom, 0))
        .await
        .expect("Failed to create workpool");
    wait_for_workpool(&workpool, |m| m.state == WorkpoolState::Available).await;

    let moid = simulator.add_vm("capture-vm");
    workpool
        .add_instance(InstanceModel::existing(
            &moid,
            "Administrator",
            "guest-pw",
            autologon,
        ))
        .await
        .expect("Failed to add instance");

    let dirs = tempfile::tempdir().expect("Failed to create temp dir");
    let download_root = dirs.path().join("downloads");
    let package_dir = dirs.path().join("packages");
    std::fs::create_dir_all(&download_root).expect("Failed to create download root");
    std::fs::create_dir_all(&package_dir).expect("Failed to create package dir");

    let guest = GuestState::default();
    let monitor = ProcessMonitor::new();
    let context = CaptureContext {
        config: Arc::new(test_capture_config()),
        guests: Arc::new(FakeConnector {
            state: guest.clone(),
            monitor: monitor.clone(),
        }),
        job_monitor: None,
        packager: Arc::new(FakePackager { dir: package_dir }),
    };
    let factory = RequestFactory::new(
        context,
        Arc::new(FakeDatastores {
            download_root: download_root.clone(),
        }),
        HttpDownloader::default(),
    );
    let service = CaptureService::new(
        factory,
        workpools,
        Arc::new(simulator.clone()),
        monitor.clone(),
    );

    Harness {
        service,
        simulator,
        guest,
        monitor,
        workpool,
        moid,
        project: Arc::new(FakeProject::default()),
        download_root,
        _dirs: dirs,
    }
}

/// Capture of `setup.exe` from the `apps` datastore into `projects\office`.
pub fn ticket_request(harness: &Harness, automatic: bool, install: &str) -> TicketRequest {
    let commands: PhaseCommands = HashMap::from([(
        ConversionPhase::Install,
        vec![Command::new("Install", install)],
    )]);
    TicketRequest {
        workpool_id: harness.workpool.id().to_string(),
        inputs: vec![ProjectFile::new("datastore://apps/office/setup.exe")],
        output: OutputLocation {
            datastore_id: "projects".to_string(),
            path: "office".to_string(),
        },
        runtime: ThinAppRuntime::new("5.2.0"),
        commands,
        automatic,
    }
}
