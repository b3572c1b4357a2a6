//! The capture protocol run against one leased VM.
//!
//! `Capturer::call` walks the phases in order, publishing progress on the
//! shared `Status`. Mode-specific steps are delegated to a `CaptureMode`.
//! Whatever happens, shares are unmounted and monitoring is stopped before
//! the call returns.

use crate::command::{Command, ConversionPhase, PhaseCommands};
use crate::config::CaptureConfig;
use crate::download::DownloadResult;
use crate::drive::DriveLetter;
use crate::error::{CaptureError, Result};
use crate::guest::{GuestCommands, GuestConnector, RunProgramOptions};
use crate::monitor::{JobMonitor, MonitorTicket};
use crate::mounter::Mounter;
use crate::packager::{discard_package, RuntimePackager, ThinAppRuntime};
use crate::state::CaptureState;
use crate::status::Status;
use af_workpool::{LeaseModel, VirtualMachine};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Level};

pub const PROJECT_TEMPLATE: &str = r"c:\template.ini";
pub const PRECAPTURE_SNAPSHOT: &str = r"c:\precapture.snapshot";
pub const POSTCAPTURE_SNAPSHOT: &str = r"c:\postcapture.snapshot";
pub const GUEST_SET_PROXY_EXE: &str = r"c:\setproxy.exe";
pub const GUEST_BACKUPEVENTLOGS_SCRIPT: &str = r"c:\backupeventlogs.vbs";
const EVENT_LOG_DIR: &str = r"Support\Capture Machine EventLog";

const SCREEN_WIDTH: u32 = 800;
const SCREEN_HEIGHT: u32 = 600;

/// Everything prepared on the host for one capture.
pub struct CaptureInputs {
    pub input_mounters: Vec<Mounter>,
    pub output_mounter: Mounter,
    pub downloads: Vec<JoinHandle<DownloadResult>>,
    /// Host directories the downloads write to. Removed after the run.
    pub download_dirs: Vec<PathBuf>,
    pub download_drive: Option<DriveLetter>,
    /// Files on each input drive that are copied into the guest.
    pub drive_files: BTreeMap<DriveLetter, Vec<String>>,
    pub runtime: ThinAppRuntime,
    pub commands: PhaseCommands,
}

/// Services shared by all captures of a process.
#[derive(Clone)]
pub struct CaptureContext {
    pub config: Arc<CaptureConfig>,
    pub guests: Arc<dyn GuestConnector>,
    pub job_monitor: Option<JobMonitor>,
    pub packager: Arc<dyn RuntimePackager>,
}

/// Guest connection and per-run values handed to the capture mode.
pub struct CaptureSession {
    pub guest: Arc<dyn GuestCommands>,
    pub status: Status,
    pub config: Arc<CaptureConfig>,
    pub lease: LeaseModel,
    pub commands: PhaseCommands,
    pub env: BTreeMap<String, String>,
    pub downloads: Vec<DownloadResult>,
    pub download_drive: Option<DriveLetter>,
    pub input_drives: Vec<DriveLetter>,
    pub drive_files: BTreeMap<DriveLetter, Vec<String>>,
    pub runtime_dir: Option<String>,
    pub project_output: Option<String>,
}

impl CaptureSession {
    pub fn check_cancel(&self) -> Result<()> {
        if self.status.is_request_cancelling() {
            return Err(CaptureError::Canceled);
        }
        Ok(())
    }

    pub fn commands_for(&self, phase: ConversionPhase) -> Vec<Command> {
        self.commands.get(&phase).cloned().unwrap_or_default()
    }

    /// Drive of the first input share.
    pub fn first_input_drive(&self) -> DriveLetter {
        self.input_drives.first().copied().unwrap_or(DriveLetter::I)
    }

    /// Poll the guest with a trivial script until it answers.
    pub async fn echo_test(&self, failure: &str) -> Result<()> {
        let attempts = self.config.login_echo_attempts.max(1);
        for attempt in 1..=attempts {
            self.check_cancel()?;
            match self.guest.run_script("", "echo test").await {
                Ok(()) => return Ok(()),
                Err(e) => debug!("Echo test {}/{} failed: {}", attempt, attempts, e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.login_echo_interval()).await;
            }
        }
        Err(CaptureError::guest(failure))
    }

    pub async fn upload_set_option(&self, guest_path: &str) -> Result<()> {
        self.guest
            .upload_file(&self.config.setoption_exe, guest_path)
            .await
    }

    /// Run each command in its own batch script from `working_dir`. With
    /// `track`, the command is published as the status's last command while it runs.
    pub async fn run_commands(
        &self,
        commands: &[Command],
        working_dir: &str,
        track: bool,
    ) -> Result<()> {
        let options = RunProgramOptions::interactive();
        for command in commands {
            self.check_cancel()?;
            info!("Running {}: {}", command.label, command.command);
            if track {
                self.status.set_last_command(Some(command.clone()));
            }
            let output = self
                .guest
                .run_batch_script_with_output(
                    &options,
                    working_dir,
                    &self.env,
                    std::slice::from_ref(&command.command),
                )
                .await?;
            output.log(&command.label);
            if track {
                self.status.set_last_command(None);
            }
        }
        Ok(())
    }

    fn snapshot_exe(&self) -> Result<String> {
        let dir = self.runtime_dir.as_deref().ok_or_else(|| {
            CaptureError::InvalidState("The ThinApp runtime directory was not set.".to_string())
        })?;
        Ok(format!("\"{}\\snapshot.exe\"", dir))
    }

    fn project_output(&self) -> Result<&str> {
        self.project_output
            .as_deref()
            .ok_or_else(|| CaptureError::InvalidState("The output share is not mounted.".to_string()))
    }

    async fn run_snapshot(&self, args: &[&str]) -> Result<()> {
        let exe = self.snapshot_exe()?;
        let output = self
            .guest
            .run_program_with_output(&RunProgramOptions::default(), &exe, args)
            .await?;
        output.log("snapshot.exe");
        Ok(())
    }

    async fn delete_temp_output(&self) -> Result<()> {
        self.check_cancel()?;
        let script = format!(
            "del {} {}",
            crate::guest::STDOUT_FILE,
            crate::guest::STDERR_FILE
        );
        if let Err(e) = self.guest.run_script("", &script).await {
            debug!("Could not delete temporary output files: {}", e);
        }
        Ok(())
    }
}

/// Steps that differ between unattended and user-driven captures.
#[async_trait]
pub trait CaptureMode: Send + Sync {
    fn name(&self) -> &'static str;

    async fn verify_logged_in(&self, session: &CaptureSession) -> Result<()>;

    async fn pre_capture(&self, session: &CaptureSession) -> Result<()>;

    async fn before_pre_capture_snapshot(&self, _session: &CaptureSession) -> Result<()> {
        Ok(())
    }

    async fn pre_install(&self, _session: &CaptureSession) -> Result<()> {
        Ok(())
    }

    async fn install_application(&self, session: &CaptureSession) -> Result<()>;

    async fn post_install(&self, _session: &CaptureSession) -> Result<()> {
        Ok(())
    }

    async fn pre_build(&self, session: &CaptureSession) -> Result<()>;
}

pub struct Capturer {
    context: CaptureContext,
    mode: Box<dyn CaptureMode>,
    status: Status,
    project_id: i64,
    input_mounters: Vec<Mounter>,
    output_mounter: Mounter,
    downloads: Vec<JoinHandle<DownloadResult>>,
    download_dirs: Vec<PathBuf>,
    download_drive: Option<DriveLetter>,
    drive_files: BTreeMap<DriveLetter, Vec<String>>,
    runtime: ThinAppRuntime,
    commands: PhaseCommands,
}

impl Capturer {
    pub fn new(
        context: CaptureContext,
        mode: Box<dyn CaptureMode>,
        status: Status,
        project_id: i64,
        inputs: CaptureInputs,
    ) -> Self {
        Self {
            context,
            mode,
            status,
            project_id,
            input_mounters: inputs.input_mounters,
            output_mounter: inputs.output_mounter,
            downloads: inputs.downloads,
            download_dirs: inputs.download_dirs,
            download_drive: inputs.download_drive,
            drive_files: inputs.drive_files,
            runtime: inputs.runtime,
            commands: inputs.commands,
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn mode_name(&self) -> &'static str {
        self.mode.name()
    }

    /// Run the capture on `vm`, reached through `lease`.
    pub async fn call(&mut self, vm: &dyn VirtualMachine, lease: &LeaseModel) -> Result<()> {
        let guest = self.context.guests.connect(lease, self.project_id)?;
        self.status.set_lease(lease.clone());
        self.status.set_current_state(CaptureState::VmAcquired);
        info!(
            "Starting {} capture on {}",
            self.mode.name(),
            vm.moid()
        );

        let mut session = CaptureSession {
            guest,
            status: self.status.clone(),
            config: self.context.config.clone(),
            lease: lease.clone(),
            commands: self.commands.clone(),
            env: BTreeMap::new(),
            downloads: Vec::new(),
            download_drive: self.download_drive,
            input_drives: self.input_mounters.iter().map(Mounter::drive).collect(),
            drive_files: self.drive_files.clone(),
            runtime_dir: None,
            project_output: None,
        };

        let mut monitor_ticket = None;
        let result = match self.run_phases(vm, &mut session, &mut monitor_ticket).await {
            Ok(()) => Ok(()),
            Err(_) if self.status.is_request_cancelling() => Err(CaptureError::Canceled),
            Err(e) => {
                self.status.set_last_error(e.to_string());
                Err(e)
            }
        };

        let failed = matches!(&result, Err(e) if !e.is_canceled());
        self.cleanup(&session, monitor_ticket, failed).await;
        result?;

        session.check_cancel()?;
        info!("Tasks inside virtual machine completed.");
        Ok(())
    }

    async fn run_phases(
        &mut self,
        vm: &dyn VirtualMachine,
        session: &mut CaptureSession,
        monitor_ticket: &mut Option<MonitorTicket>,
    ) -> Result<()> {
        self.prepare_vm(vm, session).await?;
        *monitor_ticket = self.start_monitoring(vm).await;
        self.mode.verify_logged_in(session).await?;
        self.install_runtime(session).await?;
        self.await_downloads(session).await?;
        self.mount_shares(session).await?;

        self.mode.pre_capture(session).await?;
        self.pre_capture_snapshot(session).await?;
        self.mode.pre_install(session).await?;
        self.mode.install_application(session).await?;
        self.mode.post_install(session).await?;
        self.post_capture_snapshot(session).await?;
        self.mode.pre_build(session).await?;
        self.build_project(session).await
    }

    async fn prepare_vm(&self, vm: &dyn VirtualMachine, session: &CaptureSession) -> Result<()> {
        session.check_cancel()?;
        self.status.set_current_state(CaptureState::PoweringOnVm);
        vm.power_on().await?;

        session.check_cancel()?;
        self.status.set_current_state(CaptureState::WaitingForTools);
        vm.wait_for_tools().await?;
        session.check_cancel()?;
        vm.set_screen_resolution(SCREEN_WIDTH, SCREEN_HEIGHT).await?;
        session.check_cancel()?;
        let ip = vm.wait_for_guest_ip().await?;
        info!("Guest {} is up at {}", vm.moid(), ip);

        self.set_guest_proxy(session).await
    }

    async fn set_guest_proxy(&self, session: &CaptureSession) -> Result<()> {
        let config = &self.context.config;
        if !config.has_proxy() {
            return Ok(());
        }
        session.check_cancel()?;
        info!(
            "Setting guest proxy to {}:{}",
            config.http_proxy_host, config.http_proxy_port
        );
        session
            .guest
            .upload_file(&config.setproxy_exe, GUEST_SET_PROXY_EXE)
            .await?;
        let port = config.http_proxy_port.to_string();
        let mut args = vec!["--http", config.http_proxy_host.as_str(), port.as_str()];
        if !config.http_non_proxy_hosts.is_empty() {
            args.push(&config.http_non_proxy_hosts);
        }
        session
            .guest
            .run_program(&RunProgramOptions::default(), GUEST_SET_PROXY_EXE, &args)
            .await
    }

    async fn start_monitoring(&self, vm: &dyn VirtualMachine) -> Option<MonitorTicket> {
        let monitor = self.context.job_monitor.as_ref()?;
        match monitor.start_monitoring(vm.moid(), self.status.clone()).await {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                warn!("Performance monitoring of {} not started: {}", vm.moid(), e);
                None
            }
        }
    }

    async fn install_runtime(&self, session: &mut CaptureSession) -> Result<()> {
        session.check_cancel()?;
        self.status.set_current_state(CaptureState::InstallingThinApp);

        let dir = format!(r"c:\thinapp-{:05x}", rand::random::<u32>() & 0xfffff);
        session.guest.create_directory(&dir).await?;

        let package = self.context.packager.create_package(&self.runtime).await?;
        let staged = async {
            session
                .guest
                .upload_file(&package, &format!(r"{}\package.exe", dir))
                .await?;
            session
                .guest
                .run_batch_script_with_output(
                    &RunProgramOptions::default(),
                    &dir,
                    &BTreeMap::new(),
                    &["package.exe".to_string()],
                )
                .await
        }
        .await;
        discard_package(&package).await;
        staged?.log("package.exe");

        info!("Runtime {} staged in {}", self.runtime.version, dir);
        session.runtime_dir = Some(dir);
        Ok(())
    }

    async fn await_downloads(&mut self, session: &mut CaptureSession) -> Result<()> {
        if self.downloads.is_empty() {
            return Ok(());
        }
        session.check_cancel()?;
        self.status.set_current_state(CaptureState::Downloading);

        let joined = tokio::select! {
            joined = futures::future::join_all(self.downloads.iter_mut()) => joined,
            _ = self.status.wait_until(CaptureState::Cancelling) => {
                return Err(CaptureError::Canceled);
            }
        };
        self.downloads.clear();
        let results: Vec<DownloadResult> = joined.into_iter().filter_map(|r| r.ok()).collect();

        if let Some(failed) = results.iter().find(|r| !r.succeeded) {
            self.status
                .set_current_state(CaptureState::InstallerDownloadFailed);
            return Err(CaptureError::DownloadFailed {
                url: failed.url.clone(),
                directory: failed.download_dir.display().to_string(),
                message: failed.message.clone(),
            });
        }
        session.downloads = results;
        Ok(())
    }

    async fn mount_shares(&mut self, session: &mut CaptureSession) -> Result<()> {
        session.check_cancel()?;
        self.status
            .set_current_state(CaptureState::MountingFileSharesToGuest);

        for mounter in &mut self.input_mounters {
            mounter.mount(session.guest.as_ref()).await?;
        }
        let project_output = self.output_mounter.mount(session.guest.as_ref()).await?;
        session.env = BTreeMap::from([("ProjectDirectory".to_string(), project_output.clone())]);
        session.project_output = Some(project_output);
        Ok(())
    }

    async fn pre_capture_snapshot(&self, session: &CaptureSession) -> Result<()> {
        session.check_cancel()?;
        self.mode.before_pre_capture_snapshot(session).await?;
        self.status.set_current_state(CaptureState::PreCaptureWait);
        self.status.wait_until(CaptureState::PreCaptureDone).await;

        session.delete_temp_output().await?;
        session.check_cancel()?;
        self.status
            .set_current_state(CaptureState::TakingPreCaptureSnapshot);
        session.run_snapshot(&[PRECAPTURE_SNAPSHOT]).await
    }

    async fn post_capture_snapshot(&self, session: &CaptureSession) -> Result<()> {
        session.delete_temp_output().await?;
        session.check_cancel()?;
        self.status
            .set_current_state(CaptureState::TakingPostCaptureSnapshot);
        session.run_snapshot(&[POSTCAPTURE_SNAPSHOT]).await?;

        session.check_cancel()?;
        self.status.set_current_state(CaptureState::GeneratingProject);
        session
            .run_snapshot(&[
                PRECAPTURE_SNAPSHOT,
                "-SuggestProject",
                POSTCAPTURE_SNAPSHOT,
                PROJECT_TEMPLATE,
            ])
            .await?;
        let project_output = session.project_output()?;
        session
            .run_snapshot(&[PROJECT_TEMPLATE, "-GenerateProject", project_output])
            .await
    }

    async fn build_project(&self, session: &CaptureSession) -> Result<()> {
        session.check_cancel()?;
        self.status.set_current_state(CaptureState::BuildingProject);
        let project_output = session.project_output()?;

        let env = BTreeMap::from([("PROJECT_PATH".to_string(), project_output.to_string())]);
        let output = session
            .guest
            .run_batch_script_with_output(
                &RunProgramOptions::default(),
                project_output,
                &env,
                &["build.bat".to_string()],
            )
            .await?;
        output.log("build.bat");

        // A build that died half way leaves package.ro.tvr* fragments in bin.
        let find = format!(
            "{}\\bin /b | find \"package.ro.tvr\" /i /c",
            project_output
        );
        let leftovers = session
            .guest
            .run_program_with_output(&RunProgramOptions::default(), "cmd.exe", &["/c", "dir", &find])
            .await?;
        if !leftovers.stdout.trim_start().starts_with('0') {
            return Err(CaptureError::BuildIncomplete);
        }
        Ok(())
    }

    async fn cleanup(
        &mut self,
        session: &CaptureSession,
        monitor_ticket: Option<MonitorTicket>,
        failed: bool,
    ) {
        if tracing::enabled!(Level::DEBUG) || failed {
            if let Err(e) = self.backup_event_logs(session).await {
                warn!("Could not back up guest event logs: {}", e);
            }
        }

        let guest = session.guest.as_ref();
        for mounter in &mut self.input_mounters {
            if let Err(e) = mounter.unmount(guest).await {
                warn!("Failed to unmount {}: {}", mounter.drive(), e);
            }
        }
        if let Err(e) = self.output_mounter.unmount(guest).await {
            warn!("Failed to unmount {}: {}", self.output_mounter.drive(), e);
        }

        if let (Some(monitor), Some(ticket)) = (&self.context.job_monitor, monitor_ticket) {
            if let Err(e) = monitor.stop_monitoring(ticket) {
                warn!("Failed to stop performance monitoring: {}", e);
            }
        }
    }

    async fn backup_event_logs(&self, session: &CaptureSession) -> Result<()> {
        let Some(project_output) = session.project_output.as_deref() else {
            debug!("Output share not mounted, skipping event log backup");
            return Ok(());
        };
        session
            .guest
            .upload_file(
                &self.context.config.backup_eventlogs_script,
                GUEST_BACKUPEVENTLOGS_SCRIPT,
            )
            .await?;
        let script = format!(
            "cscript \"{}\" \"{}\\{}\"",
            GUEST_BACKUPEVENTLOGS_SCRIPT, project_output, EVENT_LOG_DIR
        );
        session.guest.run_script("", &script).await
    }

    /// Stop downloads still running and remove their host directories.
    pub async fn cleanup_downloads(&mut self) {
        for handle in self.downloads.drain(..) {
            handle.abort();
        }
        for dir in self.download_dirs.drain(..) {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                debug!("Could not remove download directory {}: {}", dir.display(), e);
            }
        }
    }
}
