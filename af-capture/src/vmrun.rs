//! `GuestCommands` over the `vmrun` command line tool.

use crate::error::{CaptureError, Result};
use crate::guest::{
    batch_script, GuestCommands, GuestConnector, ProgramOutput, RunProgramOptions, STDERR_FILE,
    STDOUT_FILE,
};
use crate::process::ProcessMonitor;
use af_workpool::LeaseModel;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

const MASK: &str = "********";

/// Exit codes vmrun uses for its own failures, as opposed to the guest program's.
const VMRUN_FAILURE_CODES: [i32; 2] = [255, -1];

/// Builds vmrun argument lists for one VM.
#[derive(Clone)]
pub struct VmrunCommandBuilder {
    host: String,
    username: String,
    password: String,
    guest_username: String,
    guest_password: String,
    vm: String,
}

impl VmrunCommandBuilder {
    pub fn from_lease(lease: &LeaseModel) -> Result<Self> {
        let vm = lease
            .instance
            .moid
            .clone()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| {
                CaptureError::InvalidState(format!(
                    "Leased instance {} has no VM",
                    lease.instance.id
                ))
            })?;
        Ok(Self {
            host: lease.vc_config.host.clone(),
            username: lease.vc_config.username.clone(),
            password: lease.vc_config.password.clone(),
            guest_username: lease.instance.guest_username.clone(),
            guest_password: lease.instance.guest_password.clone(),
            vm,
        })
    }

    pub fn command(&self, operation: &str, args: &[&str]) -> Vec<String> {
        let mut command: Vec<String> = vec![
            "-T".into(),
            "vc".into(),
            "-h".into(),
            format!("https://{}/sdk", self.host),
            "-u".into(),
            self.username.clone(),
            "-p".into(),
            self.password.clone(),
            "-gu".into(),
            self.guest_username.clone(),
            "-gp".into(),
            self.guest_password.clone(),
            operation.into(),
            self.vm.clone(),
        ];
        command.extend(args.iter().map(|a| a.to_string()));
        command
    }

    pub fn upload_file(&self, host_source: &str, guest_dest: &str) -> Vec<String> {
        self.command("CopyFileFromHostToGuest", &[host_source, guest_dest])
    }

    pub fn download_file(&self, guest_source: &str, host_dest: &str) -> Vec<String> {
        self.command("CopyFileFromGuestToHost", &[guest_source, host_dest])
    }

    pub fn create_directory(&self, guest_dir: &str) -> Vec<String> {
        self.command("createDirectoryInGuest", &[guest_dir])
    }

    pub fn run_program(
        &self,
        options: &RunProgramOptions,
        program: &str,
        args: &[&str],
    ) -> Vec<String> {
        let mut run_args = options.to_args();
        run_args.push(program);
        run_args.extend_from_slice(args);
        self.command("runProgramInGuest", &run_args)
    }

    /// Runs through cmd.exe so output can be redirected to the well-known files.
    pub fn run_program_with_output(
        &self,
        options: &RunProgramOptions,
        program: &str,
        args: &[&str],
    ) -> Vec<String> {
        let mut parts = vec![program];
        parts.extend_from_slice(args);
        let script = format!("{} > {} 2> {}", parts.join(" "), STDOUT_FILE, STDERR_FILE);
        let mut run_args = options.to_args();
        run_args.push("");
        run_args.push(&script);
        self.command("runScriptInGuest", &run_args)
    }

    pub fn run_script(&self, shell: &str, script: &str) -> Vec<String> {
        self.command("runScriptInGuest", &[shell, script])
    }

    /// The command line as it may be logged: passwords and `masks` hidden.
    pub fn display(command: &[String], options: &RunProgramOptions) -> String {
        let mut shown = Vec::with_capacity(command.len());
        let mut mask_next = false;
        for arg in command {
            if mask_next {
                shown.push(MASK.to_string());
                mask_next = false;
            } else {
                mask_next = arg == "-p" || arg == "-gp";
                shown.push(options.mask(arg));
            }
        }
        shown.join(" ")
    }
}

pub struct VmrunGuest {
    program: PathBuf,
    builder: VmrunCommandBuilder,
    monitor: ProcessMonitor,
    command_id: i64,
}

impl VmrunGuest {
    pub fn new(
        program: PathBuf,
        builder: VmrunCommandBuilder,
        monitor: ProcessMonitor,
        command_id: i64,
    ) -> Self {
        Self {
            program,
            builder,
            monitor,
            command_id,
        }
    }

    /// Run vmrun and return its exit code with combined stdout and stderr.
    async fn run(&self, args: Vec<String>, options: &RunProgramOptions) -> Result<(i32, String)> {
        let shown_command = VmrunCommandBuilder::display(&args, options);
        info!("Running command: vmrun {}", shown_command);

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut tracked = self.monitor.track(self.command_id);
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = tracked.killed() => {
                return Err(CaptureError::guest(format!("Killed: vmrun {}", shown_command)));
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.code().unwrap_or(-1), text))
    }

    async fn run_checked(&self, what: &str, args: Vec<String>) -> Result<()> {
        let (exit_code, output) = self.run(args, &RunProgramOptions::default()).await?;
        info!("{} exited with code: {} ({}).", what, exit_code, output.trim());
        if exit_code != 0 {
            return Err(CaptureError::guest(format!(
                "{} exited with code: {} ({}).",
                what,
                exit_code,
                output.trim()
            )));
        }
        Ok(())
    }

    async fn fetch_text(&self, guest_source: &str) -> Result<String> {
        let local = tempfile::Builder::new().prefix("guestOutput").tempfile()?;
        self.download_file(guest_source, local.path()).await?;
        let bytes = tokio::fs::read(local.path()).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait]
impl GuestCommands for VmrunGuest {
    async fn upload_file(&self, host_source: &Path, guest_dest: &str) -> Result<()> {
        let args = self
            .builder
            .upload_file(&host_source.to_string_lossy(), guest_dest);
        self.run_checked("Upload file", args).await
    }

    async fn download_file(&self, guest_source: &str, host_dest: &Path) -> Result<()> {
        let args = self
            .builder
            .download_file(guest_source, &host_dest.to_string_lossy());
        self.run_checked("Download file", args).await
    }

    async fn create_directory(&self, guest_dir: &str) -> Result<()> {
        let args = self.builder.create_directory(guest_dir);
        self.run_checked("Create directory", args).await
    }

    async fn run_program(
        &self,
        options: &RunProgramOptions,
        program: &str,
        args: &[&str],
    ) -> Result<()> {
        let command = self.builder.run_program(options, program, args);
        let (exit_code, output) = self.run(command, options).await?;
        info!("Run program exited with code: {} ({}).", exit_code, output.trim());
        if exit_code != 0 {
            return Err(CaptureError::guest(format!(
                "Run program exited with code: {} ({}).",
                exit_code,
                options.mask(output.trim())
            )));
        }
        Ok(())
    }

    async fn run_program_with_output(
        &self,
        options: &RunProgramOptions,
        program: &str,
        args: &[&str],
    ) -> Result<ProgramOutput> {
        let command = self.builder.run_program_with_output(options, program, args);
        let (exit_code, host_output) = self.run(command, options).await?;
        info!(
            "Run program with output exited with code: {} ({}).",
            exit_code,
            host_output.trim()
        );
        // vmrun itself failed (login, connection); the guest files are stale.
        if VMRUN_FAILURE_CODES.contains(&exit_code) {
            return Err(CaptureError::guest(format!(
                "Run program with output exited with code: {} ({}).",
                exit_code,
                options.mask(host_output.trim())
            )));
        }

        let stdout = self.fetch_text(STDOUT_FILE).await?;
        let stderr = self.fetch_text(STDERR_FILE).await?;
        if exit_code != 0 && !stderr.trim().is_empty() {
            return Err(CaptureError::CommandFailed {
                command: options.mask(program),
                exit_code,
                output: stderr.replace('\r', "").replace("\n\n", "\n"),
            });
        }
        Ok(ProgramOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn run_batch_script_with_output(
        &self,
        options: &RunProgramOptions,
        working_dir: &str,
        env: &BTreeMap<String, String>,
        commands: &[String],
    ) -> Result<ProgramOutput> {
        let local = tempfile::Builder::new()
            .prefix("tmpBatch")
            .suffix(".bat")
            .tempfile()?;
        tokio::fs::write(local.path(), batch_script(working_dir, env, commands)).await?;

        let file_name = local
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CaptureError::InvalidState("Batch file has no name".to_string()))?;
        let guest_batch = format!(r"c:\{}", file_name);
        debug!("Name of batch file in guest: {}", guest_batch);

        self.upload_file(local.path(), &guest_batch).await?;
        let output = self
            .run_program_with_output(options, &guest_batch, &[])
            .await?;

        if let Err(e) = self.run_script("", &format!("del {}", guest_batch)).await {
            debug!("Could not delete {} from the guest: {}", guest_batch, e);
        }
        Ok(output)
    }

    async fn run_script(&self, shell: &str, script: &str) -> Result<()> {
        let args = self.builder.run_script(shell, script);
        self.run_checked("Run script", args).await
    }
}

/// Connects guests through a local `vmrun` binary.
#[derive(Clone)]
pub struct VmrunConnector {
    program: PathBuf,
    monitor: ProcessMonitor,
}

impl VmrunConnector {
    pub fn new(program: impl Into<PathBuf>, monitor: ProcessMonitor) -> Self {
        Self {
            program: program.into(),
            monitor,
        }
    }
}

impl GuestConnector for VmrunConnector {
    fn connect(&self, lease: &LeaseModel, command_id: i64) -> Result<Arc<dyn GuestCommands>> {
        let builder = VmrunCommandBuilder::from_lease(lease)?;
        Ok(Arc::new(VmrunGuest::new(
            self.program.clone(),
            builder,
            self.monitor.clone(),
            command_id,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_workpool::test_utils::test_vc_config;
    use af_workpool::InstanceModel;

    fn lease() -> LeaseModel {
        LeaseModel::new(
            InstanceModel::existing("vm-7", "Administrator", "guest-pw", true),
            test_vc_config(),
        )
    }

    #[test]
    fn test_command_prefix() {
        let builder = VmrunCommandBuilder::from_lease(&lease()).expect("Failed to build");
        let command = builder.create_directory(r"c:\thinapp-00001");
        assert_eq!(
            command,
            vec![
                "-T",
                "vc",
                "-h",
                "https://vc.example.test/sdk",
                "-u",
                "administrator",
                "-p",
                "secret",
                "-gu",
                "Administrator",
                "-gp",
                "guest-pw",
                "createDirectoryInGuest",
                "vm-7",
                r"c:\thinapp-00001",
            ]
        );
    }

    #[test]
    fn test_output_redirection() {
        let builder = VmrunCommandBuilder::from_lease(&lease()).expect("Failed to build");
        let command =
            builder.run_program_with_output(&RunProgramOptions::interactive(), "net", &["use"]);
        let tail: Vec<_> = command.iter().skip(14).map(String::as_str).collect();
        assert_eq!(
            tail,
            vec!["-interactive", "", r"net use > c:\stdout.txt 2> c:\stderr.txt"]
        );
    }

    #[test]
    fn test_display_hides_passwords() {
        let builder = VmrunCommandBuilder::from_lease(&lease()).expect("Failed to build");
        let options = RunProgramOptions::interactive().with_mask("share-pw");
        let command = builder.run_program(&options, "net", &["use", "I:", "\"share-pw\""]);
        let shown = VmrunCommandBuilder::display(&command, &options);
        assert!(!shown.contains("secret"));
        assert!(!shown.contains("guest-pw"));
        assert!(!shown.contains("share-pw"));
        assert!(shown.contains("-p ******** -gu Administrator -gp ********"));
    }

    #[test]
    fn test_lease_without_vm_is_rejected() {
        let mut lease = lease();
        lease.instance.moid = None;
        assert!(matches!(
            VmrunCommandBuilder::from_lease(&lease),
            Err(CaptureError::InvalidState(_))
        ));
    }
}
