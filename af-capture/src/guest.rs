//! Running programs inside a guest VM.

use crate::error::Result;
use af_workpool::LeaseModel;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Guest file receiving stdout of programs run with output.
pub const STDOUT_FILE: &str = r"c:\stdout.txt";
/// Guest file receiving stderr of programs run with output.
pub const STDERR_FILE: &str = r"c:\stderr.txt";

const MASK: &str = "********";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunProgramOptions {
    pub no_wait: bool,
    pub active_window: bool,
    pub interactive: bool,
    /// Strings hidden from logged command lines.
    pub masks: Vec<String>,
}

impl RunProgramOptions {
    /// Interactive, so programs run on the logged-in user's desktop.
    pub fn interactive() -> Self {
        Self {
            interactive: true,
            ..Self::default()
        }
    }

    pub fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    pub fn with_active_window(mut self, active_window: bool) -> Self {
        self.active_window = active_window;
        self
    }

    pub fn with_mask(mut self, secret: impl Into<String>) -> Self {
        self.masks.push(secret.into());
        self
    }

    /// Flags as understood by `vmrun`.
    pub fn to_args(&self) -> Vec<&'static str> {
        let mut args = Vec::new();
        if self.no_wait {
            args.push("-noWait");
        }
        if self.active_window {
            args.push("-activeWindow");
        }
        if self.interactive {
            args.push("-interactive");
        }
        args
    }

    pub fn mask(&self, text: &str) -> String {
        self.masks
            .iter()
            .filter(|m| !m.is_empty())
            .fold(text.to_string(), |acc, m| acc.replace(m.as_str(), MASK))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProgramOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn log(&self, program: &str) {
        debug!(
            "{} exited with {}; stdout: {:?}; stderr: {:?}",
            program, self.exit_code, self.stdout, self.stderr
        );
    }
}

#[async_trait]
pub trait GuestCommands: Send + Sync {
    async fn upload_file(&self, host_source: &Path, guest_dest: &str) -> Result<()>;

    async fn download_file(&self, guest_source: &str, host_dest: &Path) -> Result<()>;

    async fn create_directory(&self, guest_dir: &str) -> Result<()>;

    async fn run_program(
        &self,
        options: &RunProgramOptions,
        program: &str,
        args: &[&str],
    ) -> Result<()>;

    /// Run a program with stdout and stderr redirected to [`STDOUT_FILE`] and
    /// [`STDERR_FILE`], then fetch both.
    async fn run_program_with_output(
        &self,
        options: &RunProgramOptions,
        program: &str,
        args: &[&str],
    ) -> Result<ProgramOutput>;

    /// Run `commands` from a batch script that first changes to
    /// `working_dir` and sets `env`.
    async fn run_batch_script_with_output(
        &self,
        options: &RunProgramOptions,
        working_dir: &str,
        env: &BTreeMap<String, String>,
        commands: &[String],
    ) -> Result<ProgramOutput>;

    /// Run `script` with `shell`; an empty shell means `cmd.exe`.
    async fn run_script(&self, shell: &str, script: &str) -> Result<()>;
}

/// Opens a guest session for the VM behind a lease. Commands started through
/// the session are tracked under `command_id` so they can be killed.
pub trait GuestConnector: Send + Sync {
    fn connect(&self, lease: &LeaseModel, command_id: i64) -> Result<Arc<dyn GuestCommands>>;
}

/// Text of the batch script `run_batch_script_with_output` uploads.
pub fn batch_script(
    working_dir: &str,
    env: &BTreeMap<String, String>,
    commands: &[String],
) -> String {
    let mut script = format!("cd /d {}\r\n", working_dir);
    for (name, value) in env {
        script.push_str(&format!("set {}={}\r\n", name, value));
    }
    for command in commands {
        script.push_str(command);
        script.push_str("\r\n");
    }
    script
}
