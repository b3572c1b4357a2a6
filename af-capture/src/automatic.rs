//! Unattended capture driven by per-phase command lists.

use crate::capturer::{CaptureMode, CaptureSession};
use crate::command::{Command, ConversionPhase};
use crate::error::{CaptureError, Result};
use crate::guest::RunProgramOptions;
use crate::state::CaptureState;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Guest directory the recipe runs in.
pub const JOBDIR: &str = r"c:\jobdir";
pub const GUEST_SETOPTION_EXE: &str = r"c:\jobdir\setoption.exe";

/// Placeholder in install commands for the first downloaded installer.
const DOWNLOAD_PLACEHOLDER: &str = "%D";

#[derive(Debug, Default)]
pub struct AutomaticMode;

impl AutomaticMode {
    pub fn new() -> Self {
        Self
    }

    /// `copy` lines bringing downloads and listed input files into the job directory.
    fn copy_commands(session: &CaptureSession) -> Vec<String> {
        let mut copies = Vec::new();
        if let Some(drive) = session.download_drive {
            for download in &session.downloads {
                copies.push(format!(
                    "copy \"{}\\{}\" {}",
                    drive, download.filename, JOBDIR
                ));
            }
        }
        for (drive, files) in &session.drive_files {
            for file in files {
                copies.push(format!("copy \"{}\\{}\" {}", drive, file, JOBDIR));
            }
        }
        copies
    }

    /// Install commands refer to installers on the input shares.
    fn expand_install_command(session: &CaptureSession, command: &Command) -> Command {
        let expanded = match session.downloads.first() {
            None => format!("\"{}\\{}\"", session.first_input_drive(), command.command),
            Some(download) if command.command.contains(DOWNLOAD_PLACEHOLDER) => {
                let drive = session
                    .download_drive
                    .unwrap_or_else(|| session.first_input_drive());
                let installer = format!("\"{}\\{}\"", drive, download.filename);
                command.command.replace(DOWNLOAD_PLACEHOLDER, &installer)
            }
            Some(_) => command.command.clone(),
        };
        Command::new(command.label.clone(), expanded)
    }

    async fn run_phase(
        &self,
        session: &CaptureSession,
        phase: ConversionPhase,
        wait: CaptureState,
        done: CaptureState,
    ) -> Result<()> {
        session.status.set_current_state(wait);
        session
            .run_commands(&session.commands_for(phase), JOBDIR, true)
            .await?;
        session.status.set_current_state(done);
        Ok(())
    }
}

#[async_trait]
impl CaptureMode for AutomaticMode {
    fn name(&self) -> &'static str {
        "automatic"
    }

    async fn verify_logged_in(&self, session: &CaptureSession) -> Result<()> {
        if !session.lease.instance.autologon {
            return Err(CaptureError::guest(
                "Automatic capture on a non-autologon VM will fail.",
            ));
        }
        session
            .echo_test("Virtual machine marked for autologon is not responding.")
            .await
    }

    async fn pre_capture(&self, session: &CaptureSession) -> Result<()> {
        session.status.set_current_state(CaptureState::PreCaptureWait);
        session.check_cancel()?;

        session
            .guest
            .run_program_with_output(&RunProgramOptions::default(), "mkdir", &[JOBDIR])
            .await?;
        session.upload_set_option(GUEST_SETOPTION_EXE).await?;

        let copies = Self::copy_commands(session);
        if !copies.is_empty() {
            session
                .guest
                .run_batch_script_with_output(
                    &RunProgramOptions::default(),
                    "c:\\",
                    &BTreeMap::new(),
                    &copies,
                )
                .await?
                .log("copy inputs");
        }

        session
            .run_commands(
                &session.commands_for(ConversionPhase::Precapture),
                JOBDIR,
                true,
            )
            .await
    }

    async fn before_pre_capture_snapshot(&self, session: &CaptureSession) -> Result<()> {
        session.status.set_current_state(CaptureState::PreCaptureDone);
        Ok(())
    }

    async fn pre_install(&self, session: &CaptureSession) -> Result<()> {
        self.run_phase(
            session,
            ConversionPhase::Preinstall,
            CaptureState::PreInstallationWait,
            CaptureState::PreInstallationDone,
        )
        .await
    }

    async fn install_application(&self, session: &CaptureSession) -> Result<()> {
        session.status.set_current_state(CaptureState::InstallationWait);
        let commands: Vec<Command> = session
            .commands_for(ConversionPhase::Install)
            .iter()
            .map(|c| Self::expand_install_command(session, c))
            .collect();
        session.run_commands(&commands, JOBDIR, true).await?;
        session.status.set_current_state(CaptureState::InstallationDone);
        Ok(())
    }

    async fn post_install(&self, session: &CaptureSession) -> Result<()> {
        self.run_phase(
            session,
            ConversionPhase::Postinstall,
            CaptureState::PostInstallationWait,
            CaptureState::PostInstallationDone,
        )
        .await
    }

    async fn pre_build(&self, session: &CaptureSession) -> Result<()> {
        self.run_phase(
            session,
            ConversionPhase::Prebuild,
            CaptureState::PreProjectBuildWait,
            CaptureState::PreProjectBuildDone,
        )
        .await
    }
}
