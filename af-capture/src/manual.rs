//! Capture where a person installs the application on the guest desktop.

use crate::capturer::{CaptureMode, CaptureSession};
use crate::command::ConversionPhase;
use crate::error::Result;
use crate::guest::RunProgramOptions;
use crate::state::CaptureState;
use async_trait::async_trait;

pub const GUEST_SETOPTION_EXE: &str = r"C:\setoption.exe";

#[derive(Debug, Default)]
pub struct ManualMode;

impl ManualMode {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CaptureMode for ManualMode {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn verify_logged_in(&self, session: &CaptureSession) -> Result<()> {
        if !session.lease.instance.autologon {
            session.status.set_current_state(CaptureState::NeedsLoginWait);
            session.status.wait_until(CaptureState::NeedsLoginDone).await;
            session.check_cancel()?;
        }
        session
            .echo_test("Guest login for manual capture did not become interactive")
            .await
    }

    async fn pre_capture(&self, session: &CaptureSession) -> Result<()> {
        session.check_cancel()?;
        session.upload_set_option(GUEST_SETOPTION_EXE).await
    }

    async fn install_application(&self, session: &CaptureSession) -> Result<()> {
        session.check_cancel()?;
        let options = RunProgramOptions::interactive()
            .with_active_window(true)
            .with_no_wait(true);
        let drive = session.first_input_drive().drive_string();
        session
            .guest
            .run_program_with_output(&options, "explorer", &[&drive])
            .await?;

        session.check_cancel()?;
        session.status.set_current_state(CaptureState::InstallationWait);
        session.status.wait_until(CaptureState::InstallationDone).await;
        session.check_cancel()
    }

    /// Prebuild commands still run so quality reports can be collected.
    async fn pre_build(&self, session: &CaptureSession) -> Result<()> {
        session
            .run_commands(&session.commands_for(ConversionPhase::Prebuild), "C:\\", false)
            .await
    }
}
