use crate::drive::DriveLetter;
use crate::error::{CaptureError, Result};
use crate::guest::{GuestCommands, RunProgramOptions};
use tracing::info;

/// A network share and how to mount it inside the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareSpec {
    pub unc: String,
    pub username: String,
    pub password: String,
}

/// Mounts one share on one guest drive, remembering whether it did.
#[derive(Debug)]
pub struct Mounter {
    drive: DriveLetter,
    share: ShareSpec,
    mounted: bool,
}

impl Mounter {
    pub fn new(drive: DriveLetter, share: ShareSpec) -> Self {
        Self {
            drive,
            share,
            mounted: false,
        }
    }

    pub fn drive(&self) -> DriveLetter {
        self.drive
    }

    pub fn share(&self) -> &ShareSpec {
        &self.share
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// `net use` the share on its drive. Returns the drive string.
    pub async fn mount(&mut self, guest: &dyn GuestCommands) -> Result<String> {
        let drive = self.drive.drive_string();
        let unc = format!("\"{}\"", self.share.unc);
        let password = format!("\"{}\"", self.share.password);
        let user = format!("/user:{}", self.share.username);
        let options = RunProgramOptions::interactive().with_mask(self.share.password.clone());

        info!("Mounting {} on {}", self.share.unc, drive);
        guest
            .run_program_with_output(&options, "net", &["use", &drive, &unc, &password, &user])
            .await
            .map_err(|e| {
                let message = e.to_string().replace('\r', "").replace("\n\n", "\n");
                CaptureError::Mount(format!(
                    "Failed to mount {} to drive {} in capturer: {}",
                    self.share.unc,
                    drive,
                    options.mask(message.trim())
                ))
            })?;
        self.mounted = true;
        Ok(drive)
    }

    pub async fn unmount(&mut self, guest: &dyn GuestCommands) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        let drive = self.drive.drive_string();
        info!("Unmounting {}", drive);
        guest
            .run_program_with_output(
                &RunProgramOptions::interactive(),
                "net",
                &["use", &drive, "/delete", "/yes"],
            )
            .await?;
        self.mounted = false;
        Ok(())
    }
}

/// `\\server\share\path` from parts that may carry their own slashes.
pub fn unc_path(server: &str, share: &str, path: &str) -> String {
    let trim = |s: &str| s.trim_matches(|c: char| c == '\\' || c == '/').replace('/', "\\");
    let mut unc = format!(r"\\{}\{}", trim(server), trim(share));
    let path = trim(path);
    if !path.is_empty() {
        unc.push('\\');
        unc.push_str(&path);
    }
    unc
}
