use crate::state::CaptureState;
use af_workpool::WorkpoolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// The capture was asked to stop. Not a failure.
    #[error("Capture request was canceled")]
    Canceled,

    #[error("Failed to download {url} to directory {directory}: {message}")]
    DownloadFailed {
        url: String,
        directory: String,
        message: String,
    },

    /// A guest program exited non-zero and wrote to stderr.
    #[error("{command} exited with code {exit_code}: {output}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("Build incomplete. Found package.ro.tvr* files.")]
    BuildIncomplete,

    #[error("{0}")]
    Mount(String),

    #[error("State {0} is not nextable.")]
    NotNextable(CaptureState),

    #[error("Unknown ticket: {0}")]
    UnknownTicket(u64),

    #[error("Guest error: {0}")]
    Guest(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Workpool(#[from] WorkpoolError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    pub fn guest(message: impl std::fmt::Display) -> Self {
        Self::Guest(message.to_string())
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
