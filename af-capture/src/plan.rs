//! Turns a capture request into a ready-to-run `Capturer`: shares to mount,
//! downloads to start and the capture mode.

use crate::automatic::AutomaticMode;
use crate::capturer::{CaptureContext, CaptureInputs, CaptureMode, Capturer};
use crate::command::PhaseCommands;
use crate::download::HttpDownloader;
use crate::drive::{DriveLetter, DriveLetters};
use crate::error::{CaptureError, Result};
use crate::manual::ManualMode;
use crate::mounter::{unc_path, Mounter, ShareSpec};
use crate::packager::ThinAppRuntime;
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use url::Url;

pub const DATASTORE_SCHEME: &str = "datastore";

/// A file share that holds inputs or receives projects.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datastore {
    pub id: String,
    pub name: String,
    pub server: String,
    pub share: String,
    pub username: String,
    pub password: String,
    /// Where the share is mounted on this host, if it is.
    pub mount_path: Option<PathBuf>,
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("server", &self.server)
            .field("share", &self.share)
            .field("mount_path", &self.mount_path)
            .finish_non_exhaustive()
    }
}

impl Datastore {
    fn share_spec(&self, path: &str) -> ShareSpec {
        ShareSpec {
            unc: unc_path(&self.server, &self.share, path),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[async_trait::async_trait]
pub trait DatastoreDirectory: Send + Sync {
    async fn datastore(&self, id: &str) -> Result<Datastore>;

    /// Datastore receiving installer downloads. It must be mounted on this host.
    async fn download_datastore(&self) -> Result<Datastore>;
}

/// An input of the capture: `http(s)://...` to download, or
/// `datastore://<id>/<path>` on a datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFile {
    pub url: String,
    /// Overrides the file name taken from the URL.
    #[serde(default)]
    pub filename: String,
}

impl ProjectFile {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLocation {
    pub datastore_id: String,
    pub path: String,
}

/// What a client asks for when it creates a capture ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketRequest {
    pub workpool_id: String,
    pub inputs: Vec<ProjectFile>,
    pub output: OutputLocation,
    pub runtime: ThinAppRuntime,
    #[serde(default)]
    pub commands: PhaseCommands,
    pub automatic: bool,
}

pub struct RequestFactory {
    context: CaptureContext,
    datastores: Arc<dyn DatastoreDirectory>,
    downloader: HttpDownloader,
}

impl RequestFactory {
    pub fn new(
        context: CaptureContext,
        datastores: Arc<dyn DatastoreDirectory>,
        downloader: HttpDownloader,
    ) -> Self {
        Self {
            context,
            datastores,
            downloader,
        }
    }

    pub fn context(&self) -> &CaptureContext {
        &self.context
    }

    /// Build the capturer for `request`. Downloads start right away.
    pub async fn create_capturer(
        &self,
        request: &TicketRequest,
        project_id: i64,
        status: Status,
    ) -> Result<Capturer> {
        let mut letters = DriveLetters::<String>::new();
        letters.reserve_letter(DriveLetter::O);

        let output = self.datastores.datastore(&request.output.datastore_id).await?;
        let output_mounter = Mounter::new(DriveLetter::O, output.share_spec(&request.output.path));

        let mut http_inputs = Vec::new();
        let mut datastore_inputs = Vec::new();
        for input in &request.inputs {
            let url = Url::parse(&input.url).map_err(|e| {
                CaptureError::InvalidInput(format!("Bad input URL {}: {}", input.url, e))
            })?;
            match url.scheme() {
                "http" | "https" => http_inputs.push(url),
                DATASTORE_SCHEME => datastore_inputs.push((url, input.filename.clone())),
                other => {
                    return Err(CaptureError::InvalidInput(format!(
                        "Unsupported input scheme {} in {}",
                        other, input.url
                    )))
                }
            }
        }

        let mut input_mounters = Vec::new();
        let mut download_dir = None;
        let mut download_drive = None;

        if !http_inputs.is_empty() {
            let store = self.datastores.download_datastore().await?;
            let mount_path = store.mount_path.clone().ok_or_else(|| {
                CaptureError::InvalidInput(format!(
                    "Download datastore {} is not mounted on this host",
                    store.name
                ))
            })?;
            let relative = format!(
                "{}project-{}",
                self.context.config.installers_dir, project_id
            );
            let drive = letters.reserve(DriveLetter::I)?;
            input_mounters.push(Mounter::new(drive, store.share_spec(&relative)));
            download_drive = Some(drive);
            download_dir = Some(mount_path.join(&relative));
        }

        let mut drive_files: BTreeMap<DriveLetter, Vec<String>> = BTreeMap::new();
        for (url, filename) in datastore_inputs {
            let datastore_id = url.host_str().unwrap_or_default().to_string();
            let path = url.path().trim_start_matches('/');
            let (parent, name) = match path.rfind('/') {
                Some(i) => (&path[..i], &path[i + 1..]),
                None => ("", path),
            };
            let name = if filename.is_empty() { name.to_string() } else { filename };
            if name.is_empty() {
                return Err(CaptureError::InvalidInput(format!(
                    "No file name in {}",
                    url
                )));
            }

            let key = format!("{}/{}", datastore_id, parent);
            let (drive, new) = letters.reserve_with_key(key, DriveLetter::I)?;
            if new {
                let store = self.datastores.datastore(&datastore_id).await?;
                input_mounters.push(Mounter::new(drive, store.share_spec(parent)));
            }
            drive_files.entry(drive).or_default().push(name);
        }

        // Downloads start last so a rejected request leaves nothing running.
        let mut downloads = Vec::new();
        let mut download_dirs = Vec::new();
        if let Some(dir) = download_dir {
            tokio::fs::create_dir_all(&dir).await?;
            for url in http_inputs {
                debug!("Downloading {} to {}", url, dir.display());
                downloads.push(self.downloader.spawn_download(url, dir.clone()));
            }
            download_dirs.push(dir);
        }

        let mode: Box<dyn CaptureMode> = if request.automatic {
            Box::new(AutomaticMode::new())
        } else {
            Box::new(ManualMode::new())
        };

        let inputs = CaptureInputs {
            input_mounters,
            output_mounter,
            downloads,
            download_dirs,
            download_drive,
            drive_files,
            runtime: request.runtime.clone(),
            commands: request.commands.clone(),
        };
        Ok(Capturer::new(
            self.context.clone(),
            mode,
            status,
            project_id,
            inputs,
        ))
    }
}
