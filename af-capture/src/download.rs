//! Installer downloads onto a share that is later mounted in the guest.

use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub url: String,
    pub filename: String,
    pub download_dir: PathBuf,
    pub succeeded: bool,
    pub message: String,
}

/// Last non-empty path segment of `url`, or `download` when it has none.
pub fn file_name_of(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
        .unwrap_or_else(|| "download".to_string())
}

#[derive(Clone, Default)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Download `url` into `download_dir`. Failures are reported in the result.
    pub async fn download(&self, url: Url, download_dir: PathBuf) -> DownloadResult {
        let filename = file_name_of(&url);
        let mut result = DownloadResult {
            url: url.to_string(),
            filename,
            download_dir,
            succeeded: false,
            message: String::new(),
        };
        let target = result.download_dir.join(&result.filename);
        match self.fetch(&url, &target).await {
            Ok(bytes) => {
                info!("Downloaded {} ({} bytes) to {}", url, bytes, target.display());
                result.succeeded = true;
            }
            Err(message) => {
                warn!("Download of {} failed: {}", url, message);
                result.message = message;
            }
        }
        result
    }

    async fn fetch(&self, url: &Url, target: &Path) -> std::result::Result<u64, String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| e.to_string())?;

        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| e.to_string())?;
        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            file.write_all(&chunk).await.map_err(|e| e.to_string())?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(written)
    }

    pub fn spawn_download(&self, url: Url, download_dir: PathBuf) -> JoinHandle<DownloadResult> {
        let downloader = self.clone();
        tokio::spawn(async move { downloader.download(url, download_dir).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_of() {
        let url = Url::parse("https://dl.example.test/apps/setup.msi").expect("Failed to parse");
        assert_eq!(file_name_of(&url), "setup.msi");
        let url = Url::parse("https://dl.example.test/apps/").expect("Failed to parse");
        assert_eq!(file_name_of(&url), "apps");
        let url = Url::parse("https://dl.example.test").expect("Failed to parse");
        assert_eq!(file_name_of(&url), "download");
    }

    #[tokio::test]
    async fn test_unreachable_url_reports_failure() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let url = Url::parse("http://127.0.0.1:1/setup.exe").expect("Failed to parse");
        let result = HttpDownloader::default()
            .spawn_download(url, dir.path().to_path_buf())
            .await
            .expect("Download task panicked");
        assert!(!result.succeeded);
        assert!(!result.message.is_empty());
        assert_eq!(result.filename, "setup.exe");
    }
}
