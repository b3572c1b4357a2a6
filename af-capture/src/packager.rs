use crate::error::{CaptureError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Capture runtime version staged into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinAppRuntime {
    pub version: String,
}

impl ThinAppRuntime {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

/// Produces the self-extracting runtime package uploaded as `package.exe`.
#[async_trait]
pub trait RuntimePackager: Send + Sync {
    /// Returns a host file the caller owns and deletes when done.
    async fn create_package(&self, runtime: &ThinAppRuntime) -> Result<PathBuf>;
}

/// Serves packages built ahead of time under `<root>/<version>/package.exe`.
pub struct PrebuiltPackager {
    root: PathBuf,
}

impl PrebuiltPackager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn source(&self, runtime: &ThinAppRuntime) -> PathBuf {
        self.root.join(&runtime.version).join("package.exe")
    }
}

#[async_trait]
impl RuntimePackager for PrebuiltPackager {
    async fn create_package(&self, runtime: &ThinAppRuntime) -> Result<PathBuf> {
        let source = self.source(runtime);
        if !tokio::fs::try_exists(&source).await? {
            return Err(CaptureError::InvalidInput(format!(
                "No runtime package for version {} at {}",
                runtime.version,
                source.display()
            )));
        }
        let (_, target) = tempfile::Builder::new()
            .prefix("package")
            .suffix(".exe")
            .tempfile()?
            .keep()
            .map_err(|e| CaptureError::Io(e.error))?;
        tokio::fs::copy(&source, &target).await?;
        debug!("Staged runtime {} at {}", runtime.version, target.display());
        Ok(target)
    }
}

/// Remove a package handed out by a packager, ignoring a missing file.
pub async fn discard_package(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!("Could not remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copies_prebuilt_package() {
        let root = tempfile::tempdir().expect("Failed to create temp dir");
        let version_dir = root.path().join("5.2.0");
        std::fs::create_dir_all(&version_dir).expect("Failed to create version dir");
        std::fs::write(version_dir.join("package.exe"), b"MZ").expect("Failed to write package");

        let packager = PrebuiltPackager::new(root.path());
        let package = packager
            .create_package(&ThinAppRuntime::new("5.2.0"))
            .await
            .expect("Failed to create package");
        assert_eq!(std::fs::read(&package).expect("Failed to read"), b"MZ");

        discard_package(&package).await;
        assert!(!package.exists());
    }

    #[tokio::test]
    async fn test_unknown_version_is_rejected() {
        let root = tempfile::tempdir().expect("Failed to create temp dir");
        let packager = PrebuiltPackager::new(root.path());
        let result = packager.create_package(&ThinAppRuntime::new("9.9")).await;
        assert!(matches!(result, Err(CaptureError::InvalidInput(_))));
    }
}
