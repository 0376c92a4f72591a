//! Hand-off of finished artifacts to a destination store
//!
//! The engine calls [`UploadDispatcher::upload`] once per task after
//! post-processing. [`LocalUploader`] moves the artifact into a directory
//! tree; remote stores implement the same trait.

use crate::config::{FileCollisionAction, UploadConfig};
use crate::error::{Error, Result};
use crate::types::Destination;
use crate::utils::{is_contained, move_path, unique_path};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Store-specific identifier of an uploaded artifact
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadReference(pub String);

impl std::fmt::Display for UploadReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pushes an artifact to its destination
#[async_trait]
pub trait UploadDispatcher: Send + Sync {
    /// Upload `artifact` (file or directory); errors use [`Error::Upload`]
    async fn upload(&self, artifact: &Path, destination: &Destination) -> Result<UploadReference>;
}

/// Moves artifacts under a local root directory
///
/// `destination.target` is a relative subdirectory of the root. Name
/// collisions follow the configured [`FileCollisionAction`].
pub struct LocalUploader {
    root: PathBuf,
    collision: FileCollisionAction,
}

impl LocalUploader {
    /// Uploader rooted at `root`
    pub fn new(root: impl Into<PathBuf>, collision: FileCollisionAction) -> Self {
        Self {
            root: root.into(),
            collision,
        }
    }

    /// Uploader from configuration
    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.root.clone(), config.file_collision)
    }

    fn target_dir(&self, destination: &Destination) -> Result<PathBuf> {
        if destination.kind != "local" {
            return Err(Error::Upload {
                message: format!("unsupported destination kind: {}", destination.kind),
                transient: false,
            });
        }
        let relative = Path::new(destination.target.trim_start_matches('/'));
        if !is_contained(relative) {
            return Err(Error::Upload {
                message: format!("destination escapes upload root: {}", destination.target),
                transient: false,
            });
        }
        Ok(self.root.join(relative))
    }
}

/// Map a filesystem failure to an upload error
fn io_failure(context: &str, e: std::io::Error) -> Error {
    let transient = matches!(
        e.kind(),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    );
    Error::Upload {
        message: format!("{}: {}", context, e),
        transient,
    }
}

#[async_trait]
impl UploadDispatcher for LocalUploader {
    async fn upload(&self, artifact: &Path, destination: &Destination) -> Result<UploadReference> {
        let name = artifact.file_name().ok_or_else(|| Error::Upload {
            message: format!("artifact has no file name: {}", artifact.display()),
            transient: false,
        })?;
        if tokio::fs::symlink_metadata(artifact).await.is_err() {
            return Err(Error::Upload {
                message: format!("artifact does not exist: {}", artifact.display()),
                transient: false,
            });
        }

        let dir = self.target_dir(destination)?;
        let target = unique_path(&dir.join(name), self.collision).map_err(|e| match e {
            Error::Io(io) => io_failure("target unavailable", io),
            other => other,
        })?;
        debug!(?artifact, ?target, collision = ?self.collision, "moving artifact");

        if self.collision == FileCollisionAction::Overwrite && target.exists() {
            crate::utils::remove_path(&target)
                .await
                .map_err(|e| io_failure("failed to replace existing target", e))?;
        }
        move_path(artifact, &target)
            .await
            .map_err(|e| io_failure("failed to move artifact", e))?;

        info!(?target, "artifact stored");
        Ok(UploadReference(target.display().to_string()))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::IsRetryable;
    use tempfile::TempDir;

    fn local(target: &str) -> Destination {
        Destination {
            kind: "local".into(),
            target: target.into(),
        }
    }

    #[tokio::test]
    async fn moves_file_into_target_dir() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let artifact = src.path().join("movie.mkv");
        std::fs::write(&artifact, b"data").unwrap();

        let uploader = LocalUploader::new(root.path(), FileCollisionAction::Rename);
        let reference = uploader.upload(&artifact, &local("films")).await.unwrap();

        let stored = root.path().join("films").join("movie.mkv");
        assert_eq!(reference.0, stored.display().to_string());
        assert_eq!(std::fs::read(&stored).unwrap(), b"data");
        assert!(!artifact.exists());
    }

    #[tokio::test]
    async fn rename_on_collision() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("a.txt"), b"old").unwrap();
        let artifact = src.path().join("a.txt");
        std::fs::write(&artifact, b"new").unwrap();

        let uploader = LocalUploader::new(root.path(), FileCollisionAction::Rename);
        uploader.upload(&artifact, &local("")).await.unwrap();
        assert_eq!(std::fs::read(root.path().join("a (1).txt")).unwrap(), b"new");
        assert_eq!(std::fs::read(root.path().join("a.txt")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn overwrite_replaces_directories() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("album")).unwrap();
        std::fs::write(root.path().join("album/stale.flac"), b"x").unwrap();
        let artifact = src.path().join("album");
        std::fs::create_dir_all(&artifact).unwrap();
        std::fs::write(artifact.join("track.flac"), b"y").unwrap();

        let uploader = LocalUploader::new(root.path(), FileCollisionAction::Overwrite);
        uploader.upload(&artifact, &local("")).await.unwrap();
        assert!(root.path().join("album/track.flac").exists());
        assert!(!root.path().join("album/stale.flac").exists());
    }

    #[tokio::test]
    async fn skip_collision_is_permanent_failure() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("a.txt"), b"old").unwrap();
        let artifact = src.path().join("a.txt");
        std::fs::write(&artifact, b"new").unwrap();

        let uploader = LocalUploader::new(root.path(), FileCollisionAction::Skip);
        let err = uploader.upload(&artifact, &local("")).await.unwrap_err();
        assert!(matches!(err, Error::Upload { transient: false, .. }));
        assert!(artifact.exists());
    }

    #[tokio::test]
    async fn rejects_escaping_targets_and_foreign_kinds() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let artifact = src.path().join("a.txt");
        std::fs::write(&artifact, b"x").unwrap();
        let uploader = LocalUploader::new(root.path(), FileCollisionAction::Rename);

        let err = uploader.upload(&artifact, &local("../outside")).await.unwrap_err();
        assert!(!err.is_retryable());

        let drive = Destination {
            kind: "drive".into(),
            target: "folder-id".into(),
        };
        assert!(uploader.upload(&artifact, &drive).await.is_err());
        assert!(artifact.exists());
    }

    #[tokio::test]
    async fn missing_artifact_fails() {
        let root = TempDir::new().unwrap();
        let uploader = LocalUploader::new(root.path(), FileCollisionAction::Rename);
        let err = uploader
            .upload(&root.path().join("nope.bin"), &local(""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upload { .. }));
    }
}
