//! Extract stage

use crate::config::FileCollisionAction;
use crate::error::{Error, Result};
use crate::extraction::{detect_archive_type, extract_archive, find_archives};
use crate::types::{ArchiveType, TaskId};
use crate::utils::{remove_path, unique_path};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STAGE: &str = "extract";

static RAR_SET: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^(.*?)(\.part\d+)?\.(rar|r\d\d)$").ok());

fn failure(message: impl Into<String>) -> Error {
    Error::Processing {
        stage: STAGE.to_string(),
        message: message.into(),
        retryable: false,
    }
}

/// Name shared by all volumes of a RAR set
fn rar_set_base(name: &str) -> Option<String> {
    let captures = RAR_SET.as_ref()?.captures(name)?;
    Some(captures.get(1)?.as_str().to_lowercase())
}

/// The archive and, for RAR sets, its sibling volumes
fn archive_volumes(archive: &Path) -> Vec<PathBuf> {
    let mut volumes = vec![archive.to_path_buf()];
    if detect_archive_type(archive) != Some(ArchiveType::Rar) {
        return volumes;
    }
    let (Some(dir), Some(base)) = (
        archive.parent(),
        archive
            .file_name()
            .and_then(|n| rar_set_base(&n.to_string_lossy())),
    ) else {
        return volumes;
    };
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let sibling = entry.file_name().to_string_lossy().into_owned();
            if path != archive && rar_set_base(&sibling).as_deref() == Some(base.as_str()) {
                volumes.push(path);
            }
        }
    }
    volumes
}

/// Directory next to the artifact that receives the extracted files
fn output_dir(artifact: &Path) -> Result<PathBuf> {
    let stem = if artifact.is_dir() {
        artifact.file_name()
    } else {
        artifact.file_stem()
    }
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_else(|| "download".to_string());
    let parent = artifact.parent().unwrap_or_else(|| Path::new("."));
    unique_path(
        &parent.join(format!("{}.extracted", stem)),
        FileCollisionAction::Rename,
    )
}

/// Extract every archive in `artifact` into `<stem>.extracted`
///
/// Returns the new artifact path: the output directory, or `artifact`
/// unchanged when it holds no archives. On failure the output directory is
/// removed and the archives are left in place.
pub(crate) async fn run(
    id: TaskId,
    artifact: &Path,
    delete_archive: bool,
    password: Option<&str>,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let archives = find_archives(artifact)
        .map_err(|e| failure(format!("cannot scan {}: {}", artifact.display(), e)))?;
    if archives.is_empty() {
        info!(task_id = id.0, ?artifact, "no archives found, skipping extraction");
        return Ok(artifact.to_path_buf());
    }

    let dest = output_dir(artifact)?;
    debug!(task_id = id.0, ?dest, archives = archives.len(), "extracting");

    for archive in &archives {
        if cancel.is_cancelled() {
            let _ = remove_path(&dest).await;
            return Err(Error::Cancelled);
        }
        if let Err(e) = extract_archive(id, archive, &dest, password).await {
            if let Err(cleanup) = remove_path(&dest).await {
                warn!(task_id = id.0, ?dest, error = %cleanup, "failed to remove partial extraction");
            }
            return Err(failure(e.to_string()));
        }
    }

    if delete_archive {
        for archive in &archives {
            for volume in archive_volumes(archive) {
                if let Err(e) = remove_path(&volume).await {
                    warn!(task_id = id.0, ?volume, error = %e, "failed to delete archive");
                }
            }
        }
    }

    info!(task_id = id.0, ?dest, "extraction complete");
    Ok(dest)
}
