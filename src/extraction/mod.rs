//! Archive extraction
//!
//! Extracts RAR, 7z and ZIP archives, optionally with a password. Entries
//! that would land outside the destination directory abort the extraction.

mod rar;
mod sevenz;
mod shared;
mod zip;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use rar::RarExtractor;
pub use sevenz::SevenZipExtractor;
pub use shared::{detect_archive_type, find_archives, is_archive};
pub(crate) use shared::collect_files;
pub use zip::ZipExtractor;

use crate::error::{ExtractionError, Result};
use crate::types::{ArchiveType, TaskId};
use std::path::{Path, PathBuf};
use tracing::info;

/// Passwords to try, in order: the given one, then none
fn candidates(password: Option<&str>) -> Vec<String> {
    match password.filter(|p| !p.is_empty()) {
        Some(p) => vec![p.to_string(), String::new()],
        None => vec![String::new()],
    }
}

/// Extract one archive into `dest_path`, routing by extension
///
/// Returns the extracted files.
pub async fn extract_archive(
    task_id: TaskId,
    archive_path: &Path,
    dest_path: &Path,
    password: Option<&str>,
) -> Result<Vec<PathBuf>> {
    let archive_type = detect_archive_type(archive_path)
        .ok_or_else(|| ExtractionError::UnknownFormat(archive_path.to_path_buf()))?;
    info!(task_id = task_id.0, ?archive_path, ?archive_type, "extracting archive");

    let passwords = candidates(password);
    match archive_type {
        ArchiveType::Rar => {
            RarExtractor::extract_with_passwords(task_id, archive_path, dest_path, &passwords).await
        }
        ArchiveType::SevenZip => {
            SevenZipExtractor::extract_with_passwords(task_id, archive_path, dest_path, &passwords)
                .await
        }
        ArchiveType::Zip => {
            ZipExtractor::extract_with_passwords(task_id, archive_path, dest_path, &passwords).await
        }
    }
}
