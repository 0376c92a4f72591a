use crate::error::{Error, ExtractionError, Result};
use crate::types::TaskId;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::shared::extract_with_passwords;

/// Archive extractor for ZIP files
pub struct ZipExtractor;

fn is_password_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("password") || message.contains("encrypted")
}

impl ZipExtractor {
    /// Open a ZIP entry by index, decrypting when a password is given
    fn open_entry<'a>(
        archive: &'a mut zip::ZipArchive<std::fs::File>,
        index: usize,
        password: &str,
        archive_path: &Path,
    ) -> Result<zip::read::ZipFile<'a>> {
        let read_failure = |e: zip::result::ZipError| -> Error {
            let message = e.to_string();
            if is_password_error(&message) {
                ExtractionError::WrongPassword {
                    archive: archive_path.to_path_buf(),
                }
                .into()
            } else {
                ExtractionError::Failed {
                    archive: archive_path.to_path_buf(),
                    reason: format!("failed to read ZIP entry: {}", message),
                }
                .into()
            }
        };

        if password.is_empty() {
            archive.by_index(index).map_err(read_failure)
        } else {
            archive
                .by_index_decrypt(index, password.as_bytes())
                .map_err(read_failure)?
                .map_err(|_| {
                    ExtractionError::WrongPassword {
                        archive: archive_path.to_path_buf(),
                    }
                    .into()
                })
        }
    }

    /// Write one entry below `dest_path`; returns the file written, if any
    fn extract_entry(
        mut file: zip::read::ZipFile,
        dest_path: &Path,
        archive_path: &Path,
    ) -> Result<Option<PathBuf>> {
        let Some(relative) = file.enclosed_name().map(Path::to_path_buf) else {
            return Err(ExtractionError::UnsafePath {
                archive: archive_path.to_path_buf(),
                entry: file.name().to_string(),
            }
            .into());
        };
        let file_path = dest_path.join(relative);

        if file.is_dir() {
            std::fs::create_dir_all(&file_path)?;
            return Ok(None);
        }
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut outfile = std::fs::File::create(&file_path)?;
        std::io::copy(&mut file, &mut outfile).map_err(|e| -> Error {
            if is_password_error(&e.to_string()) {
                ExtractionError::WrongPassword {
                    archive: archive_path.to_path_buf(),
                }
                .into()
            } else {
                ExtractionError::Failed {
                    archive: archive_path.to_path_buf(),
                    reason: format!("failed to extract {}: {}", file_path.display(), e),
                }
                .into()
            }
        })?;
        Ok(Some(file_path))
    }

    /// Try to extract a ZIP archive with a single password
    pub fn try_extract(archive_path: &Path, password: &str, dest_path: &Path) -> Result<Vec<PathBuf>> {
        debug!(?archive_path, ?dest_path, "attempting ZIP extraction");
        std::fs::create_dir_all(dest_path)?;

        let file = std::fs::File::open(archive_path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| ExtractionError::Failed {
            archive: archive_path.to_path_buf(),
            reason: format!("failed to read ZIP archive: {}", e),
        })?;

        let mut extracted = Vec::new();
        for i in 0..archive.len() {
            let entry = Self::open_entry(&mut archive, i, password, archive_path)?;
            if let Some(path) = Self::extract_entry(entry, dest_path, archive_path)? {
                extracted.push(path);
            }
        }

        info!(?archive_path, files = extracted.len(), "ZIP extraction successful");
        Ok(extracted)
    }

    /// Extract trying each candidate password
    pub async fn extract_with_passwords(
        task_id: TaskId,
        archive_path: &Path,
        dest_path: &Path,
        passwords: &[String],
    ) -> Result<Vec<PathBuf>> {
        extract_with_passwords("ZIP", Self::try_extract, task_id, archive_path, dest_path, passwords)
            .await
    }
}
