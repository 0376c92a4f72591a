use crate::error::{Error, ExtractionError, Result};
use crate::types::TaskId;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use super::shared::extract_with_passwords;

/// Archive extractor for RAR files
pub struct RarExtractor;

impl RarExtractor {
    /// Check if an unrar error indicates a password problem
    pub(crate) fn is_password_error(message: &str) -> bool {
        message.contains("password")
            || message.contains("encrypted")
            || message.contains("ERAR_BAD_PASSWORD")
    }

    fn convert_unrar_error(e: unrar::error::UnrarError, archive_path: &Path) -> Error {
        let message = e.to_string();
        if Self::is_password_error(&message) {
            ExtractionError::WrongPassword {
                archive: archive_path.to_path_buf(),
            }
            .into()
        } else {
            ExtractionError::Failed {
                archive: archive_path.to_path_buf(),
                reason: message,
            }
            .into()
        }
    }

    /// Try to extract a RAR archive with a single password
    pub fn try_extract(archive_path: &Path, password: &str, dest_path: &Path) -> Result<Vec<PathBuf>> {
        debug!(?archive_path, ?dest_path, "attempting RAR extraction");
        std::fs::create_dir_all(dest_path)?;

        let archive = if password.is_empty() {
            unrar::Archive::new(archive_path)
        } else {
            unrar::Archive::with_password(archive_path, password.as_bytes())
        };
        let mut at_header = archive
            .open_for_processing()
            .map_err(|e| Self::convert_unrar_error(e, archive_path))?;

        let mut extracted = Vec::new();
        loop {
            let at_file = match at_header.read_header() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(Self::convert_unrar_error(e, archive_path)),
            };
            let header = at_file.entry();

            if Path::new(&header.filename)
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
            {
                return Err(ExtractionError::UnsafePath {
                    archive: archive_path.to_path_buf(),
                    entry: header.filename.display().to_string(),
                }
                .into());
            }
            let file_path = dest_path.join(&header.filename);

            at_header = if header.is_directory() {
                at_file
                    .skip()
                    .map_err(|e| Self::convert_unrar_error(e, archive_path))?
            } else {
                let next = at_file
                    .extract_to(&file_path)
                    .map_err(|e| Self::convert_unrar_error(e, archive_path))?;
                extracted.push(file_path);
                next
            };
        }

        info!(?archive_path, files = extracted.len(), "RAR extraction successful");
        Ok(extracted)
    }

    /// Extract trying each candidate password
    pub async fn extract_with_passwords(
        task_id: TaskId,
        archive_path: &Path,
        dest_path: &Path,
        passwords: &[String],
    ) -> Result<Vec<PathBuf>> {
        extract_with_passwords("RAR", Self::try_extract, task_id, archive_path, dest_path, passwords)
            .await
    }
}
