use crate::error::{ExtractionError, Result};
use crate::types::TaskId;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::shared::{collect_files, extract_with_passwords};

/// Archive extractor for 7z files
pub struct SevenZipExtractor;

impl SevenZipExtractor {
    /// Try to extract a 7z archive with a single password
    pub fn try_extract(archive_path: &Path, password: &str, dest_path: &Path) -> Result<Vec<PathBuf>> {
        debug!(?archive_path, ?dest_path, "attempting 7z extraction");
        std::fs::create_dir_all(dest_path)?;

        let result = if password.is_empty() {
            sevenz_rust::decompress_file(archive_path, dest_path)
        } else {
            sevenz_rust::decompress_file_with_password(
                archive_path,
                dest_path,
                sevenz_rust::Password::from(password),
            )
        };

        if let Err(e) = result {
            let message = e.to_string();
            return Err(
                if message.contains("password")
                    || message.contains("encrypted")
                    || message.contains("Wrong password")
                {
                    ExtractionError::WrongPassword {
                        archive: archive_path.to_path_buf(),
                    }
                } else {
                    ExtractionError::Failed {
                        archive: archive_path.to_path_buf(),
                        reason: format!("failed to extract 7z archive: {}", message),
                    }
                }
                .into(),
            );
        }

        Self::validate_extracted_paths(archive_path, dest_path)?;
        let extracted = collect_files(dest_path)?;
        info!(?archive_path, files = extracted.len(), "7z extraction successful");
        Ok(extracted)
    }

    /// Every extracted path must resolve inside the destination
    fn validate_extracted_paths(archive_path: &Path, dest_path: &Path) -> Result<()> {
        let canonical_dest = dest_path.canonicalize()?;
        let mut pending = vec![dest_path.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                let canonical = path.canonicalize()?;
                if !canonical.starts_with(&canonical_dest) {
                    return Err(ExtractionError::UnsafePath {
                        archive: archive_path.to_path_buf(),
                        entry: path.display().to_string(),
                    }
                    .into());
                }
                if path.is_dir() {
                    pending.push(path);
                }
            }
        }
        Ok(())
    }

    /// Extract trying each candidate password
    pub async fn extract_with_passwords(
        task_id: TaskId,
        archive_path: &Path,
        dest_path: &Path,
        passwords: &[String],
    ) -> Result<Vec<PathBuf>> {
        extract_with_passwords("7z", Self::try_extract, task_id, archive_path, dest_path, passwords)
            .await
    }
}
