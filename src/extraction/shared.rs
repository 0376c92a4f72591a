use crate::error::{Error, ExtractionError, Result};
use crate::types::{ArchiveType, TaskId};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

/// Later volumes of a multi-part RAR set (`.part2.rar`, `.part10.rar`, ...)
static SECONDARY_RAR_VOLUME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\.part0*([2-9]|[1-9]\d+)\.rar$").ok());

/// Detect archive type by file extension
///
/// Supports RAR (.rar, .r00), 7z (.7z), and ZIP (.zip) formats.
pub fn detect_archive_type(path: &Path) -> Option<ArchiveType> {
    let ext = path.extension()?.to_str()?.to_lowercase();

    match ext.as_str() {
        "rar" | "r00" => Some(ArchiveType::Rar),
        "7z" => Some(ArchiveType::SevenZip),
        "zip" => Some(ArchiveType::Zip),
        _ => None,
    }
}

/// Whether `path` is the entry point of an archive
///
/// Follow-up volumes of split RAR sets are not; extracting the first volume
/// reads them.
pub fn is_archive(path: &Path) -> bool {
    if detect_archive_type(path).is_none() {
        return false;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    !SECONDARY_RAR_VOLUME
        .as_ref()
        .is_some_and(|re| re.is_match(&name))
}

/// Archives at the top level of `path`, or `path` itself when it is one
pub fn find_archives(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(if is_archive(path) {
            vec![path.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    let mut archives = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let path = entry?.path();
        if path.is_file() && is_archive(&path) {
            archives.push(path);
        }
    }
    // A set with a .rar file starts there, not at .r00
    let has_rar = |stem: &std::ffi::OsStr| {
        archives
            .iter()
            .any(|a| a.file_stem() == Some(stem) && a.extension().is_some_and(|e| e.eq_ignore_ascii_case("rar")))
    };
    let r00_duplicates: Vec<PathBuf> = archives
        .iter()
        .filter(|a| a.extension().is_some_and(|e| e.eq_ignore_ascii_case("r00")))
        .filter(|a| a.file_stem().is_some_and(has_rar))
        .cloned()
        .collect();
    archives.retain(|a| !r00_duplicates.contains(a));
    archives.sort();
    debug!(?path, count = archives.len(), "archives found");
    Ok(archives)
}

/// Recursively collect all files (not directories) below `dir`
pub(crate) fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Try each candidate password with `try_extract_fn` off the async runtime
///
/// A wrong password moves on to the next candidate; any other failure stops.
pub(crate) async fn extract_with_passwords(
    format_name: &str,
    try_extract_fn: impl Fn(&Path, &str, &Path) -> Result<Vec<PathBuf>> + Send + 'static + Clone,
    task_id: TaskId,
    archive_path: &Path,
    dest_path: &Path,
    passwords: &[String],
) -> Result<Vec<PathBuf>> {
    info!(
        task_id = task_id.0,
        ?archive_path,
        candidates = passwords.len(),
        "extracting {} archive",
        format_name
    );

    for (i, password) in passwords.iter().enumerate() {
        let archive = archive_path.to_path_buf();
        let dest = dest_path.to_path_buf();
        let password = password.clone();
        let try_fn = try_extract_fn.clone();

        let result = spawn_blocking(move || try_fn(&archive, &password, &dest))
            .await
            .map_err(|e| ExtractionError::Failed {
                archive: archive_path.to_path_buf(),
                reason: format!("extraction task panicked: {}", e),
            })?;

        match result {
            Ok(files) => {
                info!(
                    task_id = task_id.0,
                    ?archive_path,
                    files = files.len(),
                    "{} extraction successful",
                    format_name
                );
                return Ok(files);
            }
            Err(Error::Extraction(ExtractionError::WrongPassword { .. })) => {
                debug!(task_id = task_id.0, attempt = i + 1, "wrong password, trying next");
            }
            Err(e) => {
                warn!(task_id = task_id.0, ?archive_path, error = %e, "{} extraction failed", format_name);
                return Err(e);
            }
        }
    }

    Err(ExtractionError::WrongPassword {
        archive: archive_path.to_path_buf(),
    }
    .into())
}
