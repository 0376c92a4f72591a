//! Filesystem and HTTP helpers shared by adapters, stages and the uploader

use crate::config::FileCollisionAction;
use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Maximum number of rename attempts when resolving file collisions
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Resolve a target path according to the collision action
///
/// Rename appends ` (1)`, ` (2)`, ... before the extension. Skip fails with
/// `AlreadyExists` when the target is taken. Overwrite returns the path unchanged.
///
/// # Examples
///
/// ```
/// use transfer_engine::utils::unique_path;
/// use transfer_engine::config::FileCollisionAction;
/// use std::path::Path;
///
/// let path = Path::new("/tmp/does-not-exist/movie.mkv");
/// let unique = unique_path(path, FileCollisionAction::Rename).unwrap();
/// assert_eq!(unique, path);
/// ```
pub fn unique_path(path: &Path, action: FileCollisionAction) -> Result<PathBuf> {
    match action {
        FileCollisionAction::Overwrite => Ok(path.to_path_buf()),
        FileCollisionAction::Skip => {
            if path.exists() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} already exists", path.display()),
                )));
            }
            Ok(path.to_path_buf())
        }
        FileCollisionAction::Rename => {
            if !path.exists() {
                return Ok(path.to_path_buf());
            }

            let parent = path.parent().unwrap_or_else(|| Path::new(""));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            // Directories keep dots in their names
            let (stem, ext) = if path.is_dir() {
                (name.as_str(), None)
            } else {
                match name.rsplit_once('.') {
                    Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
                    _ => (name.as_str(), None),
                }
            };

            for i in 1..=MAX_RENAME_ATTEMPTS {
                let candidate = match ext {
                    Some(ext) => parent.join(format!("{} ({}).{}", stem, i, ext)),
                    None => parent.join(format!("{} ({})", stem, i)),
                };
                if !candidate.exists() {
                    return Ok(candidate);
                }
            }

            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!(
                    "no free name for {} after {} attempts",
                    path.display(),
                    MAX_RENAME_ATTEMPTS
                ),
            )))
        }
    }
}

/// Make a remote-supplied name safe to use as a single path component
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Whether joining `relative` onto a directory stays inside that directory
pub fn is_contained(relative: &Path) -> bool {
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Extract a filename from an HTTP response
///
/// Prefers the RFC 5987 `filename*=` parameter of `Content-Disposition`, then
/// `filename=`, then the last URL path segment, then `"download"`. The result is
/// sanitized and keeps its extension.
pub fn filename_from_response(response: &reqwest::Response, url: &str) -> String {
    let disposition = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok());
    if let Some(name) = disposition.and_then(filename_from_disposition) {
        return sanitize_filename(&name);
    }

    if let Ok(parsed) = url::Url::parse(url)
        && let Some(segment) = parsed
            .path_segments()
            .and_then(|mut s| s.next_back())
            .filter(|s| !s.is_empty())
    {
        let decoded = urlencoding::decode(segment)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| segment.to_string());
        return sanitize_filename(&decoded);
    }

    "download".to_string()
}

fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';').map(str::trim) {
        if let Some(encoded) = part.strip_prefix("filename*=") {
            // charset'lang'percent-encoded
            let raw = encoded.rsplit('\'').next().unwrap_or(encoded);
            if let Ok(decoded) = urlencoding::decode(raw.trim_matches('"')) {
                return Some(decoded.into_owned());
            }
        } else if let Some(name) = part.strip_prefix("filename=") {
            plain = Some(name.trim_matches('"').to_string());
        }
    }
    plain.filter(|n| !n.is_empty())
}

/// Get available disk space for a given path
///
/// Walks up to the nearest existing ancestor so the check works before the
/// download directory is created. Uses statvfs on Unix and
/// GetDiskFreeSpaceExW on Windows.
pub fn available_space(path: &Path) -> std::io::Result<u64> {
    let mut probe = path;
    while !probe.exists() {
        match probe.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => probe = parent,
            _ => {
                probe = Path::new(".");
                break;
            }
        }
    }
    platform_available_space(probe)
}

fn platform_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is NUL-terminated and outlives the call; stat is
        // zero-initialized and only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            #[allow(clippy::unnecessary_cast)]
            let available = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
            Ok(available)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated; the out pointers reference
        // live, aligned u64 locals read only after a successful call.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut total_bytes: u64 = 0;
            let mut total_free_bytes: u64 = 0;
            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut total_bytes as *mut u64 as *mut _,
                &mut total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }
            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "disk space checking is not supported on this platform",
        ))
    }
}

/// Fail with [`Error::InsufficientSpace`] when `dir` has less than `required` bytes free
///
/// Platforms without a disk space query pass the check.
pub fn ensure_free_space(dir: &Path, required: u64) -> Result<()> {
    match available_space(dir) {
        Ok(available) if available < required => {
            Err(Error::InsufficientSpace {
                required,
                available,
            })
        }
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::debug!(?dir, error = %e, "disk space check unavailable");
            Ok(())
        }
    }
}

/// Remove a file or directory tree; a missing path is not an error
pub async fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Move a file or directory, copying when source and target are on different filesystems
pub async fn move_path(source: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(source, target).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            tracing::debug!(?source, ?target, "cross-device move, copying");
            let (src, dst) = (source.to_path_buf(), target.to_path_buf());
            tokio::task::spawn_blocking(move || copy_recursive(&src, &dst))
                .await
                .map_err(std::io::Error::other)??;
            remove_path(source).await
        }
        Err(e) => Err(e),
    }
}

fn copy_recursive(source: &Path, target: &Path) -> std::io::Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(target)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &target.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        std::fs::copy(source, target).map(|_| ())
    }
}
