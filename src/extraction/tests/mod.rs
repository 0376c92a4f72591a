use super::*;
use crate::error::Error;
use std::io::Write;
use tempfile::TempDir;

fn create_zip_archive(archive_path: &Path, files: &[(&str, &[u8])]) {
    let file = std::fs::File::create(archive_path).unwrap();
    let mut writer = ::zip::ZipWriter::new(file);
    let options =
        ::zip::write::FileOptions::default().compression_method(::zip::CompressionMethod::Stored);
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
}

fn create_encrypted_zip(archive_path: &Path, file_name: &str, content: &[u8], password: &[u8]) {
    use ::zip::unstable::write::FileOptionsExt;
    let file = std::fs::File::create(archive_path).unwrap();
    let mut writer = ::zip::ZipWriter::new(file);
    let options = ::zip::write::FileOptions::default()
        .compression_method(::zip::CompressionMethod::Stored)
        .with_deprecated_encryption(password);
    writer.start_file(file_name, options).unwrap();
    writer.write_all(content).unwrap();
    writer.finish().unwrap();
}

#[test]
fn detects_types_case_insensitively() {
    assert_eq!(detect_archive_type(Path::new("a.RAR")), Some(ArchiveType::Rar));
    assert_eq!(detect_archive_type(Path::new("a.r00")), Some(ArchiveType::Rar));
    assert_eq!(detect_archive_type(Path::new("/x/b.7z")), Some(ArchiveType::SevenZip));
    assert_eq!(detect_archive_type(Path::new("c.Zip")), Some(ArchiveType::Zip));
    assert_eq!(detect_archive_type(Path::new("movie.mkv")), None);
    assert_eq!(detect_archive_type(Path::new("README")), None);
}

#[test]
fn secondary_rar_volumes_are_not_entry_points() {
    assert!(is_archive(Path::new("show.part1.rar")));
    assert!(is_archive(Path::new("show.part01.rar")));
    assert!(!is_archive(Path::new("show.part2.rar")));
    assert!(!is_archive(Path::new("show.part10.rar")));
    assert!(is_archive(Path::new("show.rar")));
}

#[test]
fn find_archives_scans_top_level_only() {
    let dir = TempDir::new().unwrap();
    for name in ["a.zip", "b.7z", "c.rar", "c.r00", "d.r00", "e.part2.rar", "notes.txt"] {
        std::fs::write(dir.path().join(name), b"x").unwrap();
    }
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/nested.zip"), b"x").unwrap();

    let names: Vec<String> = find_archives(dir.path())
        .unwrap()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["a.zip", "b.7z", "c.rar", "d.r00"]);

    let single = dir.path().join("a.zip");
    assert_eq!(find_archives(&single).unwrap(), vec![single]);
    assert!(find_archives(&dir.path().join("notes.txt")).unwrap().is_empty());
}

#[tokio::test]
async fn extracts_zip_with_nested_dirs() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("bundle.zip");
    create_zip_archive(&archive, &[("a.txt", b"alpha"), ("sub/b.txt", b"beta")]);

    let dest = dir.path().join("out");
    let files = extract_archive(TaskId(1), &archive, &dest, None).await.unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(std::fs::read(dest.join("sub/b.txt")).unwrap(), b"beta");
}

#[tokio::test]
async fn encrypted_zip_needs_the_password() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("secret.zip");
    create_encrypted_zip(&archive, "s.txt", b"secret data", b"hunter2");

    let dest = dir.path().join("ok");
    extract_archive(TaskId(1), &archive, &dest, Some("hunter2"))
        .await
        .unwrap();
    assert_eq!(std::fs::read(dest.join("s.txt")).unwrap(), b"secret data");

    let err = extract_archive(TaskId(1), &archive, &dir.path().join("bad"), Some("wrong"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Extraction(ExtractionError::WrongPassword { .. }) | Error::Extraction(ExtractionError::Failed { .. })
    ));
}

#[tokio::test]
async fn zip_entries_escaping_destination_are_rejected() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("evil.zip");
    create_zip_archive(&archive, &[("../escape.txt", b"x")]);

    let err = extract_archive(TaskId(1), &archive, &dir.path().join("out"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Extraction(ExtractionError::UnsafePath { .. })));
    assert!(!dir.path().join("escape.txt").exists());
}

#[tokio::test]
async fn extracts_7z() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("movie.txt"), b"seven").unwrap();
    let archive = dir.path().join("movie.7z");
    sevenz_rust::compress_to_path(&src, &archive).unwrap();

    let dest = dir.path().join("out");
    let files = extract_archive(TaskId(2), &archive, &dest, None).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::read(&files[0]).unwrap(), b"seven");
}

#[tokio::test]
async fn corrupt_archive_fails() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("broken.zip");
    std::fs::write(&archive, b"definitely not a zip").unwrap();

    let err = extract_archive(TaskId(3), &archive, &dir.path().join("out"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Extraction(ExtractionError::Failed { .. })));
}

#[tokio::test]
async fn unknown_extension_is_rejected() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("file.bin");
    std::fs::write(&file, b"x").unwrap();
    let err = extract_archive(TaskId(4), &file, dir.path(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Extraction(ExtractionError::UnknownFormat(_))));
}

#[test]
fn rar_password_errors_are_recognized() {
    assert!(RarExtractor::is_password_error("ERAR_BAD_PASSWORD"));
    assert!(RarExtractor::is_password_error("archive is encrypted"));
    assert!(!RarExtractor::is_password_error("ERAR_BAD_DATA"));
}
