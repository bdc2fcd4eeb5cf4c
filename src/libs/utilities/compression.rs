// Archive extraction for the download pipeline.
// Supported formats: tar.gz, tar.xz, tar.bz2, zip, and raw (a single
// uncompressed file). The format is either declared in the spec/registry
// or inferred from the URL suffix. Every entry path is validated before
// extraction: archives containing `..` components or absolute paths are
// rejected as integrity errors (zip-slip).

use crate::libs::errors::EnvboxError;
use crate::log_debug;
use bzip2::read::BzDecoder;
use colored::Colorize;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use xz2::read::XzDecoder;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    TarGz,
    TarXz,
    TarBz2,
    Zip,
    Raw,
}

impl ArchiveType {
    /// Parses a declared archive type from a spec or registry `format`.
    pub fn parse(value: &str) -> Option<ArchiveType> {
        match value.to_lowercase().as_str() {
            "tar.gz" | "targz" | "tgz" => Some(ArchiveType::TarGz),
            "tar.xz" | "tarxz" | "txz" => Some(ArchiveType::TarXz),
            "tar.bz2" | "tbz2" => Some(ArchiveType::TarBz2),
            "zip" => Some(ArchiveType::Zip),
            "raw" | "binary" => Some(ArchiveType::Raw),
            _ => None,
        }
    }

    /// Infers the archive type from a URL or file name suffix. Anything
    /// without a recognized archive suffix is treated as a raw file.
    pub fn infer_from_name(name: &str) -> ArchiveType {
        let lower = name.to_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            ArchiveType::TarGz
        } else if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            ArchiveType::TarXz
        } else if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz2") {
            ArchiveType::TarBz2
        } else if lower.ends_with(".zip") {
            ArchiveType::Zip
        } else {
            ArchiveType::Raw
        }
    }
}

impl std::fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArchiveType::TarGz => "tar.gz",
            ArchiveType::TarXz => "tar.xz",
            ArchiveType::TarBz2 => "tar.bz2",
            ArchiveType::Zip => "zip",
            ArchiveType::Raw => "raw",
        };
        f.write_str(name)
    }
}

/// Extracts the archive at `src` into `dest`, creating it when missing.
///
/// `declared` is the archive type from the spec or registry when one was
/// given; otherwise the type is inferred from the source file name.
/// Returns the destination directory.
pub fn extract_archive(
    src: &Path,
    dest: &Path,
    declared: Option<&str>,
) -> Result<PathBuf, EnvboxError> {
    let archive_type = match declared {
        Some(value) => ArchiveType::parse(value).ok_or_else(|| {
            EnvboxError::Configuration(format!("unsupported archive type '{value}'"))
        })?,
        None => ArchiveType::infer_from_name(&src.to_string_lossy()),
    };
    log_debug!(
        "[Extract] Extracting {:?} ({}) into {:?}",
        src.display().to_string().blue(),
        archive_type,
        dest.display().to_string().cyan()
    );

    fs::create_dir_all(dest).map_err(EnvboxError::from)?;

    match archive_type {
        ArchiveType::TarGz => {
            let file = File::open(src).map_err(EnvboxError::from)?;
            unpack_tar(Archive::new(GzDecoder::new(file)), dest)
        }
        ArchiveType::TarXz => {
            let file = File::open(src).map_err(EnvboxError::from)?;
            unpack_tar(Archive::new(XzDecoder::new(file)), dest)
        }
        ArchiveType::TarBz2 => {
            let file = File::open(src).map_err(EnvboxError::from)?;
            unpack_tar(Archive::new(BzDecoder::new(file)), dest)
        }
        ArchiveType::Zip => unpack_zip(src, dest),
        ArchiveType::Raw => {
            // A raw download is a single file; it is copied into the
            // destination keeping its name.
            let file_name = src.file_name().ok_or_else(|| {
                EnvboxError::Filesystem(format!("source path {:?} has no file name", src))
            })?;
            fs::copy(src, dest.join(file_name)).map_err(EnvboxError::from)?;
            Ok(dest.to_path_buf())
        }
    }
}

/// Rejects entry paths that would escape the extraction directory.
fn validate_entry_path(entry: &Path) -> Result<(), EnvboxError> {
    if entry.is_absolute() {
        return Err(EnvboxError::Integrity(format!(
            "archive entry {:?} has an absolute path",
            entry
        )));
    }
    for component in entry.components() {
        if matches!(component, Component::ParentDir) {
            return Err(EnvboxError::Integrity(format!(
                "archive entry {:?} contains a path traversal component",
                entry
            )));
        }
    }
    Ok(())
}

fn unpack_tar<R: Read>(mut archive: Archive<R>, dest: &Path) -> Result<PathBuf, EnvboxError> {
    let entries = archive.entries().map_err(|err| {
        EnvboxError::Integrity(format!("malformed tar archive: {err}"))
    })?;
    for entry in entries {
        let mut entry = entry.map_err(|err| {
            EnvboxError::Integrity(format!("malformed tar entry: {err}"))
        })?;
        let path = entry
            .path()
            .map_err(|err| EnvboxError::Integrity(format!("malformed tar entry path: {err}")))?
            .into_owned();
        validate_entry_path(&path)?;
        // unpack_in refuses escapes as well; the explicit validation above
        // turns them into integrity errors instead of silent skips.
        entry
            .unpack_in(dest)
            .map_err(|err| EnvboxError::Integrity(format!("failed to unpack {path:?}: {err}")))?;
    }
    Ok(dest.to_path_buf())
}

fn unpack_zip(src: &Path, dest: &Path) -> Result<PathBuf, EnvboxError> {
    let file = File::open(src).map_err(EnvboxError::from)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|err| EnvboxError::Integrity(format!("malformed zip archive: {err}")))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| EnvboxError::Integrity(format!("malformed zip entry: {err}")))?;
        // enclosed_name() is None exactly when the stored name escapes the
        // extraction root.
        let Some(relative) = entry.enclosed_name() else {
            return Err(EnvboxError::Integrity(format!(
                "zip entry {:?} contains a path traversal component",
                entry.name()
            )));
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(EnvboxError::from)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(EnvboxError::from)?;
        }
        let mut out_file = File::create(&out_path).map_err(EnvboxError::from)?;
        io::copy(&mut entry, &mut out_file).map_err(EnvboxError::from)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))
                .map_err(EnvboxError::from)?;
        }
    }
    Ok(dest.to_path_buf())
}

/// Identifies the effective root of an extracted archive. Release
/// tarballs usually wrap their content in one top-level directory; when
/// exactly one non-hidden top-level directory exists, that directory is
/// the root, otherwise the extraction directory itself is.
pub fn detect_extracted_root(dir: &Path) -> Result<PathBuf, EnvboxError> {
    let mut visible: Vec<PathBuf> = Vec::new();
    let mut has_files = false;
    for entry in fs::read_dir(dir).map_err(EnvboxError::from)? {
        let entry = entry.map_err(EnvboxError::from)?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type().map_err(EnvboxError::from)?.is_dir() {
            visible.push(entry.path());
        } else {
            has_files = true;
        }
    }
    if visible.len() == 1 && !has_files {
        Ok(visible.remove(0))
    } else {
        Ok(dir.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            // `append_data` validates the path and rejects `..` components,
            // so traversal entries are written via the raw name bytes and
            // the unvalidated `append` to exercise our own defenses.
            let name_bytes = name.as_bytes();
            header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn archive_type_inference() {
        assert_eq!(ArchiveType::infer_from_name("go1.25.1.tar.gz"), ArchiveType::TarGz);
        assert_eq!(ArchiveType::infer_from_name("node.tar.xz"), ArchiveType::TarXz);
        assert_eq!(ArchiveType::infer_from_name("tool.zip"), ArchiveType::Zip);
        assert_eq!(ArchiveType::infer_from_name("jq-linux-amd64"), ArchiveType::Raw);
    }

    #[test]
    fn tar_round_trip_preserves_layout() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("go.tar.gz");
        write_tar_gz(
            &archive,
            &[("go/bin/go", b"binary-go"), ("go/bin/gofmt", b"binary-gofmt")],
        );

        let dest = dir.path().join("extracted");
        extract_archive(&archive, &dest, None).unwrap();
        assert_eq!(fs::read(dest.join("go/bin/go")).unwrap(), b"binary-go");

        let root = detect_extracted_root(&dest).unwrap();
        assert_eq!(root, dest.join("go"));
    }

    #[test]
    fn traversal_entries_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.tar.gz");
        write_tar_gz(&archive, &[("../escape", b"nope")]);

        let dest = dir.path().join("extracted");
        let err = extract_archive(&archive, &dest, None).unwrap_err();
        assert!(matches!(err, EnvboxError::Integrity(_)));
        assert!(!dir.path().join("escape").exists());
    }

    #[test]
    fn raw_files_are_copied_through() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("jq-linux-amd64");
        fs::write(&src, b"jq binary").unwrap();

        let dest = dir.path().join("out");
        extract_archive(&src, &dest, Some("raw")).unwrap();
        assert_eq!(fs::read(dest.join("jq-linux-amd64")).unwrap(), b"jq binary");
    }

    #[test]
    fn multiple_top_level_dirs_keep_extract_dir_as_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        assert_eq!(detect_extracted_root(dir.path()).unwrap(), dir.path());
    }
}
