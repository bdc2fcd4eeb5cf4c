// Executable detection for binary auto-discovery.
// When a runtime or tool spec lists no binaries, the installer scans the
// install root (preferring its `bin/` directory) and links everything that
// looks like a program. "Looks like" combines the unix executable bit with
// header sniffing, so stray shell scripts and data files are not linked.

use crate::log_debug;
use colored::Colorize;
use goblin::Object;
use std::fs;
use std::path::{Path, PathBuf};

/// Whether the file at `path` is an executable program: the executable
/// bit is set and the content parses as ELF or Mach-O (or carries a
/// shebang, which covers interpreter-launched tools).
pub fn is_executable_file(path: &Path) -> bool {
    if !has_executable_bit(path) {
        return false;
    }
    let Ok(data) = fs::read(path) else {
        return false;
    };
    if data.starts_with(b"#!") {
        return true;
    }
    match Object::parse(&data) {
        Ok(Object::Elf(_)) | Ok(Object::Mach(_)) => true,
        Ok(_) | Err(_) => false,
    }
}

#[cfg(unix)]
fn has_executable_bit(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn has_executable_bit(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// Lists the executables directly under `dir` (no recursion), sorted by
/// file name. Returns an empty list when the directory is missing.
pub fn detect_binaries(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| is_executable_file(&entry.path()))
        .filter_map(|entry| entry.file_name().to_str().map(|s| s.to_string()))
        .collect();
    names.sort();
    log_debug!(
        "[Binary] Detected {} executable(s) under {}",
        names.len(),
        dir.display().to_string().dimmed()
    );
    names
}

/// The directory binaries live in for an install root: `<root>/bin` when
/// it exists, otherwise the root itself.
pub fn binary_dir(install_root: &Path) -> PathBuf {
    let bin = install_root.join("bin");
    if bin.is_dir() { bin } else { install_root.to_path_buf() }
}

/// Recursively finds executables under `root`, bounded by `max_depth`.
/// Release archives sometimes bury the binary one or two directories
/// deep; this walk recovers it when the top-level scan comes up empty.
pub fn find_executables(root: &Path, max_depth: usize) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .max_depth(max_depth)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_executable_file(path))
        .collect();
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn write_executable(path: &Path, contents: &[u8]) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, contents).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn shebang_scripts_count_as_executables() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tool");
        write_executable(&script, b"#!/bin/sh\necho hi\n");
        assert!(is_executable_file(&script));
    }

    #[cfg(unix)]
    #[test]
    fn data_files_are_not_detected() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("README");
        fs::write(&data, b"not a program").unwrap();
        assert!(!is_executable_file(&data));
        assert!(detect_binaries(dir.path()).is_empty());
    }

    #[test]
    fn binary_dir_prefers_bin_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(binary_dir(dir.path()), dir.path());
        fs::create_dir(dir.path().join("bin")).unwrap();
        assert_eq!(binary_dir(dir.path()), dir.path().join("bin"));
    }

    #[cfg(unix)]
    #[test]
    fn recursive_search_recovers_buried_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("release/linux-amd64");
        fs::create_dir_all(&nested).unwrap();
        write_executable(&nested.join("tool"), b"#!/bin/sh\necho tool\n");
        fs::write(nested.join("LICENSE"), b"text").unwrap();

        let found = find_executables(dir.path(), 4);
        assert_eq!(found, vec![nested.join("tool")]);
    }
}
