// Low-level filesystem operations shared by the installers and the state
// store: atomic writes, rename with cross-device fallback, symlink
// replacement and executable bits.

use crate::log_debug;
use colored::Colorize;
use std::fs;
use std::io;
use std::path::Path;

/// Writes `bytes` to `path` atomically: the content goes to `<path>.tmp`
/// first and is renamed over the destination, so readers never observe a
/// partially written file. The parent directory is created when missing.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = temp_sibling(path);
    fs::write(&tmp_path, bytes)?;
    match fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            // Leave nothing behind on failure.
            let _ = fs::remove_file(&tmp_path);
            Err(err)
        }
    }
}

/// The `.tmp` sibling used for staged writes of `path`.
pub fn temp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Moves `src` to `dst`, preferring an atomic rename. When the rename
/// fails because source and destination live on different filesystems,
/// the content is copied recursively and the source removed.
pub fn rename_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            log_debug!(
                "[Files] Cross-device rename from {:?} to {:?}; falling back to copy",
                src.display().to_string().dimmed(),
                dst.display().to_string().dimmed()
            );
            if src.is_dir() {
                copy_dir_recursive(src, dst)?;
                fs::remove_dir_all(src)
            } else {
                fs::copy(src, dst)?;
                fs::remove_file(src)
            }
        }
        Err(err) => Err(err),
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(link_target, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Creates (or replaces) a symlink at `link` pointing to `target`.
/// An existing file or symlink at `link` is removed first.
pub fn replace_symlink(target: &Path, link: &Path) -> io::Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    // symlink_metadata (not metadata) so dangling links are also detected.
    if fs::symlink_metadata(link).is_ok() {
        fs::remove_file(link)?;
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(not(unix))]
    {
        let _ = target;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlink placement is only supported on unix",
        ))
    }
}

/// Marks a file executable (0o755) on unix.
pub fn make_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Removes a file or directory tree if present; missing paths are fine.
pub fn remove_path_if_exists(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_parents_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/state.json");
        atomic_write(&path, b"{}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");
        assert!(!temp_sibling(&path).exists());
    }

    #[test]
    fn replace_symlink_overwrites_existing_link() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        fs::write(&first, b"a").unwrap();
        fs::write(&second, b"b").unwrap();

        let link = dir.path().join("bin/tool");
        replace_symlink(&first, &link).unwrap();
        replace_symlink(&second, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), second);
    }

    #[test]
    fn remove_path_tolerates_missing_targets() {
        let dir = tempfile::tempdir().unwrap();
        remove_path_if_exists(&dir.path().join("nothing-here")).unwrap();
    }
}
