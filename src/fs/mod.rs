//! Small filesystem helpers shared by the on-disk stores and the cache.
//!
//! Everything written under the home directory is private to the user:
//! directories are created 0700, files 0600, and every write goes through a
//! temp file in the same directory followed by a rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{BundleError, Result};

#[cfg(unix)]
const PRIVATE_DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const PRIVATE_FILE_MODE: u32 = 0o600;

/// Create `dir` (and parents) with owner-only permissions.
pub fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(PRIVATE_DIR_MODE))?;
    }
    Ok(())
}

/// Atomically replace `path` with `contents`, mode 0600.
pub fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        BundleError::InvariantViolated(format!("{} has no parent directory", path.display()))
    })?;
    if !dir.exists() {
        create_private_dir(dir)?;
    }

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(PRIVATE_FILE_MODE))?;
    }
    tmp.persist(path).map_err(|e| BundleError::Io(e.error))?;
    Ok(())
}

/// Read a file, mapping a missing file to `NotFound`.
pub fn read_existing(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(BundleError::not_found(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Remove a file, mapping a missing file to `NotFound`.
pub fn remove_existing(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(BundleError::not_found(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Files directly inside `dir` with the given extension, sorted by name.
/// A missing directory is treated as empty.
pub fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// A file name for an arbitrary key: the key itself when it is already a
/// safe file name, otherwise its blake3 hash.
pub fn safe_file_name(key: &str) -> String {
    let safe = !key.is_empty()
        && key.len() <= 200
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if safe {
        key.to_string()
    } else {
        blake3::hash(key.as_bytes()).to_hex().to_string()
    }
}
