//! Crash-safe file writes.
//!
//! Data goes to a temporary sibling created with its final permissions, is
//! synced, then renamed over the target. Readers see the old file or the new
//! one, never a partial write, and the content is never visible under a wider
//! mode than requested.

use std::io::Write;
use std::path::{Path, PathBuf};

/// Credential material: owner read/write only
pub const OWNER_ONLY: u32 = 0o600;

/// General cache files
pub const SHARED_READ: u32 = 0o644;

/// Atomically replace `path` with `data`, created with `mode` on Unix
pub fn write_atomic(path: &Path, data: &[u8], mode: u32) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let tmp = temp_sibling(parent, path);
    let result = write_new(&tmp, data, mode).and_then(|()| std::fs::rename(&tmp, path));
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Write a file readable only by its owner (0600 on Unix)
pub fn write_owner_only(path: &Path, data: &[u8]) -> std::io::Result<()> {
    write_atomic(path, data, OWNER_ONLY)
}

fn temp_sibling(parent: &Path, path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent.join(format!(
        ".{}.{}-{:08x}.tmp",
        name,
        std::process::id(),
        rand::random::<u32>()
    ))
}

fn write_new(path: &Path, data: &[u8], mode: u32) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()?;

    // The umask may have narrowed the creation mode
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}
