//! Crash-safe state-file sink.
//!
//! Link state and lease snapshots live under `/run/systemd/network/`. Every
//! write goes through a temporary file in the same directory that is renamed
//! into place, so external readers either see the previous contents or the
//! complete new ones, never a partial file.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Per-link status files, keyed by ifindex.
pub const LINK_STATE_DIR: &str = "/run/systemd/network/links";

/// Per-link lease snapshots, keyed by ifindex.
pub const LEASE_STATE_DIR: &str = "/run/systemd/network/leases";

/// Atomically replace `path` with `contents`, mode 0644.
///
/// On failure both the temporary file and the destination are unlinked, so a
/// reader never finds a half-written file under either name.
pub fn atomic_write(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let temp = temp_path(path);
    let result = write_and_rename(path, &temp, contents);
    if result.is_err() {
        let _ = fs::remove_file(path);
        let _ = fs::remove_file(&temp);
    }
    result
}

fn write_and_rename(path: &Path, temp: &Path, contents: &str) -> io::Result<()> {
    let mut file = fs::File::create(temp)?;
    file.set_permissions(fs::Permissions::from_mode(0o644))?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    // The rename is the last fallible step; everything before it only
    // touches the temporary file.
    fs::rename(temp, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".#{name}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_atomic_write_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3");

        atomic_write(&path, "STATE=configured\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "STATE=configured\n");
    }

    #[test]
    fn test_atomic_write_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3");

        atomic_write(&path, "STATE=configuring\n").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o644);
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3");

        atomic_write(&path, "STATE=configuring\n").unwrap();
        atomic_write(&path, "STATE=configured\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "STATE=configured\n");
    }

    #[test]
    fn test_atomic_write_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links").join("7");

        atomic_write(&path, "STATE=failed\n").unwrap();

        assert!(path.is_file());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3");

        atomic_write(&path, "STATE=configured\n").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["3"]);
    }

    #[test]
    fn test_temp_path_same_directory() {
        let temp = temp_path(Path::new("/run/systemd/network/links/3"));
        assert_eq!(temp, Path::new("/run/systemd/network/links/.#3"));
    }
}
