//! Shared filesystem helpers: directory creation and `0600` enforcement.
//!
//! Grounded on `envvault`'s audit-log permission handling (set `0600` right
//! after creating a file, ignore the call on non-Unix targets).

use std::fs;
use std::io;
use std::path::Path;

/// Ensures `dir` exists, creating parent directories as needed.
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Writes `contents` to `path` and restricts its mode to `0600` on Unix.
pub fn write_restricted(path: &Path, contents: &[u8]) -> io::Result<()> {
    fs::write(path, contents)?;
    restrict(path)
}

/// Sets `0600` on `path` if it exists. No-op on non-Unix targets.
pub fn restrict(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn write_restricted_sets_0600() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        write_restricted(&path, b"hello").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
