//! Write files atomically: the destination never holds a partially written
//! file, even if the process dies mid-write.

use std::{fs, io, path::Path};

use tempfile::NamedTempFile;

/// Permissions applied to files written by [`write_file_atomic`] (owner read/write).
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Permissions applied to directories created by [`write_file_atomic`] (owner only).
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// Write `data` to `path` through a sibling temporary file.
///
/// The data is flushed and synced to the temporary file first, and only then
/// renamed over the destination. If the rename fails (e.g. crossing devices)
/// a copy-then-remove fallback is used.
pub fn write_file_atomic<P: AsRef<Path>>(path: P, data: &[u8]) -> io::Result<()> {
    use io::Write;

    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if parent != Path::new("") => {
            create_private_dir(parent)?;
            parent
        }
        _ => Path::new("."),
    };

    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(data)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    set_private_mode(temp_file.as_file())?;

    match temp_file.persist(path) {
        Ok(_) => Ok(()),
        Err(persist_error) => {
            log::debug!(
                "Failed to persist temp file over `{}`, reattempting with a copy: {}",
                path.display(),
                persist_error.error
            );
            let temp_path = persist_error.file.into_temp_path();
            fs::copy(&temp_path, path)?;
            temp_path.close()?;
            Ok(())
        }
    }
}

/// Create `dir` and any missing ancestors, readable only by the current user.
#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().recursive(true).mode(DIR_MODE).create(dir)
}

/// Create `dir` and any missing ancestors (mode bits are not supported in this
/// architecture, a regular directory is created).
#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::DirBuilder::new().recursive(true).create(dir)
}

/// Make `file` only readable by the user that created it.
#[cfg(unix)]
fn set_private_mode(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = file.metadata()?.permissions();
    // -rw-------
    perms.set_mode(FILE_MODE);
    file.set_permissions(perms)
}

/// Make `file` only readable by the user that created it (not supported in
/// this architecture, the file keeps its default permissions).
#[cfg(not(unix))]
fn set_private_mode(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("peers.dat");

        write_file_atomic(&path, b"hello").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn write_replaces_existing_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.dat");

        write_file_atomic(&path, b"first").unwrap();
        write_file_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn write_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.dat");

        write_file_atomic(&path, b"data").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn written_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.dat");

        write_file_atomic(&path, b"data").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
