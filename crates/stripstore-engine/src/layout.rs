//! On-disk layout of the store's base directory
//!
//! ```text
//! <basedir>/fsid                     uuid text, write-locked while mounted
//! <basedir>/store_version            little-endian u32 format version
//! <basedir>/current/                 KV backend directory
//! <basedir>/current/store.redb       the database file
//! <basedir>/current/commit_op_seq    reserved
//! ```

use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::{pathconf, PathconfVar};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use stripstore_common::{Error, Result, StoreStatFs};
use tracing::debug;
use uuid::Uuid;

/// Current on-disk format version
pub const STORE_VERSION: u32 = 1;

/// Name of the database file inside `current/`
pub const DB_FILE: &str = "store.redb";

pub(crate) fn fsid_path(basedir: &Path) -> PathBuf {
    basedir.join("fsid")
}

pub(crate) fn version_path(basedir: &Path) -> PathBuf {
    basedir.join("store_version")
}

pub(crate) fn current_path(basedir: &Path) -> PathBuf {
    basedir.join("current")
}

pub(crate) fn db_path(basedir: &Path) -> PathBuf {
    current_path(basedir).join(DB_FILE)
}

pub(crate) fn commit_op_seq_path(basedir: &Path) -> PathBuf {
    current_path(basedir).join("commit_op_seq")
}

/// Take an exclusive POSIX record lock on the whole file. Fails with `Busy`
/// if another process holds it. The lock lives as long as the open file.
pub(crate) fn lock_fsid(file: &File) -> Result<()> {
    let fl = libc::flock {
        l_type: libc::F_WRLCK as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&fl)).map_err(|_| {
        Error::busy("failed to lock fsid, is another store process running?")
    })?;
    Ok(())
}

/// Open the fsid file, creating it when `create` is set.
pub(crate) fn open_fsid(basedir: &Path, create: bool) -> Result<File> {
    let path = fsid_path(basedir);
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .open(&path)
        .map_err(Error::from)
}

/// Read the uuid stored in the fsid file; `None` if empty.
pub(crate) fn read_fsid(file: &mut File) -> Result<Option<Uuid>> {
    file.seek(SeekFrom::Start(0))?;
    let mut text = String::new();
    file.read_to_string(&mut text)?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let uuid = text
        .parse::<Uuid>()
        .map_err(|e| Error::invalid_argument(format!("malformed fsid: {e}")))?;
    Ok(Some(uuid))
}

/// Overwrite the fsid file with `uuid` and sync it.
pub(crate) fn write_fsid(file: &mut File, uuid: Uuid) -> Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{uuid}")?;
    file.sync_data()?;
    Ok(())
}

/// Write the current version stamp.
pub(crate) fn write_version_stamp(basedir: &Path) -> Result<()> {
    std::fs::write(version_path(basedir), STORE_VERSION.to_le_bytes())?;
    Ok(())
}

/// Read the version stamp; `None` if the file does not exist.
pub(crate) fn read_version_stamp(basedir: &Path) -> Result<Option<u32>> {
    let raw = match std::fs::read(version_path(basedir)) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let bytes: [u8; 4] = raw
        .as_slice()
        .try_into()
        .map_err(|_| Error::storage("malformed store_version"))?;
    Ok(Some(u32::from_le_bytes(bytes)))
}

/// Create `current/` and the reserved `commit_op_seq` file.
pub(crate) fn create_current(basedir: &Path) -> Result<PathBuf> {
    let current = current_path(basedir);
    match std::fs::create_dir(&current) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if !current.is_dir() {
                return Err(Error::invalid_argument(format!(
                    "{} exists but is not a directory",
                    current.display()
                )));
            }
        }
        Err(e) => return Err(e.into()),
    }
    let op_seq = commit_op_seq_path(basedir);
    if !op_seq.exists() {
        File::create(&op_seq)?;
    }
    debug!(path = %current.display(), "current/ ready");
    Ok(current)
}

/// Filesystem stats for the base directory.
pub(crate) fn stat_fs(basedir: &Path) -> Result<StoreStatFs> {
    let vfs = nix::sys::statvfs::statvfs(basedir)
        .map_err(|e| Error::storage(format!("statvfs: {e}")))?;
    let frsize = vfs.fragment_size() as u64;
    Ok(StoreStatFs {
        total_bytes: vfs.blocks() as u64 * frsize,
        available_bytes: vfs.blocks_available() as u64 * frsize,
        free_bytes: vfs.blocks_free() as u64 * frsize,
    })
}

/// Maximum file name length the base directory's filesystem supports.
pub(crate) fn max_name_length(basedir: &Path) -> Result<u64> {
    let limit = pathconf(basedir, PathconfVar::NAME_MAX)
        .map_err(|e| Error::storage(format!("pathconf(NAME_MAX): {e}")))?;
    limit
        .map(|v| v as u64)
        .ok_or_else(|| Error::storage("no file name length limit reported"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fsid_roundtrip() {
        let dir = tempdir().unwrap();
        let mut file = open_fsid(dir.path(), true).unwrap();
        assert!(read_fsid(&mut file).unwrap().is_none());

        let uuid = Uuid::new_v4();
        write_fsid(&mut file, uuid).unwrap();
        assert_eq!(read_fsid(&mut file).unwrap(), Some(uuid));
    }

    #[test]
    fn test_version_stamp_roundtrip() {
        let dir = tempdir().unwrap();
        assert_eq!(read_version_stamp(dir.path()).unwrap(), None);
        write_version_stamp(dir.path()).unwrap();
        assert_eq!(read_version_stamp(dir.path()).unwrap(), Some(STORE_VERSION));
    }

    #[test]
    fn test_create_current_idempotent() {
        let dir = tempdir().unwrap();
        let first = create_current(dir.path()).unwrap();
        let second = create_current(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(commit_op_seq_path(dir.path()).exists());
    }

    #[test]
    fn test_lock_fsid_same_process_succeeds() {
        // POSIX record locks are per-process; same-process relock succeeds.
        let dir = tempdir().unwrap();
        let file = open_fsid(dir.path(), true).unwrap();
        lock_fsid(&file).unwrap();
        let file2 = open_fsid(dir.path(), false).unwrap();
        lock_fsid(&file2).unwrap();
    }

    #[test]
    fn test_stat_fs_reports_space() {
        let dir = tempdir().unwrap();
        let stats = stat_fs(dir.path()).unwrap();
        assert!(stats.total_bytes > 0);
    }

    #[test]
    fn test_max_name_length() {
        let dir = tempdir().unwrap();
        assert!(max_name_length(dir.path()).unwrap() >= 14);
    }
}
