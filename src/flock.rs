use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Name of the exclusive writer lock file inside a journal directory.
pub const LOCK_FILE_NAME: &str = "lock.lock";

/// Exclusive writer lock for a journal directory.
///
/// The lock is advisory and owned by the process: the OS drops it when the
/// holder exits, so a crashed writer never wedges its journal. The lock
/// file is stamped with the journal name and holder pid; a second writer
/// losing the race gets that stamp back in its [`Error::ConcurrentWriter`],
/// which is what makes "who holds my journal?" answerable from the error
/// alone.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

impl FileLock {
    /// Takes the writer lock for `journal` inside its directory. Fails with
    /// [`Error::ConcurrentWriter`] naming the current holder when the lock
    /// is taken.
    pub fn acquire(dir: &Path, journal: &str) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        // Existing stamp must survive a failed attempt, so no truncate here.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::Io(format!("{}: {e}", path.display())))?;

        if !try_exclusive(&file)? {
            return Err(Error::ConcurrentWriter(format!(
                "{}, {}",
                path.display(),
                holder_stamp(&file)
            )));
        }

        let mut lock = Self { file, path };
        lock.stamp(journal)?;
        Ok(lock)
    }

    /// Get the path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stamp(&mut self, journal: &str) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{journal} pid={}", std::process::id())?;
        self.file.flush()?;
        Ok(())
    }
}

// The OS releases the lock when the last handle to the file closes; the
// lock file itself stays behind so a competing writer probing for the lock
// never races an unlink.

/// Best-effort read of the holder's stamp for diagnostics.
fn holder_stamp(mut file: &File) -> String {
    let mut stamp = String::new();
    let _ = file.seek(SeekFrom::Start(0));
    if file.read_to_string(&mut stamp).is_ok() && !stamp.trim().is_empty() {
        format!("held by {}", stamp.trim())
    } else {
        "holder unknown".to_string()
    }
}

/// One non-blocking attempt at the exclusive lock; `Ok(false)` means
/// another process holds it.
#[cfg(unix)]
fn try_exclusive(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.kind() {
        std::io::ErrorKind::WouldBlock => Ok(false),
        _ => Err(err.into()),
    }
}

#[cfg(windows)]
fn try_exclusive(file: &File) -> Result<bool> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let locked = unsafe {
        LockFileEx(
            file.as_raw_handle() as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            std::ptr::null_mut(),
        )
    };
    Ok(locked != 0)
}

#[cfg(not(any(unix, windows)))]
fn try_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}
