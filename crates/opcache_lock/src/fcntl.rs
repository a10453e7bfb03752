//! `fcntl` record lock over a throwaway file descriptor.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::LockError;
use crate::Lock;

/// An exclusive write lock on byte 0 of an unlinked file.
///
/// The backing file is removed right after it is opened, so it leaves no trace
/// on the filesystem while the descriptor stays valid for the life of the
/// process. Processes share the lock by inheriting the descriptor across
/// `fork`.
#[derive(Debug)]
pub struct FcntlLock {
    file: File,
    identity: PathBuf,
}

impl FcntlLock {
    /// Opens (creating if needed) the file at `path` and unlinks it.
    ///
    /// An already existing file is reused.
    pub fn create(path: &Path) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(path)
            .map_err(|source| LockError::Unavailable {
                identity: path.to_path_buf(),
                source,
            })?;

        // Another process may have unlinked it between our open and this call.
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "could not unlink lock file");
            }
        }

        Ok(Self {
            file,
            identity: path.to_path_buf(),
        })
    }

    /// Returns the path the lock was created from.
    pub fn identity(&self) -> &Path {
        &self.identity
    }

    /// Closes the descriptor, releasing any lock still held.
    pub fn destroy(self) {
        drop(self);
    }

    fn lock_reg(&self, cmd: libc::c_int, lock_type: libc::c_int) -> io::Result<()> {
        // SAFETY: `flock` is a plain C struct; all-zero is a valid bit pattern.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = lock_type as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = 0;
        fl.l_len = 1;

        loop {
            // SAFETY: the descriptor is owned by `self.file` and `fl` outlives the call.
            let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), cmd, &mut fl as *mut libc::flock) };
            if rc != -1 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Lock for FcntlLock {
    fn lock(&self) -> Result<(), LockError> {
        self.lock_reg(libc::F_SETLKW, libc::F_WRLCK)
            .map_err(|source| LockError::Io {
                op: "fcntl(F_SETLKW)",
                source,
            })
    }

    fn try_lock(&self) -> Result<bool, LockError> {
        match self.lock_reg(libc::F_SETLK, libc::F_WRLCK) {
            Ok(()) => Ok(true),
            Err(e)
                if matches!(e.raw_os_error(), Some(code) if code == libc::EAGAIN || code == libc::EACCES) =>
            {
                Ok(false)
            }
            Err(source) => Err(LockError::Io {
                op: "fcntl(F_SETLK)",
                source,
            }),
        }
    }

    fn unlock(&self) -> Result<(), LockError> {
        self.lock_reg(libc::F_SETLK, libc::F_UNLCK)
            .map_err(|source| LockError::Io {
                op: "fcntl(F_UNLCK)",
                source,
            })
    }

    fn kind(&self) -> &'static str {
        "fcntl"
    }
}
