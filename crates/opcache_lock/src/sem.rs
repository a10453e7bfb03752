//! System V counting semaphore.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::LockError;
use crate::Lock;

/// Permission bits for newly created semaphore sets.
const SEM_PERMS: libc::c_int = 0o666;

/// A single System V semaphore used as a lock or as a counting gate.
///
/// Used as a lock it is created with an initial value of 1: `lock` decrements
/// (blocking at zero) and `unlock` increments. Both operations carry
/// `SEM_UNDO`, so the kernel restores the count if a holder dies. Used as a
/// gate, the count tracks active readers and [`wait_for_zero`](Self::wait_for_zero)
/// blocks until all of them have left.
///
/// The handle that created the set removes it when dropped; handles that
/// opened an existing set leave it in place.
#[derive(Debug)]
pub struct SemaphoreLock {
    semid: libc::c_int,
    identity: PathBuf,
    owner: bool,
}

impl SemaphoreLock {
    /// Creates the semaphore keyed by `ftok(identity, proj)`, or a private one
    /// when `identity` is `None`.
    ///
    /// If a semaphore already exists under the key it is opened as-is and its
    /// current value is left untouched; only a fresh set is set to `initval`.
    pub fn create(identity: Option<&Path>, proj: i32, initval: i32) -> Result<Self, LockError> {
        let shown = identity
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("IPC_PRIVATE"));
        let unavailable = |source: io::Error| LockError::Unavailable {
            identity: shown.clone(),
            source,
        };

        let key = match identity {
            Some(path) => {
                let c_path = CString::new(path.as_os_str().as_bytes())
                    .map_err(|e| unavailable(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
                // SAFETY: `c_path` is a valid NUL-terminated string for the call's duration.
                let key = unsafe { libc::ftok(c_path.as_ptr(), proj) };
                if key == -1 {
                    return Err(unavailable(io::Error::last_os_error()));
                }
                key
            }
            None => libc::IPC_PRIVATE,
        };

        // SAFETY: plain syscall with scalar arguments.
        let semid = unsafe { libc::semget(key, 1, libc::IPC_CREAT | libc::IPC_EXCL | SEM_PERMS) };
        if semid >= 0 {
            // SAFETY: `semid` was just returned by semget; SETVAL takes an int argument.
            if unsafe { libc::semctl(semid, 0, libc::SETVAL, initval as libc::c_int) } < 0 {
                return Err(unavailable(io::Error::last_os_error()));
            }
            return Ok(Self {
                semid,
                identity: shown.clone(),
                owner: true,
            });
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(unavailable(err));
        }

        // SAFETY: plain syscall with scalar arguments.
        let semid = unsafe { libc::semget(key, 1, SEM_PERMS) };
        if semid < 0 {
            return Err(unavailable(io::Error::last_os_error()));
        }
        Ok(Self {
            semid,
            identity: shown.clone(),
            owner: false,
        })
    }

    /// Removes the semaphore set from the system.
    pub fn destroy(mut self) -> Result<(), LockError> {
        self.owner = false;
        // SAFETY: plain syscall with scalar arguments.
        if unsafe { libc::semctl(self.semid, 0, libc::IPC_RMID) } < 0 {
            return Err(LockError::Io {
                op: "semctl(IPC_RMID)",
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Blocks until the semaphore's value is zero.
    pub fn wait_for_zero(&self) -> Result<(), LockError> {
        self.semop(0, 0, "semop(wait-for-zero)").map(|_| ())
    }

    /// Returns the semaphore's current value.
    pub fn get_value(&self) -> Result<i32, LockError> {
        // SAFETY: plain syscall with scalar arguments.
        let value = unsafe { libc::semctl(self.semid, 0, libc::GETVAL) };
        if value < 0 {
            return Err(LockError::Io {
                op: "semctl(GETVAL)",
                source: io::Error::last_os_error(),
            });
        }
        Ok(value)
    }

    /// Returns the path (or `IPC_PRIVATE`) the semaphore was keyed from.
    pub fn identity(&self) -> &Path {
        &self.identity
    }

    /// Performs one semaphore operation, retrying on `EINTR`.
    ///
    /// Returns `Ok(false)` when a non-blocking operation would have blocked.
    fn semop(&self, delta: i16, flags: libc::c_int, op: &'static str) -> Result<bool, LockError> {
        let mut buf = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: flags as libc::c_short,
        };
        loop {
            // SAFETY: `buf` is a valid sembuf and we pass exactly one operation.
            if unsafe { libc::semop(self.semid, &mut buf, 1) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) if flags & libc::IPC_NOWAIT != 0 => return Ok(false),
                _ => return Err(LockError::Io { op, source: err }),
            }
        }
    }
}

impl Drop for SemaphoreLock {
    fn drop(&mut self) {
        if self.owner {
            // SAFETY: plain syscall with scalar arguments.
            unsafe { libc::semctl(self.semid, 0, libc::IPC_RMID) };
        }
    }
}

impl Lock for SemaphoreLock {
    fn lock(&self) -> Result<(), LockError> {
        self.semop(-1, libc::SEM_UNDO, "semop(lock)").map(|_| ())
    }

    fn try_lock(&self) -> Result<bool, LockError> {
        self.semop(-1, libc::SEM_UNDO | libc::IPC_NOWAIT, "semop(try-lock)")
    }

    fn unlock(&self) -> Result<(), LockError> {
        self.semop(1, libc::SEM_UNDO, "semop(unlock)").map(|_| ())
    }

    fn kind(&self) -> &'static str {
        "semaphore"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_lock_counts() {
        let sem = SemaphoreLock::create(None, 0, 1).unwrap();
        assert_eq!(sem.get_value().unwrap(), 1);
        sem.lock().unwrap();
        assert_eq!(sem.get_value().unwrap(), 0);
        assert!(!sem.try_lock().unwrap(), "second acquisition must not succeed");
        sem.unlock().unwrap();
        assert_eq!(sem.get_value().unwrap(), 1);
        sem.destroy().unwrap();
    }

    #[test]
    fn wait_for_zero_returns_when_gate_is_empty() {
        let sem = SemaphoreLock::create(None, 0, 0).unwrap();
        sem.wait_for_zero().unwrap();
        sem.unlock().unwrap();
        assert_eq!(sem.get_value().unwrap(), 1);
        sem.lock().unwrap();
        sem.wait_for_zero().unwrap();
        sem.destroy().unwrap();
    }

    #[test]
    fn keyed_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sem.key");
        std::fs::write(&path, b"").unwrap();

        let first = SemaphoreLock::create(Some(&path), 7, 1).unwrap();
        first.lock().unwrap();
        let second = SemaphoreLock::create(Some(&path), 7, 1).unwrap();
        // The existing set keeps its value rather than being reinitialized.
        assert_eq!(second.get_value().unwrap(), 0);
        first.unlock().unwrap();
        drop(second);
        first.destroy().unwrap();
    }

    #[test]
    fn missing_key_path_is_unavailable() {
        let err = SemaphoreLock::create(Some(Path::new("/nonexistent/opcache/key")), 1, 1)
            .unwrap_err();
        assert!(matches!(err, LockError::Unavailable { .. }));
    }
}
