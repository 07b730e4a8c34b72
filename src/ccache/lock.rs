use crate::config::ClientConfig;
use crate::constants::{TF_LCK_RETRY, TF_LCK_RETRY_COUNT};
use crate::error::KrbError;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn operation(self) -> libc::c_int {
        match self {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        }
    }
}

/// How long to wait for another process to release a ticket cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub retries: usize,
    pub interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy {
            retries: TF_LCK_RETRY_COUNT,
            interval: TF_LCK_RETRY,
        }
    }
}

impl LockPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        LockPolicy {
            retries: config.lock_retry_count,
            interval: config.lock_retry_interval(),
        }
    }
}

/// An advisory lock held on an open file. Released when dropped.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    mode: LockMode,
}

impl LockedFile {
    /// Take `mode` on `file`, sleeping between non-blocking attempts as `policy` allows.
    pub fn acquire(file: File, mode: LockMode, policy: &LockPolicy) -> Result<Self, KrbError> {
        let fd = file.as_raw_fd();
        let mut attempt = 0;

        loop {
            let res = unsafe { libc::flock(fd, mode.operation() | libc::LOCK_NB) };
            if res == 0 {
                trace!(?mode, attempt, "Acquired ticket cache lock");
                return Ok(LockedFile { file, mode });
            }

            let err = errno::errno();
            let code = err.0;
            if code != libc::EWOULDBLOCK && code != libc::EINTR {
                error!("Failed to lock ticket cache: {code} ({err})");
                return Err(KrbError::CacheAccessDenied);
            }

            if attempt >= policy.retries {
                error!(?mode, attempt, "Ticket cache is still locked, giving up");
                return Err(KrbError::CacheLocked);
            }
            attempt += 1;
            debug!(?mode, attempt, "Ticket cache is locked, retrying");
            std::thread::sleep(policy.interval);
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn as_file(&self) -> &File {
        &self.file
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let res = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if res != 0 {
            let err = errno::errno();
            error!("Failed to unlock ticket cache: {} ({err})", err.0);
        }
    }
}

/// Run `f` with `file` locked in `mode`. The lock is released on every exit path.
pub fn with_lock<T, F>(file: File, mode: LockMode, policy: &LockPolicy, f: F) -> Result<T, KrbError>
where
    F: FnOnce(&mut File) -> Result<T, KrbError>,
{
    let mut locked = LockedFile::acquire(file, mode, policy)?;
    f(locked.file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn fast() -> LockPolicy {
        LockPolicy {
            retries: 2,
            interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_lock_conflicts() {
        let _ = tracing_subscriber::fmt::try_init();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let open = || OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();

        let shared_a = LockedFile::acquire(open(), LockMode::Shared, &fast()).unwrap();
        let shared_b = LockedFile::acquire(open(), LockMode::Shared, &fast()).unwrap();
        assert_eq!(
            LockedFile::acquire(open(), LockMode::Exclusive, &fast()).err(),
            Some(KrbError::CacheLocked)
        );
        drop(shared_a);
        drop(shared_b);

        let r = with_lock(open(), LockMode::Exclusive, &fast(), |_f| {
            assert_eq!(
                LockedFile::acquire(open(), LockMode::Shared, &fast()).err(),
                Some(KrbError::CacheLocked)
            );
            Err::<(), _>(KrbError::BadCacheFormat)
        });
        assert_eq!(r, Err(KrbError::BadCacheFormat));

        // Released by the early error return.
        assert!(LockedFile::acquire(open(), LockMode::Exclusive, &fast()).is_ok());
    }
}
