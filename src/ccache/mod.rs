mod cc_file;
mod lock;

pub use self::lock::{with_lock, LockMode, LockPolicy, LockedFile};

use crate::config::ENV_TICKET_FILE;
use crate::constants::DEFAULT_TICKET_FILE;
use crate::error::KrbError;
use crate::proto::{Credential, Principal};
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, error, trace};
use uzers::get_current_uid;
use zeroize::Zeroizing;

/// Resolve a ticket cache path: the explicit name, then `$KRBTKFILE`, then the default,
/// with `%{uid}` replaced by the current user id.
pub fn parse_ccache_name(ccache: Option<&str>) -> PathBuf {
    let uid = get_current_uid().to_string();

    let name = match ccache {
        Some(c) => c.to_string(),
        None => match env::var(ENV_TICKET_FILE) {
            Ok(val) => val,
            _ => DEFAULT_TICKET_FILE.to_string(),
        },
    };
    PathBuf::from(name.replace("%{uid}", uid.as_str()))
}

fn open_error(path: &Path, io_err: std::io::Error) -> KrbError {
    match io_err.kind() {
        ErrorKind::NotFound => {
            debug!(path = %path.display(), "No ticket cache");
            KrbError::CacheMissing
        }
        _ => {
            error!(?io_err, "Unable to open ticket cache at {}", path.display());
            KrbError::CacheAccessDenied
        }
    }
}

fn io_error(path: &Path, io_err: std::io::Error) -> KrbError {
    error!(?io_err, "Ticket cache I/O failed at {}", path.display());
    KrbError::CacheAccessDenied
}

/// The file must be a regular file owned by us, and still be the one at `path`.
fn check_file(path: &Path, file: &File) -> Result<bool, KrbError> {
    let meta = file.metadata().map_err(|e| io_error(path, e))?;
    if !meta.file_type().is_file() {
        error!(path = %path.display(), "Ticket cache is not a regular file");
        return Err(KrbError::CacheAccessDenied);
    }
    if meta.uid() != get_current_uid() {
        error!(path = %path.display(), owner = meta.uid(), "Ticket cache is owned by another user");
        return Err(KrbError::CacheAccessDenied);
    }
    match fs::symlink_metadata(path) {
        Ok(current) => Ok(current.ino() == meta.ino() && current.dev() == meta.dev()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error(path, e)),
    }
}

/// Overwrite the file contents with zeros so no key material survives the unlink.
fn erase(path: &Path, file: &mut File) -> Result<(), KrbError> {
    let len = file.metadata().map_err(|e| io_error(path, e))?.len();
    file.seek(SeekFrom::Start(0))
        .map_err(|e| io_error(path, e))?;
    let zeros = [0u8; 1024];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(zeros.len() as u64) as usize;
        file.write_all(&zeros[..n]).map_err(|e| io_error(path, e))?;
        remaining -= n as u64;
    }
    file.sync_all().map_err(|e| io_error(path, e))?;
    fs::remove_file(path).map_err(|e| io_error(path, e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    /// Opened for reading, header not yet consumed.
    Unread,
    /// Created empty, header not yet written.
    Empty,
    Ready,
}

/// An open ticket cache. The advisory lock is held until the handle is dropped.
pub struct TicketCache {
    path: PathBuf,
    locked: LockedFile,
    state: CacheState,
    contents: Zeroizing<Vec<u8>>,
    position: u64,
    client: Option<(String, String)>,
}

impl std::fmt::Debug for TicketCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketCache")
            .field("path", &self.path)
            .field("mode", &self.locked.mode())
            .field("state", &self.state)
            .field("position", &self.position)
            .finish()
    }
}

impl TicketCache {
    /// Erase any existing cache at `path` and create a new, empty one locked exclusively.
    pub fn create(path: &Path, policy: &LockPolicy) -> Result<Self, KrbError> {
        let mut attempt = 0;
        loop {
            // Wait for any current holder before destroying its cache.
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(f) => {
                    let mut old = LockedFile::acquire(f, LockMode::Exclusive, policy)?;
                    if check_file(path, old.as_file())? {
                        erase(path, old.file())?;
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(open_error(path, e)),
            }

            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
            {
                Ok(f) => {
                    let locked = LockedFile::acquire(f, LockMode::Exclusive, policy)?;
                    debug!(path = %path.display(), "Created ticket cache");
                    return Ok(TicketCache {
                        path: path.to_path_buf(),
                        locked,
                        state: CacheState::Empty,
                        contents: Zeroizing::new(Vec::new()),
                        position: 0,
                        client: None,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < policy.retries => {
                    // Someone created it between our erase and create.
                    attempt += 1;
                    trace!(attempt, "Ticket cache reappeared, retrying");
                    std::thread::sleep(policy.interval);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    error!(path = %path.display(), "Ticket cache keeps being recreated");
                    return Err(KrbError::CacheLocked);
                }
                Err(e) => return Err(open_error(path, e)),
            }
        }
    }

    fn open(path: &Path, mode: LockMode, policy: &LockPolicy) -> Result<Self, KrbError> {
        let f = OpenOptions::new()
            .read(true)
            .write(mode == LockMode::Exclusive)
            .open(path)
            .map_err(|e| open_error(path, e))?;
        let mut locked = LockedFile::acquire(f, mode, policy)?;
        if !check_file(path, locked.as_file())? {
            error!(path = %path.display(), "Ticket cache was replaced while we waited");
            return Err(KrbError::CacheMissing);
        }

        let mut contents = Zeroizing::new(Vec::new());
        locked
            .file()
            .read_to_end(&mut contents)
            .map_err(|e| io_error(path, e))?;

        Ok(TicketCache {
            path: path.to_path_buf(),
            locked,
            state: CacheState::Unread,
            contents,
            position: 0,
            client: None,
        })
    }

    /// Open an existing cache for sequential reading under a shared lock.
    pub fn open_for_read(path: &Path, policy: &LockPolicy) -> Result<Self, KrbError> {
        Self::open(path, LockMode::Shared, policy)
    }

    /// Open an existing cache under an exclusive lock so credentials may be appended.
    pub fn open_for_append(path: &Path, policy: &LockPolicy) -> Result<Self, KrbError> {
        let mut cache = Self::open(path, LockMode::Exclusive, policy)?;
        cache.read_client()?;
        cache
            .locked
            .file()
            .seek(SeekFrom::End(0))
            .map_err(|e| io_error(path, e))?;
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), KrbError> {
        if self.locked.mode() != LockMode::Exclusive {
            error!("Ticket cache was opened read only");
            return Err(KrbError::CacheAccessDenied);
        }
        let path = self.path.clone();
        let f = self.locked.file();
        f.write_all(bytes).map_err(|e| io_error(&path, e))?;
        f.sync_data().map_err(|e| io_error(&path, e))
    }

    pub fn write_header(&mut self, client: &Principal) -> Result<(), KrbError> {
        if self.state != CacheState::Empty {
            error!(state = ?self.state, "Ticket cache already has a header");
            return Err(KrbError::BadCacheFormat);
        }
        let bytes = cc_file::write_header(client)?;
        self.write_bytes(&bytes)?;
        self.client = Some((client.name().to_string(), client.instance().to_string()));
        self.state = CacheState::Ready;
        Ok(())
    }

    pub fn append_credential(&mut self, cred: &Credential) -> Result<(), KrbError> {
        if self.state != CacheState::Ready || self.client.is_none() {
            error!(state = ?self.state, "Ticket cache has no header to append to");
            return Err(KrbError::CacheNotInitialised);
        }
        let bytes = cc_file::write_credential(cred)?;
        self.write_bytes(&bytes)?;
        trace!(service = %cred.service, "Appended credential");
        Ok(())
    }

    fn read_client(&mut self) -> Result<(String, String), KrbError> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        if self.state != CacheState::Unread {
            return Err(KrbError::CacheNotInitialised);
        }
        let mut reader = Cursor::new(self.contents.as_slice());
        let header = cc_file::read_header(&mut reader)?;
        let client = (header.name()?, header.instance()?);
        self.position = reader.position();
        self.client = Some(client.clone());
        self.state = CacheState::Ready;
        Ok(client)
    }

    /// The client this cache belongs to. The cache does not record a realm, so the
    /// caller's local realm is used.
    pub fn read_header(&mut self, realm: &str) -> Result<Principal, KrbError> {
        let (name, instance) = self.read_client()?;
        Principal::new(&name, &instance, realm).map_err(|_| {
            error!(%name, %instance, "Ticket cache names an invalid principal");
            KrbError::BadCacheFormat
        })
    }

    /// The next credential in file order, or `None` at the end of the cache.
    pub fn read_next_credential(&mut self) -> Result<Option<Credential>, KrbError> {
        self.read_client()?;
        let mut reader = Cursor::new(self.contents.as_slice());
        reader.set_position(self.position);
        let cred = cc_file::read_credential(&mut reader)?;
        self.position = reader.position();
        Ok(cred)
    }

    /// Erase and remove this cache, releasing the lock.
    pub fn destroy(mut self) -> Result<(), KrbError> {
        if self.locked.mode() != LockMode::Exclusive {
            error!("Ticket cache was opened read only");
            return Err(KrbError::CacheAccessDenied);
        }
        let path = self.path.clone();
        erase(&path, self.locked.file())?;
        debug!(path = %path.display(), "Destroyed ticket cache");
        Ok(())
    }
}

/// Read a whole cache: its client and every credential, in file order.
pub fn read_all(
    path: &Path,
    realm: &str,
    policy: &LockPolicy,
) -> Result<(Principal, Vec<Credential>), KrbError> {
    let mut cache = TicketCache::open_for_read(path, policy)?;
    let client = cache.read_header(realm)?;
    let mut creds = Vec::new();
    while let Some(cred) = cache.read_next_credential()? {
        creds.push(cred);
    }
    Ok((client, creds))
}

/// Find the credential for `service` in the cache.
pub fn get_cred(path: &Path, service: &Principal, policy: &LockPolicy) -> Result<Credential, KrbError> {
    let mut cache = TicketCache::open_for_read(path, policy)?;
    cache.read_client()?;
    while let Some(cred) = cache.read_next_credential()? {
        if &cred.service == service {
            return Ok(cred);
        }
    }
    debug!(%service, "No cached credential for service");
    Err(KrbError::NoTicketGrantingTicket)
}

/// Erase and remove the cache at `path`, waiting for other holders first.
pub fn destroy(path: &Path, policy: &LockPolicy) -> Result<(), KrbError> {
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| open_error(path, e))?;
    with_lock(f, LockMode::Exclusive, policy, |file| {
        if !check_file(path, file)? {
            return Err(KrbError::CacheMissing);
        }
        erase(path, file)
    })?;
    debug!(path = %path.display(), "Destroyed ticket cache");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{SessionKey, Ticket};
    use std::time::Duration;

    fn cred(service: &str, instance: &str, n: u8) -> Credential {
        Credential {
            service: Principal::new(service, instance, "EXAMPLE.COM").unwrap(),
            session_key: SessionKey::new([n; 8]),
            lifetime: 0x60,
            kvno: n,
            ticket: Ticket::from_bytes(&[n; 16]).unwrap(),
            issue_date: 1_700_000_000 + n as u32,
        }
    }

    fn fast() -> LockPolicy {
        LockPolicy {
            retries: 3,
            interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_parse_ccache_name() {
        let uid = get_current_uid();
        assert_eq!(
            parse_ccache_name(Some("/var/tmp/tkt%{uid}_x")),
            PathBuf::from(format!("/var/tmp/tkt{uid}_x"))
        );
    }

    #[test]
    fn test_ccache_append_and_read() {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tkt");
        let client = Principal::new("alice", "", "EXAMPLE.COM").unwrap();

        let creds: Vec<_> = (1..=3).map(|n| cred("rcmd", &format!("host{n}"), n)).collect();

        let mut cache = TicketCache::create(&path, &fast()).unwrap();
        assert_eq!(
            cache.append_credential(&creds[0]),
            Err(KrbError::CacheNotInitialised)
        );
        cache.write_header(&client).unwrap();
        cache.append_credential(&creds[0]).unwrap();
        drop(cache);

        let mut cache = TicketCache::open_for_append(&path, &fast()).unwrap();
        cache.append_credential(&creds[1]).unwrap();
        cache.append_credential(&creds[2]).unwrap();
        drop(cache);

        let mut cache = TicketCache::open_for_read(&path, &fast()).unwrap();
        assert_eq!(cache.read_header("EXAMPLE.COM").unwrap(), client);
        for c in &creds {
            assert_eq!(cache.read_next_credential().unwrap().as_ref(), Some(c));
        }
        assert_eq!(cache.read_next_credential().unwrap(), None);
        // Readers share.
        let (c2, all) = read_all(&path, "EXAMPLE.COM", &fast()).unwrap();
        assert_eq!(c2, client);
        assert_eq!(all, creds);
        drop(cache);

        assert_eq!(
            get_cred(&path, &creds[1].service, &fast()).unwrap(),
            creds[1]
        );
        assert_eq!(
            get_cred(&path, &Principal::new("ftp", "x", "EXAMPLE.COM").unwrap(), &fast()),
            Err(KrbError::NoTicketGrantingTicket)
        );

        destroy(&path, &fast()).unwrap();
        assert!(!path.exists());
        assert_eq!(
            TicketCache::open_for_read(&path, &fast()).err(),
            Some(KrbError::CacheMissing)
        );
        assert_eq!(destroy(&path, &fast()), Err(KrbError::CacheMissing));
    }

    #[test]
    fn test_ccache_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tkt");
        let client = Principal::new("alice", "", "EXAMPLE.COM").unwrap();

        let mut cache = TicketCache::create(&path, &fast()).unwrap();
        cache.write_header(&client).unwrap();
        cache.append_credential(&cred("rcmd", "host", 1)).unwrap();
        drop(cache);

        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        fs::write(&path, &bytes).unwrap();

        let mut cache = TicketCache::open_for_read(&path, &fast()).unwrap();
        cache.read_header("EXAMPLE.COM").unwrap();
        assert_eq!(
            cache.read_next_credential(),
            Err(KrbError::BadCacheFormat)
        );
    }

    #[test]
    fn test_ccache_concurrent_create() {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tkt");
        let client = Principal::new("alice", "", "EXAMPLE.COM").unwrap();

        let mut first = TicketCache::create(&path, &fast()).unwrap();
        first.write_header(&client).unwrap();
        first.append_credential(&cred("krbtgt", "EXAMPLE.COM", 1)).unwrap();

        // While the first writer holds its lock the second gives up without touching it.
        assert_eq!(
            TicketCache::create(&path, &fast()).err(),
            Some(KrbError::CacheLocked)
        );
        assert_eq!(
            TicketCache::open_for_read(&path, &fast()).err(),
            Some(KrbError::CacheLocked)
        );
        drop(first);

        let (_, creds) = read_all(&path, "EXAMPLE.COM", &fast()).unwrap();
        assert_eq!(creds, vec![cred("krbtgt", "EXAMPLE.COM", 1)]);

        // A patient second writer succeeds once the first lets go.
        let holder = TicketCache::open_for_append(&path, &fast()).unwrap();
        let path2 = path.clone();
        let waiter = std::thread::spawn(move || {
            let patient = LockPolicy {
                retries: 100,
                interval: Duration::from_millis(10),
            };
            let mut second = TicketCache::create(&path2, &patient)?;
            second.write_header(&Principal::new("bob", "", "EXAMPLE.COM")?)?;
            Ok::<_, KrbError>(())
        });
        std::thread::sleep(Duration::from_millis(50));
        holder.destroy().unwrap();
        waiter.join().unwrap().unwrap();

        let (who, creds) = read_all(&path, "EXAMPLE.COM", &fast()).unwrap();
        assert_eq!(who.name(), "bob");
        assert!(creds.is_empty());
    }
}
