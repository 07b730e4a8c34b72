mod st_file;

use crate::constants::KEYFILE;
use crate::error::KrbError;
use crate::proto::ap_req::ServerKeyLookup;
use crate::proto::{DerivedKey, Principal};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvtabEntry {
    pub principal: Principal,
    pub key: DerivedKey,
}

/// The service keys a host holds, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Srvtab {
    entries: Vec<SrvtabEntry>,
}

pub(crate) fn parse_srvtab_name(st_name: Option<&Path>) -> PathBuf {
    match st_name {
        Some(p) => p.to_path_buf(),
        None => match env::var("KRBSRVTAB") {
            Ok(val) => PathBuf::from(val),
            _ => PathBuf::from(KEYFILE),
        },
    }
}

impl Srvtab {
    pub fn new(entries: Vec<SrvtabEntry>) -> Self {
        Srvtab { entries }
    }

    pub fn load(path: &Path) -> Result<Self, KrbError> {
        st_file::load(path).map(Srvtab::new)
    }

    /// Load the srvtab named by `KRBSRVTAB`, or the system default.
    pub fn load_default() -> Result<Self, KrbError> {
        Self::load(&parse_srvtab_name(None))
    }

    pub fn store(&self, path: &Path) -> Result<(), KrbError> {
        st_file::store(path, &self.entries)
    }

    pub fn entries(&self) -> &[SrvtabEntry] {
        &self.entries
    }

    pub fn push(&mut self, principal: Principal, key: DerivedKey) {
        self.entries.push(SrvtabEntry { principal, key });
    }

    /// Find the key for `principal` at `kvno`. A kvno of 0 selects the newest key held.
    pub fn find(&self, principal: &Principal, kvno: u8) -> Result<DerivedKey, KrbError> {
        let mut candidates = self.entries.iter().filter(|e| &e.principal == principal);

        let found = if kvno == 0 {
            candidates.max_by_key(|e| e.key.kvno())
        } else {
            candidates.find(|e| e.key.kvno() == kvno)
        };

        match found {
            Some(e) => {
                debug!(%principal, kvno = e.key.kvno(), "Found service key");
                Ok(e.key.clone())
            }
            None => {
                error!(%principal, kvno, "No matching key in srvtab");
                Err(KrbError::KeyNotFound)
            }
        }
    }
}

impl ServerKeyLookup for Srvtab {
    fn server_key(
        &self,
        service: &str,
        instance: &str,
        realm: &str,
        kvno: u8,
    ) -> Result<DerivedKey, KrbError> {
        let principal = Principal::new(service, instance, realm)?;
        self.find(&principal, kvno)
    }
}
