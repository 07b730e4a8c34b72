use super::SrvtabEntry;
use crate::constants::*;
use crate::error::KrbError;
use crate::proto::{DerivedKey, Principal};
use binrw::helpers::until_eof;
use binrw::{binread, binwrite, BinReaderExt, BinWrite, NullString};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::error;
use zeroize::Zeroize;

#[binwrite]
#[brw(big)]
#[binread]
#[derive(Clone, PartialEq, Eq)]
struct Record {
    name: NullString,
    instance: NullString,
    realm: NullString,
    kvno: u8,
    key: [u8; DES_KEY_LEN],
}

impl Record {
    fn encoded_len(&self) -> usize {
        self.name.len() + self.instance.len() + self.realm.len() + 3 + 1 + DES_KEY_LEN
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.name.to_string())
            .field("instance", &self.instance.to_string())
            .field("realm", &self.realm.to_string())
            .field("kvno", &self.kvno)
            .finish()
    }
}

#[binread]
#[binwrite]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileSrvtab {
    #[br(parse_with = until_eof)]
    records: Vec<Record>,
}

fn field(value: &NullString, max: usize) -> Result<String, KrbError> {
    if value.len() > max {
        error!(len = value.len(), max, "Srvtab field is too long");
        return Err(KrbError::KeytabFileError);
    }
    String::from_utf8(value.to_vec()).map_err(|err| {
        error!(?err, "Srvtab field is not valid utf8");
        KrbError::KeytabFileError
    })
}

impl TryFrom<&Record> for SrvtabEntry {
    type Error = KrbError;

    fn try_from(value: &Record) -> Result<Self, Self::Error> {
        let name = field(&value.name, MAX_NAME_LEN)?;
        let instance = field(&value.instance, MAX_INST_LEN)?;
        let realm = field(&value.realm, MAX_REALM_LEN)?;
        let principal = Principal::new(&name, &instance, &realm).map_err(|_| {
            error!(%name, %instance, %realm, "Srvtab names an invalid principal");
            KrbError::KeytabFileError
        })?;
        Ok(SrvtabEntry {
            principal,
            key: DerivedKey::new(value.key, value.kvno),
        })
    }
}

impl From<&SrvtabEntry> for Record {
    fn from(value: &SrvtabEntry) -> Self {
        let p = &value.principal;
        Record {
            name: p.name().into(),
            instance: p.instance().into(),
            realm: p.realm().into(),
            kvno: value.key.kvno(),
            key: *value.key.k(),
        }
    }
}

fn read(buffer: &[u8]) -> Result<Vec<SrvtabEntry>, KrbError> {
    let mut reader = binrw::io::Cursor::new(buffer);
    let st: FileSrvtab = reader.read_type(binrw::Endian::Big).map_err(|err| {
        error!(?err, "Failed to unmarshall srvtab buffer");
        KrbError::KeytabFileError
    })?;

    // until_eof stops quietly at a truncated trailing record.
    let consumed: usize = st.records.iter().map(Record::encoded_len).sum();
    if consumed != buffer.len() {
        error!(consumed, len = buffer.len(), "Srvtab has a truncated record");
        return Err(KrbError::KeytabFileError);
    }

    st.records.iter().map(SrvtabEntry::try_from).collect()
}

pub(super) fn store(path: &Path, entries: &[SrvtabEntry]) -> Result<(), KrbError> {
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|io_err| {
            error!(?io_err, "Unable to create file at {}", path.display());
            KrbError::KeytabFileError
        })?;

    let st = FileSrvtab {
        records: entries.iter().map(Record::from).collect(),
    };
    st.write(&mut f).map_err(|binrw_err| {
        error!(?binrw_err, "Unable to write binary data.");
        KrbError::BinRWError
    })?;

    Ok(())
}

pub(super) fn load(path: &Path) -> Result<Vec<SrvtabEntry>, KrbError> {
    let mut f = File::open(path).map_err(|io_err| {
        error!(?io_err, "Unable to open file at {}", path.display());
        KrbError::KeytabFileError
    })?;

    let mut buffer = zeroize::Zeroizing::new(Vec::new());
    f.read_to_end(&mut buffer).map_err(|io_err| {
        error!(?io_err, "Unable to read file at {}", path.display());
        KrbError::KeytabFileError
    })?;

    read(&buffer)
}
