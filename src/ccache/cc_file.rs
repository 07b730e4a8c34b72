use crate::constants::*;
use crate::error::KrbError;
use crate::proto::{Credential, Principal, SessionKey, Ticket};
use binrw::{binread, binwrite, BinReaderExt, BinWrite, NullString};
use std::io::Cursor;
use tracing::error;
use zeroize::Zeroize;

#[binwrite]
#[brw(big)]
#[binread]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct FileHeader {
    #[br(assert(name.len() <= MAX_NAME_LEN))]
    name: NullString,
    #[br(assert(instance.len() <= MAX_INST_LEN))]
    instance: NullString,
}

#[binwrite]
#[brw(big)]
#[binread]
#[derive(Clone, PartialEq, Eq)]
pub(super) struct FileCredential {
    #[br(assert(service.len() <= MAX_NAME_LEN))]
    service: NullString,
    #[br(assert(instance.len() <= MAX_INST_LEN))]
    instance: NullString,
    #[br(assert(realm.len() <= MAX_REALM_LEN))]
    realm: NullString,
    session_key: [u8; DES_KEY_LEN],
    lifetime: u32,
    kvno: u32,
    #[br(temp, assert(ticket_len as usize <= MAX_KTXT_LEN))]
    #[bw(try_calc(u32::try_from(ticket.len())))]
    ticket_len: u32,
    #[br(count = ticket_len)]
    ticket: Vec<u8>,
    issue_date: u32,
}

impl Drop for FileCredential {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}

impl std::fmt::Debug for FileCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCredential")
            .field("service", &self.service.to_string())
            .field("instance", &self.instance.to_string())
            .field("realm", &self.realm.to_string())
            .field("lifetime", &self.lifetime)
            .field("kvno", &self.kvno)
            .field("ticket_len", &self.ticket.len())
            .field("issue_date", &self.issue_date)
            .finish()
    }
}

fn string(value: &NullString) -> Result<String, KrbError> {
    String::from_utf8(value.to_vec()).map_err(|err| {
        error!(?err, "Ticket cache string is not valid utf8");
        KrbError::BadCacheFormat
    })
}

impl FileHeader {
    pub(super) fn new(client: &Principal) -> Self {
        FileHeader {
            name: client.name().into(),
            instance: client.instance().into(),
        }
    }

    pub(super) fn name(&self) -> Result<String, KrbError> {
        string(&self.name)
    }

    pub(super) fn instance(&self) -> Result<String, KrbError> {
        string(&self.instance)
    }
}

impl From<&Credential> for FileCredential {
    fn from(value: &Credential) -> Self {
        let s = &value.service;
        FileCredential {
            service: s.name().into(),
            instance: s.instance().into(),
            realm: s.realm().into(),
            session_key: *value.session_key.k(),
            lifetime: value.lifetime as u32,
            kvno: value.kvno as u32,
            ticket: value.ticket.as_bytes().to_vec(),
            issue_date: value.issue_date,
        }
    }
}

impl TryFrom<&FileCredential> for Credential {
    type Error = KrbError;

    fn try_from(value: &FileCredential) -> Result<Self, Self::Error> {
        let name = string(&value.service)?;
        let instance = string(&value.instance)?;
        let realm = string(&value.realm)?;
        let service = Principal::new(&name, &instance, &realm).map_err(|_| {
            error!(%name, %instance, %realm, "Cached credential names an invalid service");
            KrbError::BadCacheFormat
        })?;

        let lifetime = u8::try_from(value.lifetime).map_err(|_| {
            error!(lifetime = value.lifetime, "Cached lifetime is out of range");
            KrbError::BadCacheFormat
        })?;
        let kvno = u8::try_from(value.kvno).map_err(|_| {
            error!(kvno = value.kvno, "Cached key version is out of range");
            KrbError::BadCacheFormat
        })?;
        let ticket = Ticket::from_bytes(&value.ticket).map_err(|_| KrbError::BadCacheFormat)?;

        Ok(Credential {
            service,
            session_key: SessionKey::new(value.session_key),
            lifetime,
            kvno,
            ticket,
            issue_date: value.issue_date,
        })
    }
}

pub(super) fn read_header(reader: &mut Cursor<&[u8]>) -> Result<FileHeader, KrbError> {
    reader.read_type(binrw::Endian::Big).map_err(|err| {
        error!(?err, "Failed to unmarshall ticket cache header");
        KrbError::BadCacheFormat
    })
}

/// Read the next credential, or `None` once the whole buffer has been consumed.
pub(super) fn read_credential(reader: &mut Cursor<&[u8]>) -> Result<Option<Credential>, KrbError> {
    if reader.position() as usize >= reader.get_ref().len() {
        return Ok(None);
    }

    let fc: FileCredential = reader.read_type(binrw::Endian::Big).map_err(|err| {
        error!(?err, "Failed to unmarshall cached credential");
        KrbError::BadCacheFormat
    })?;
    Credential::try_from(&fc).map(Some)
}

pub(super) fn write_header(client: &Principal) -> Result<Vec<u8>, KrbError> {
    let mut c = Cursor::new(Vec::new());
    FileHeader::new(client).write(&mut c).map_err(|binrw_err| {
        error!(?binrw_err, "Unable to write binary data.");
        KrbError::BinRWError
    })?;
    Ok(c.into_inner())
}

pub(super) fn write_credential(cred: &Credential) -> Result<zeroize::Zeroizing<Vec<u8>>, KrbError> {
    let mut c = Cursor::new(Vec::new());
    FileCredential::from(cred).write(&mut c).map_err(|binrw_err| {
        error!(?binrw_err, "Unable to write binary data.");
        KrbError::BinRWError
    })?;
    Ok(zeroize::Zeroizing::new(c.into_inner()))
}
