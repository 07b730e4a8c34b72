use super::wire::{ByteOrder, KReader, KText};
use super::{put_header, read_header, MessageType, Principal};
use crate::constants::*;
use crate::error::KrbError;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{error, trace};

/// Error codes a KDC places in its error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum KdcErrorCode {
    NameExpired = 1,
    ServiceExpired = 2,
    AuthExpired = 3,
    PacketVersion = 4,
    PrincipalMasterKeyVersion = 5,
    ServiceMasterKeyVersion = 6,
    ByteOrder = 7,
    PrincipalUnknown = 8,
    PrincipalNotUnique = 9,
    NullKey = 10,
    Generic = 20,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KerberosReply {
    Success(KdcReply),
    Error(ErrorReply),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdcReply {
    pub client: Principal,
    pub time: u32,
    pub n_tickets: u8,
    /// When the client's password expires.
    pub exp_date: u32,
    pub kvno: u8,
    pub cipher: Vec<u8>,
    /// The byte order the reply (and so its cipher block) was written in.
    pub order: ByteOrder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub client: Principal,
    pub time: u32,
    pub code: u32,
    pub text: String,
}

impl ErrorReply {
    pub fn to_krb_error(&self) -> KrbError {
        KrbError::KdcRejected(self.code, self.text.clone())
    }
}

impl KerberosReply {
    pub fn error(client: &Principal, time: u32, code: KdcErrorCode, text: &str) -> KerberosReply {
        KerberosReply::Error(ErrorReply {
            client: client.clone(),
            time,
            code: code.into(),
            text: text.to_string(),
        })
    }

    pub fn error_principal_unknown(client: &Principal, time: u32) -> KerberosReply {
        Self::error(
            client,
            time,
            KdcErrorCode::PrincipalUnknown,
            "Principal unknown (kerberos)",
        )
    }

    pub fn error_request_invalid(client: &Principal, time: u32) -> KerberosReply {
        Self::error(
            client,
            time,
            KdcErrorCode::Generic,
            "The Kerberos Client sent a malformed and invalid request.",
        )
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, KrbError> {
        let mut buf = KText::new();
        match self {
            KerberosReply::Success(rep) => {
                let clen = u16::try_from(rep.cipher.len()).map_err(|_| {
                    error!(len = rep.cipher.len(), "Reply cipher is too long");
                    KrbError::ValueOutOfRange
                })?;
                put_header(&mut buf, MessageType::KdcReply)?;
                let c = &rep.client;
                buf.put_nir(c.name(), c.instance(), Some(c.realm()))?;
                buf.put_u32(rep.time)?;
                buf.put_u8(rep.n_tickets)?;
                buf.put_u32(rep.exp_date)?;
                buf.put_u8(rep.kvno)?;
                buf.put_u16(clen)?;
                buf.put_bytes(&rep.cipher)?;
            }
            KerberosReply::Error(rep) => {
                put_header(&mut buf, MessageType::ErrReply)?;
                let c = &rep.client;
                buf.put_nir(c.name(), c.instance(), Some(c.realm()))?;
                buf.put_u32(rep.time)?;
                buf.put_u32(rep.code)?;
                buf.put_string(&rep.text)?;
            }
        }
        Ok(buf.as_slice().to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<KerberosReply, KrbError> {
        let mut r = KReader::new(bytes, ByteOrder::Big);
        let msg_type = read_header(&mut r, &[MessageType::KdcReply, MessageType::ErrReply])?;

        let name = r.get_string(MAX_NAME_LEN)?;
        let instance = r.get_string(MAX_INST_LEN)?;
        let realm = r.get_string(MAX_REALM_LEN)?;
        let client = Principal::new(&name, &instance, &realm);
        let time = r.get_u32()?;

        let reply = if msg_type == MessageType::ErrReply {
            let code = r.get_u32()?;
            let text = match r.remaining() {
                0 => String::new(),
                _ => r.get_string(MAX_KTXT_LEN)?,
            };
            // Errors about malformed requests may not name a valid principal.
            KerberosReply::Error(ErrorReply {
                client: client.unwrap_or_default(),
                time,
                code,
                text,
            })
        } else {
            let client = client.map_err(|_| {
                error!(%name, %instance, %realm, "Reply names an invalid principal");
                KrbError::MalformedMessage
            })?;
            let n_tickets = r.get_u8()?;
            let exp_date = r.get_u32()?;
            let kvno = r.get_u8()?;
            let clen = r.get_u16()? as usize;
            let cipher = r.get_bytes(clen)?.to_vec();
            KerberosReply::Success(KdcReply {
                client,
                time,
                n_tickets,
                exp_date,
                kvno,
                cipher,
                order: r.order(),
            })
        };

        trace!(?reply);
        Ok(reply)
    }
}
