//! The application request: a ticket plus an authenticator proving possession of its session
//! key, sent by a client directly to a service.

use super::private::{mk_priv, rd_priv};
use super::safe::MessageContext;
use super::ticket::{decompose_ticket, TicketContents};
use super::time::{within_skew, KrbTime, LifetimeCodec};
use super::wire::{get_int, ByteOrder, KReader, KText};
use super::{put_header, read_header, Credential, DerivedKey, MessageType, Principal, SessionKey};
use super::Ticket;
use crate::constants::*;
use crate::crypto::{des_pcbc_in_place, Direction};
use crate::error::KrbError;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, error, instrument, trace};
use zeroize::Zeroizing;

/// Finds the long term key a service's tickets are encrypted under.
pub trait ServerKeyLookup {
    fn server_key(
        &self,
        service: &str,
        instance: &str,
        realm: &str,
        kvno: u8,
    ) -> Result<DerivedKey, KrbError>;
}

impl ServerKeyLookup for DerivedKey {
    fn server_key(&self, _: &str, _: &str, _: &str, _: u8) -> Result<DerivedKey, KrbError> {
        Ok(self.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticator {
    pub client: Principal,
    pub checksum: u32,
    pub time: KrbTime,
}

impl Authenticator {
    fn encrypt(&self, key: &SessionKey) -> Result<Vec<u8>, KrbError> {
        let mut buf = KText::new();
        let c = &self.client;
        buf.put_nir(c.name(), c.instance(), Some(c.realm()))?;
        buf.put_u32(self.checksum)?;
        buf.put_u8(self.time.time_5ms())?;
        buf.put_u32(self.time.sec)?;
        buf.pad_to_block()?;
        des_pcbc_in_place(key.k(), buf.as_mut_slice(), Direction::Encrypt)?;
        Ok(buf.as_slice().to_vec())
    }

    fn decrypt(
        cipher: &[u8],
        key: &SessionKey,
        order: ByteOrder,
    ) -> Result<(Authenticator, u8), KrbError> {
        let mut plain = Zeroizing::new(cipher.to_vec());
        des_pcbc_in_place(key.k(), &mut plain, Direction::Decrypt)?;

        let mut r = KReader::new(&plain, order);
        let parsed = (|| -> Result<(Authenticator, u8), KrbError> {
            let name = r.get_string(MAX_NAME_LEN)?;
            let instance = r.get_string(MAX_INST_LEN)?;
            let realm = r.get_string(MAX_REALM_LEN)?;
            let checksum = r.get_u32()?;
            let time_5ms = r.get_u8()?;
            let sec = r.get_u32()?;
            Ok((
                Authenticator {
                    client: Principal::new(&name, &instance, &realm)?,
                    checksum,
                    time: KrbTime {
                        sec,
                        usec: time_5ms as u32 * 5000,
                    },
                },
                time_5ms,
            ))
        })();

        parsed.map_err(|err| {
            error!(?err, "Authenticator does not decrypt");
            KrbError::DecryptionOrIntegrityFailure
        })
    }
}

/// An application request as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApReq {
    pub mutual: bool,
    pub kvno: u8,
    /// The realm whose key encrypted the ticket.
    pub realm: String,
    pub ticket: Ticket,
    pub authenticator: Vec<u8>,
}

impl ApReq {
    pub(crate) fn encode(&self, buf: &mut KText) -> Result<(), KrbError> {
        let tkt_len = one_byte_len(self.ticket.len())?;
        let auth_len = one_byte_len(self.authenticator.len())?;

        let msg_type = if self.mutual {
            MessageType::ApplRequestMutual
        } else {
            MessageType::ApplRequest
        };
        put_header(buf, msg_type)?;
        buf.put_u8(self.kvno)?;
        buf.put_string(&self.realm)?;
        buf.put_u8(tkt_len)?;
        buf.put_u8(auth_len)?;
        buf.put_bytes(self.ticket.as_bytes())?;
        buf.put_bytes(&self.authenticator)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, KrbError> {
        let mut buf = KText::new();
        self.encode(&mut buf)?;
        Ok(buf.as_slice().to_vec())
    }

    /// Parse a request, leaving the reader positioned after it.
    pub(crate) fn decode(r: &mut KReader<'_>) -> Result<ApReq, KrbError> {
        let msg_type = read_header(r, &[MessageType::ApplRequest, MessageType::ApplRequestMutual])?;
        let kvno = r.get_u8()?;
        let realm = r.get_string(MAX_REALM_LEN).map_err(|err| {
            error!(?err, "Request realm is invalid");
            KrbError::MalformedMessage
        })?;
        let tkt_len = r.get_u8()? as usize;
        let auth_len = r.get_u8()? as usize;
        let ticket = Ticket::from_bytes(r.get_bytes(tkt_len)?)?;
        let authenticator = r.get_bytes(auth_len)?.to_vec();

        if authenticator.is_empty() || authenticator.len() % DES_BLOCK_SIZE != 0 {
            error!(len = authenticator.len(), "Authenticator is not block aligned");
            return Err(KrbError::MalformedMessage);
        }

        Ok(ApReq {
            mutual: msg_type == MessageType::ApplRequestMutual,
            kvno,
            realm,
            ticket,
            authenticator,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ApReq, KrbError> {
        let mut r = KReader::new(bytes, ByteOrder::Big);
        Self::decode(&mut r)
    }
}

fn one_byte_len(len: usize) -> Result<u8, KrbError> {
    u8::try_from(len).map_err(|_| {
        error!(len, "Field does not fit a one byte length");
        KrbError::ValueOutOfRange
    })
}

/// Build the request proving `client` holds `cred`, binding `checksum` into the authenticator.
pub fn build_request(
    client: &Principal,
    cred: &Credential,
    checksum: u32,
    mutual: bool,
    now: KrbTime,
) -> Result<ApReq, KrbError> {
    let authenticator = Authenticator {
        client: client.clone(),
        checksum,
        time: now,
    }
    .encrypt(&cred.session_key)?;

    trace!(service = %cred.service, kvno = cred.kvno, mutual);

    Ok(ApReq {
        mutual,
        kvno: cred.kvno,
        realm: cred.service.realm().to_string(),
        ticket: cred.ticket.clone(),
        authenticator,
    })
}

/// The outcome of a verified request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthData {
    pub client: Principal,
    pub checksum: u32,
    pub session_key: SessionKey,
    pub address: Ipv4Addr,
    pub issue_time: u32,
    pub lifetime: u8,
    pub kvno: u8,
    pub time_sec: u32,
    pub time_5ms: u8,
    pub mutual: bool,
}

impl AuthData {
    /// The mutual authentication response: checksum + 1 in a private message.
    pub fn mutual_reply(
        &self,
        local: &SocketAddrV4,
        peer: &SocketAddrV4,
        ctx: &MessageContext,
    ) -> Result<Vec<u8>, KrbError> {
        let reply = self.checksum.wrapping_add(1).to_be_bytes();
        mk_priv(&reply, &self.session_key, local, peer, ctx)
    }
}

/// Check a mutual authentication response from the service at `peer`.
pub fn verify_mutual_reply(
    reply: &[u8],
    session_key: &SessionKey,
    checksum: u32,
    peer: &SocketAddrV4,
    local: &SocketAddrV4,
    ctx: &MessageContext,
) -> Result<(), KrbError> {
    let msg = rd_priv(reply, session_key, peer, local, ctx)?;
    if msg.app_data.len() != 4 {
        error!(len = msg.app_data.len(), "Mutual authentication response is not a checksum");
        return Err(KrbError::MalformedMessage);
    }
    let returned = get_int(&msg.app_data, 4, msg.order)?;
    if returned != checksum.wrapping_add(1) {
        error!("Mutual authentication response does not match");
        return Err(KrbError::MutualAuthenticationFailed);
    }
    Ok(())
}

struct CachedKey {
    realm: String,
    kvno: u8,
    key: DerivedKey,
}

/// Verifies application requests for one service. Holds the most recently used service key so
/// a run of requests under the same key version does not repeat the lookup.
pub struct ApReqVerifier<L: ServerKeyLookup> {
    service_name: String,
    service_instance: String,
    local_realm: String,
    keys: L,
    pub clock_skew: u32,
    pub check_address: bool,
    pub codec: LifetimeCodec,
    pub time_offset: i64,
    cached: Option<CachedKey>,
}

impl<L: ServerKeyLookup> ApReqVerifier<L> {
    pub fn new(service: &Principal, keys: L) -> Self {
        ApReqVerifier {
            service_name: service.name().to_string(),
            service_instance: service.instance().to_string(),
            local_realm: service.realm().to_string(),
            keys,
            clock_skew: CLOCK_SKEW,
            check_address: true,
            codec: LifetimeCodec::Table,
            time_offset: 0,
            cached: None,
        }
    }

    fn service_key(&mut self, realm: &str, kvno: u8) -> Result<DerivedKey, KrbError> {
        if let Some(c) = &self.cached {
            if c.realm == realm && c.kvno == kvno {
                return Ok(c.key.clone());
            }
        }

        let key = self
            .keys
            .server_key(&self.service_name, &self.service_instance, realm, kvno)
            .map_err(|err| {
                error!(?err, realm, kvno, "No service key for request");
                KrbError::DecryptionOrIntegrityFailure
            })?;

        self.cached = Some(CachedKey {
            realm: realm.to_string(),
            kvno,
            key: key.clone(),
        });
        Ok(key)
    }

    /// Parse and verify a request from `peer`. The first failing check is reported.
    pub fn read_request(
        &mut self,
        bytes: &[u8],
        peer: Option<Ipv4Addr>,
    ) -> Result<AuthData, KrbError> {
        let mut r = KReader::new(bytes, ByteOrder::Big);
        let ap_req = ApReq::decode(&mut r)?;
        self.verify(&ap_req, r.order(), peer)
    }

    #[instrument(level = "debug", skip_all)]
    pub fn verify(
        &mut self,
        ap_req: &ApReq,
        order: ByteOrder,
        peer: Option<Ipv4Addr>,
    ) -> Result<AuthData, KrbError> {
        let key = self.service_key(&ap_req.realm, ap_req.kvno)?;
        let TicketContents {
            client,
            address,
            session_key,
            lifetime,
            issue_time,
            service_name,
            service_instance,
            ..
        } = decompose_ticket(&ap_req.ticket, &key, &self.local_realm)?;

        if service_name != self.service_name || service_instance != self.service_instance {
            error!(%service_name, %service_instance, "Ticket is for a different service");
            return Err(KrbError::NotForThisService);
        }

        let (auth, time_5ms) = Authenticator::decrypt(&ap_req.authenticator, &session_key, order)?;

        if auth.client != client {
            error!(ticket = %client, authenticator = %auth.client, "Request identity mismatch");
            return Err(KrbError::IdentityMismatch);
        }

        if self.check_address {
            if let Some(peer) = peer {
                if peer != address {
                    error!(%peer, %address, "Request address mismatch");
                    return Err(KrbError::AddressMismatch);
                }
            }
        }

        let now = KrbTime::now(self.time_offset)?.sec;
        if !within_skew(now, auth.time.sec, self.clock_skew) {
            error!(now, time_sec = auth.time.sec, "Authenticator is outside the allowed skew");
            return Err(KrbError::ClockSkewExceeded);
        }

        if issue_time > now && issue_time - now > self.clock_skew {
            error!(now, issue_time, "Ticket not yet valid");
            return Err(KrbError::TicketNotYetValid);
        }

        if self.codec.life_to_time(issue_time, lifetime) < now {
            error!(now, issue_time, lifetime, "Ticket expired");
            return Err(KrbError::TicketExpired);
        }

        debug!(%client, "application request verified");

        Ok(AuthData {
            client,
            checksum: auth.checksum,
            session_key,
            address,
            issue_time,
            lifetime,
            kvno: ap_req.kvno,
            time_sec: auth.time.sec,
            time_5ms,
            mutual: ap_req.mutual,
        })
    }
}
