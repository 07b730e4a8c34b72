//! The encrypted ticket, and the cipher block that carries a fresh ticket and its session key
//! back to the requesting client.

use super::wire::{padded_len, ByteOrder, KReader, KText};
use super::{DerivedKey, Principal, SessionKey};
use crate::constants::*;
use crate::crypto::{des_pcbc_in_place, Direction};
use crate::error::KrbError;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{error, trace};
use zeroize::Zeroizing;

/// An opaque encrypted ticket. Its length is always a whole number of cipher blocks.
#[derive(Clone, PartialEq, Eq)]
pub struct Ticket(Vec<u8>);

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ticket").field(&self.0.len()).finish()
    }
}

impl Ticket {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KrbError> {
        if bytes.is_empty() || bytes.len() % DES_BLOCK_SIZE != 0 || bytes.len() > MAX_KTXT_LEN {
            error!(len = bytes.len(), "Ticket length is not a valid block multiple");
            return Err(KrbError::BadTicketFormat);
        }
        Ok(Ticket(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The plaintext of a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketContents {
    /// Low bit is the byte order the ticket was written in.
    pub flags: u8,
    pub client: Principal,
    pub address: Ipv4Addr,
    pub session_key: SessionKey,
    pub lifetime: u8,
    pub issue_time: u32,
    /// The realm of the service is implied by whoever holds its key.
    pub service_name: String,
    pub service_instance: String,
}

/// Serialise and encrypt a ticket under the service's key. On failure nothing is emitted and the
/// working buffer is zeroed.
pub fn create_ticket(contents: &TicketContents, key: &DerivedKey) -> Result<Ticket, KrbError> {
    let mut buf = KText::with_capacity(MAX_KTXT_LEN);

    let res = encode_ticket(&mut buf, contents).and_then(|()| {
        if padded_len(buf.len()) > MAX_KTXT_LEN {
            error!(len = buf.len(), "Ticket would exceed the maximum size");
            return Err(KrbError::TicketTooLarge);
        }
        buf.pad_to_block()?;
        des_pcbc_in_place(key.k(), buf.as_mut_slice(), Direction::Encrypt)
    });

    match res {
        Ok(()) => Ok(Ticket(buf.as_slice().to_vec())),
        Err(err) => {
            buf.zero();
            Err(match err {
                KrbError::BufferOverflow => KrbError::TicketTooLarge,
                e => e,
            })
        }
    }
}

fn encode_ticket(buf: &mut KText, c: &TicketContents) -> Result<(), KrbError> {
    let order = ByteOrder::from_flag(c.flags);
    buf.put_u8(c.flags)?;
    buf.put_nir(c.client.name(), c.client.instance(), Some(c.client.realm()))?;
    buf.put_address(c.address)?;
    buf.put_bytes(c.session_key.k())?;
    buf.put_u8(c.lifetime)?;
    buf.put_int(c.issue_time, 4, order)?;
    buf.put_nir(&c.service_name, &c.service_instance, None)?;
    Ok(())
}

/// Decrypt and parse a ticket. A client with an empty realm is in `local_realm`.
pub fn decompose_ticket(
    ticket: &Ticket,
    key: &DerivedKey,
    local_realm: &str,
) -> Result<TicketContents, KrbError> {
    let mut plain = Zeroizing::new(ticket.0.clone());
    des_pcbc_in_place(key.k(), &mut plain, Direction::Decrypt)?;

    let mut r = KReader::new(&plain, ByteOrder::Big);
    let flags = r.get_u8()?;
    r.set_order(ByteOrder::from_flag(flags));

    let name = ticket_string(&mut r, MAX_NAME_LEN)?;
    let instance = ticket_string(&mut r, MAX_INST_LEN)?;
    let mut realm = ticket_string(&mut r, MAX_REALM_LEN)?;
    if realm.is_empty() {
        realm = local_realm.to_string();
    }

    let address = r.get_address().map_err(undecryptable)?;
    let session_key = SessionKey::new(r.get_array::<DES_KEY_LEN>().map_err(undecryptable)?);
    let lifetime = r.get_u8().map_err(undecryptable)?;
    let issue_time = r.get_u32().map_err(undecryptable)?;
    let service_name = ticket_string(&mut r, MAX_NAME_LEN)?;
    let service_instance = ticket_string(&mut r, MAX_INST_LEN)?;

    check_padding(&mut r)?;

    let client = Principal::new(&name, &instance, &realm).map_err(|_| {
        error!("Ticket client principal is invalid");
        KrbError::BadTicketFormat
    })?;

    trace!(%client, %service_name, %service_instance, lifetime, issue_time);

    Ok(TicketContents {
        flags,
        client,
        address,
        session_key,
        lifetime,
        issue_time,
        service_name,
        service_instance,
    })
}

fn ticket_string(r: &mut KReader<'_>, max: usize) -> Result<String, KrbError> {
    r.get_string(max).map_err(|err| match err {
        KrbError::ValueOutOfRange => KrbError::BadTicketFormat,
        e => undecryptable(e),
    })
}

fn undecryptable(err: KrbError) -> KrbError {
    error!(?err, "Decrypted block does not parse");
    KrbError::DecryptionOrIntegrityFailure
}

fn check_padding(r: &mut KReader<'_>) -> Result<(), KrbError> {
    let rest = r.rest();
    if rest.len() >= DES_BLOCK_SIZE || rest.iter().any(|b| *b != 0) {
        error!(trailing = rest.len(), "Decrypted block has unexpected trailing data");
        return Err(KrbError::DecryptionOrIntegrityFailure);
    }
    Ok(())
}

/// The plaintext of the cipher block in a KDC reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphContents {
    pub session_key: SessionKey,
    pub service: Principal,
    pub lifetime: u8,
    pub kvno: u8,
    pub ticket: Ticket,
    pub kdc_time: u32,
}

/// Wrap a freshly issued ticket and its session key under the requester's key.
pub fn create_ciph(contents: &CiphContents, key: &DerivedKey) -> Result<Vec<u8>, KrbError> {
    let mut buf = KText::with_capacity(MAX_KTXT_LEN);
    let tkt_len = u8::try_from(contents.ticket.len()).map_err(|_| {
        error!(len = contents.ticket.len(), "Ticket does not fit a one byte length");
        KrbError::ValueOutOfRange
    })?;

    let res = (|| -> Result<(), KrbError> {
        buf.put_bytes(contents.session_key.k())?;
        let s = &contents.service;
        buf.put_nir(s.name(), s.instance(), Some(s.realm()))?;
        buf.put_u8(contents.lifetime)?;
        buf.put_u8(contents.kvno)?;
        buf.put_u8(tkt_len)?;
        buf.put_bytes(contents.ticket.as_bytes())?;
        buf.put_u32(contents.kdc_time)?;
        buf.pad_to_block()?;
        des_pcbc_in_place(key.k(), buf.as_mut_slice(), Direction::Encrypt)
    })();

    match res {
        Ok(()) => Ok(buf.as_slice().to_vec()),
        Err(err) => {
            buf.zero();
            Err(err)
        }
    }
}

/// Decrypt the cipher block of a KDC reply. A block that does not parse after decryption means
/// the key was wrong.
pub fn decompose_ciph(
    cipher: &[u8],
    key: &DerivedKey,
    order: ByteOrder,
) -> Result<CiphContents, KrbError> {
    if cipher.is_empty() || cipher.len() % DES_BLOCK_SIZE != 0 {
        error!(len = cipher.len(), "Reply cipher is not block aligned");
        return Err(KrbError::MalformedMessage);
    }

    let mut plain = Zeroizing::new(cipher.to_vec());
    des_pcbc_in_place(key.k(), &mut plain, Direction::Decrypt)?;

    let mut r = KReader::new(&plain, order);
    let parsed = (|| -> Result<CiphContents, KrbError> {
        let session_key = SessionKey::new(r.get_array::<DES_KEY_LEN>()?);
        let name = r.get_string(MAX_NAME_LEN)?;
        let instance = r.get_string(MAX_INST_LEN)?;
        let realm = r.get_string(MAX_REALM_LEN)?;
        let lifetime = r.get_u8()?;
        let kvno = r.get_u8()?;
        let tkt_len = r.get_u8()? as usize;
        let ticket = Ticket::from_bytes(r.get_bytes(tkt_len)?)?;
        let kdc_time = r.get_u32()?;
        check_padding(&mut r)?;
        let service = Principal::new(&name, &instance, &realm)?;
        Ok(CiphContents {
            session_key,
            service,
            lifetime,
            kvno,
            ticket,
            kdc_time,
        })
    })();

    parsed.map_err(undecryptable)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents() -> TicketContents {
        TicketContents {
            flags: 0,
            client: Principal::new("alice", "", "EXAMPLE.COM").unwrap(),
            address: Ipv4Addr::new(192, 0, 2, 10),
            session_key: SessionKey::new([0x13, 0x34, 0x57, 0x79, 0x9b, 0xbc, 0xdf, 0xf1]),
            lifetime: 0x60,
            issue_time: 700_000_000,
            service_name: "krbtgt".to_string(),
            service_instance: "EXAMPLE.COM".to_string(),
        }
    }

    #[test]
    fn test_ticket_roundtrip() {
        let _ = tracing_subscriber::fmt::try_init();
        let key = DerivedKey::from_passphrase("krbtgt-secret", 1).unwrap();
        let c = contents();

        let ticket = create_ticket(&c, &key).unwrap();
        assert_eq!(ticket.len() % DES_BLOCK_SIZE, 0);

        let d = decompose_ticket(&ticket, &key, "EXAMPLE.COM").unwrap();
        assert_eq!(d, c);
    }

    #[test]
    fn test_ticket_wrong_key_fails() {
        let key = DerivedKey::from_passphrase("krbtgt-secret", 1).unwrap();
        let other = DerivedKey::from_passphrase("not-the-secret", 1).unwrap();
        let ticket = create_ticket(&contents(), &key).unwrap();
        assert!(decompose_ticket(&ticket, &other, "EXAMPLE.COM").is_err());
    }

    #[test]
    fn test_ticket_empty_realm_is_local() {
        let key = DerivedKey::from_passphrase("krbtgt-secret", 1).unwrap();
        let mut c = contents();
        c.client = Principal::new("bob", "admin", "").unwrap();
        let ticket = create_ticket(&c, &key).unwrap();
        let d = decompose_ticket(&ticket, &key, "LOCAL.REALM").unwrap();
        assert_eq!(d.client.realm(), "LOCAL.REALM");
        assert_eq!(d.client.instance(), "admin");
    }

    #[test]
    fn test_ticket_overlong_string_is_bad_format() {
        let key = DerivedKey::from_passphrase("krbtgt-secret", 1).unwrap();
        // Hand build a ticket with a 45 byte client name.
        let mut buf = KText::new();
        buf.put_u8(0).unwrap();
        buf.put_string(&"n".repeat(45)).unwrap();
        buf.put_bytes(&[0; 32]).unwrap();
        buf.pad_to_block().unwrap();
        let mut raw = buf.as_slice().to_vec();
        des_pcbc_in_place(key.k(), &mut raw, Direction::Encrypt).unwrap();

        let ticket = Ticket::from_bytes(&raw).unwrap();
        assert_eq!(
            decompose_ticket(&ticket, &key, "EXAMPLE.COM"),
            Err(KrbError::BadTicketFormat)
        );
    }

    #[test]
    fn test_ciph_roundtrip_and_bad_password() {
        let tgs_key = DerivedKey::from_passphrase("krbtgt-secret", 1).unwrap();
        let user_key = DerivedKey::from_passphrase("alice-password", 3).unwrap();
        let wrong = DerivedKey::from_passphrase("alice-passw0rd", 3).unwrap();
        let ticket = create_ticket(&contents(), &tgs_key).unwrap();

        let ciph = CiphContents {
            session_key: contents().session_key,
            service: Principal::krbtgt("EXAMPLE.COM", "EXAMPLE.COM").unwrap(),
            lifetime: 0x60,
            kvno: 1,
            ticket,
            kdc_time: 700_000_001,
        };
        let block = create_ciph(&ciph, &user_key).unwrap();
        assert_eq!(block.len() % DES_BLOCK_SIZE, 0);

        let out = decompose_ciph(&block, &user_key, ByteOrder::Big).unwrap();
        assert_eq!(out, ciph);

        assert_eq!(
            decompose_ciph(&block, &wrong, ByteOrder::Big),
            Err(KrbError::DecryptionOrIntegrityFailure)
        );
        assert_eq!(
            decompose_ciph(&block[..block.len() - 3], &user_key, ByteOrder::Big),
            Err(KrbError::MalformedMessage)
        );
    }

    #[test]
    fn test_ticket_from_bytes_requires_blocks() {
        assert_eq!(
            Ticket::from_bytes(&[0; 9]),
            Err(KrbError::BadTicketFormat)
        );
        assert_eq!(Ticket::from_bytes(&[]), Err(KrbError::BadTicketFormat));
        assert!(Ticket::from_bytes(&[0; 16]).is_ok());
    }
}
