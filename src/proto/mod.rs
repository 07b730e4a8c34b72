pub mod ap_req;
pub mod private;
pub mod reply;
pub mod request;
pub mod safe;
pub mod ticket;
pub mod time;
pub mod wire;

pub use self::ticket::{Ticket, TicketContents};
pub use self::time::LifetimeCodec;
pub use self::wire::{ByteOrder, KReader, KText};

use crate::constants::*;
use crate::crypto::{des_string_to_key, random_des_key};
use crate::error::KrbError;
use crate::keytab::Srvtab;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use std::path::PathBuf;
use tracing::{error, trace};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    KdcRequest = 2,
    KdcReply = 4,
    ApplRequest = 6,
    ApplRequestMutual = 8,
    ErrReply = 10,
    Private = 12,
    Safe = 14,
    ApplErr = 16,
}

impl MessageType {
    /// The message type byte, tagged with the byte order the rest of the message uses.
    pub fn to_byte(self, order: ByteOrder) -> u8 {
        u8::from(self) | order.flag()
    }

    pub fn from_byte(byte: u8) -> Result<(MessageType, ByteOrder), KrbError> {
        let order = ByteOrder::from_flag(byte);
        MessageType::try_from(byte & !0x01)
            .map(|mt| (mt, order))
            .map_err(|err| {
                error!(?err, "Unknown message type");
                KrbError::MessageTypeMismatch
            })
    }
}

pub(crate) fn put_header(
    buf: &mut KText,
    msg_type: MessageType,
) -> Result<(), KrbError> {
    buf.put_u8(KRB_PROT_VERSION)?;
    buf.put_u8(msg_type.to_byte(ByteOrder::Big))?;
    Ok(())
}

/// Read the version and message type, checking both, and switch the reader to the byte order
/// the sender used.
pub(crate) fn read_header(
    reader: &mut KReader<'_>,
    expected: &[MessageType],
) -> Result<MessageType, KrbError> {
    let pvno = reader.get_u8()?;
    if pvno != KRB_PROT_VERSION {
        error!(pvno, "Unsupported protocol version");
        return Err(KrbError::ProtocolVersionMismatch);
    }

    let (msg_type, order) = MessageType::from_byte(reader.get_u8()?)?;
    if !expected.contains(&msg_type) {
        error!(?msg_type, ?expected, "Unexpected message type");
        return Err(KrbError::MessageTypeMismatch);
    }

    trace!(?msg_type, ?order);
    reader.set_order(order);
    Ok(msg_type)
}

/// A name.instance@realm triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Principal {
    name: String,
    instance: String,
    realm: String,
}

impl Principal {
    pub fn new(name: &str, instance: &str, realm: &str) -> Result<Self, KrbError> {
        check_component(name, MAX_NAME_LEN)?;
        check_component(instance, MAX_INST_LEN)?;
        check_component(realm, MAX_REALM_LEN)?;
        if name.is_empty() {
            error!("Principal name may not be empty");
            return Err(KrbError::InvalidPrincipalName);
        }
        Ok(Principal {
            name: name.to_string(),
            instance: instance.to_string(),
            realm: realm.to_string(),
        })
    }

    /// The ticket granting service of `realm`, as issued by `issuing_realm`.
    pub fn krbtgt(realm: &str, issuing_realm: &str) -> Result<Self, KrbError> {
        Principal::new(KRB_TICKET_GRANTING_TICKET, realm, issuing_realm)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn is_krbtgt(&self) -> bool {
        self.name == KRB_TICKET_GRANTING_TICKET
    }

    pub fn with_realm(&self, realm: &str) -> Result<Self, KrbError> {
        Principal::new(&self.name, &self.instance, realm)
    }

    /// Parse `name[.instance][@realm]`, where a backslash escapes the next character. A missing
    /// realm becomes `default_realm`.
    pub fn parse(s: &str, default_realm: &str) -> Result<Self, KrbError> {
        #[derive(PartialEq)]
        enum Field {
            Name,
            Instance,
            Realm,
        }

        let mut field = Field::Name;
        let mut name = String::new();
        let mut instance = String::new();
        let mut realm = String::new();
        let mut chars = s.chars();

        while let Some(c) = chars.next() {
            let (c, escaped) = if c == '\\' {
                match chars.next() {
                    Some(n) => (n, true),
                    None => {
                        error!("Trailing escape in principal name");
                        return Err(KrbError::InvalidPrincipalName);
                    }
                }
            } else {
                (c, false)
            };

            match (c, escaped, &field) {
                ('.', false, Field::Name) => field = Field::Instance,
                ('.', false, Field::Instance) => {
                    error!("Instance may not contain an unescaped '.'");
                    return Err(KrbError::InvalidPrincipalName);
                }
                ('@', false, Field::Realm) => {
                    error!("Realm may not contain an unescaped '@'");
                    return Err(KrbError::InvalidPrincipalName);
                }
                ('@', false, _) => field = Field::Realm,
                (c, _, Field::Name) => name.push(c),
                (c, _, Field::Instance) => instance.push(c),
                (c, _, Field::Realm) => realm.push(c),
            }
        }

        if field != Field::Realm {
            realm = default_realm.to_string();
        }

        Principal::new(&name, &instance, &realm)
    }
}

fn check_component(s: &str, max: usize) -> Result<(), KrbError> {
    if s.len() > max || s.as_bytes().contains(&0) {
        error!(len = s.len(), max, "Principal component is invalid");
        Err(KrbError::InvalidPrincipalName)
    } else {
        Ok(())
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    for c in s.chars() {
        if matches!(c, '.' | '@' | '\\') {
            write!(f, "\\")?;
        }
        write!(f, "{c}")?;
    }
    Ok(())
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_escaped(f, &self.name)?;
        if !self.instance.is_empty() {
            write!(f, ".")?;
            write_escaped(f, &self.instance)?;
        }
        if !self.realm.is_empty() {
            write!(f, "@")?;
            // Realms are conventionally dotted, only '@' and '\' need escaping.
            for c in self.realm.chars() {
                if matches!(c, '@' | '\\') {
                    write!(f, "\\")?;
                }
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// A ticket's session key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    k: [u8; DES_KEY_LEN],
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey").field("k", &"Des").finish()
    }
}

impl SessionKey {
    pub fn new(k: [u8; DES_KEY_LEN]) -> Self {
        SessionKey { k }
    }

    pub fn generate() -> Self {
        SessionKey {
            k: random_des_key(),
        }
    }

    pub(crate) fn k(&self) -> &[u8; DES_KEY_LEN] {
        &self.k
    }
}

/// A long term key, either derived from a password or loaded from a srvtab.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    k: [u8; DES_KEY_LEN],
    kvno: u8,
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("k", &"Des")
            .field("kvno", &self.kvno)
            .finish()
    }
}

impl DerivedKey {
    pub fn new(k: [u8; DES_KEY_LEN], kvno: u8) -> Self {
        DerivedKey { k, kvno }
    }

    pub fn from_passphrase(passphrase: &str, kvno: u8) -> Result<Self, KrbError> {
        des_string_to_key(passphrase.as_bytes()).map(|k| DerivedKey { k, kvno })
    }

    pub fn kvno(&self) -> u8 {
        self.kvno
    }

    pub(crate) fn k(&self) -> &[u8; DES_KEY_LEN] {
        &self.k
    }
}

impl From<&SessionKey> for DerivedKey {
    fn from(key: &SessionKey) -> Self {
        DerivedKey { k: key.k, kvno: 0 }
    }
}

/// How the client key for an initial ticket request is obtained.
pub enum KeyProc {
    Password(Zeroizing<String>),
    Srvtab(PathBuf),
    Key(DerivedKey),
}

impl fmt::Debug for KeyProc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyProc::Password(_) => f.write_str("KeyProc::Password"),
            KeyProc::Srvtab(p) => f.debug_tuple("KeyProc::Srvtab").field(p).finish(),
            KeyProc::Key(k) => f.debug_tuple("KeyProc::Key").field(k).finish(),
        }
    }
}

impl KeyProc {
    pub fn password(passphrase: &str) -> Self {
        KeyProc::Password(Zeroizing::new(passphrase.to_string()))
    }

    /// Resolve the key for `client`, at the key version the KDC reported.
    pub fn key_for(&self, client: &Principal, kvno: u8) -> Result<DerivedKey, KrbError> {
        match self {
            KeyProc::Password(pw) => DerivedKey::from_passphrase(pw, kvno),
            KeyProc::Srvtab(path) => {
                let srvtab = Srvtab::load(path)?;
                srvtab.find(client, kvno)
            }
            KeyProc::Key(k) => Ok(k.clone()),
        }
    }
}

/// One cached credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub service: Principal,
    pub session_key: SessionKey,
    pub lifetime: u8,
    pub kvno: u8,
    pub ticket: Ticket,
    pub issue_date: u32,
}

impl Credential {
    pub fn end_time(&self, codec: LifetimeCodec) -> u32 {
        codec.life_to_time(self.issue_date, self.lifetime)
    }

    pub fn is_expired(&self, now: u32, codec: LifetimeCodec) -> bool {
        self.end_time(codec) < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_parse() {
        let p = Principal::parse("alice", "EXAMPLE.COM").unwrap();
        assert_eq!(p, Principal::new("alice", "", "EXAMPLE.COM").unwrap());

        let p = Principal::parse("rcmd.host@OTHER.ORG", "EXAMPLE.COM").unwrap();
        assert_eq!(p.name(), "rcmd");
        assert_eq!(p.instance(), "host");
        assert_eq!(p.realm(), "OTHER.ORG");
        assert_eq!(p.to_string(), "rcmd.host@OTHER.ORG");

        let p = Principal::parse("a\\.b.c\\@d", "R").unwrap();
        assert_eq!(p.name(), "a.b");
        assert_eq!(p.instance(), "c@d");
        assert_eq!(p.to_string(), "a\\.b.c\\@d@R");
        assert_eq!(Principal::parse(&p.to_string(), "X").unwrap(), p);
    }

    #[test]
    fn test_principal_parse_rejects() {
        assert_eq!(
            Principal::parse("a.b.c", "R"),
            Err(KrbError::InvalidPrincipalName)
        );
        assert_eq!(
            Principal::parse("a@R@S", "R"),
            Err(KrbError::InvalidPrincipalName)
        );
        assert_eq!(
            Principal::parse("abc\\", "R"),
            Err(KrbError::InvalidPrincipalName)
        );
        assert_eq!(Principal::parse("", "R"), Err(KrbError::InvalidPrincipalName));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            Principal::parse(&long, "R"),
            Err(KrbError::InvalidPrincipalName)
        );
    }

    #[test]
    fn test_message_type_byte() {
        assert_eq!(MessageType::KdcReply.to_byte(ByteOrder::Little), 5);
        assert_eq!(
            MessageType::from_byte(15),
            Ok((MessageType::Safe, ByteOrder::Little))
        );
        assert_eq!(
            MessageType::from_byte(3),
            Ok((MessageType::KdcRequest, ByteOrder::Little))
        );
        assert_eq!(
            MessageType::from_byte(20),
            Err(KrbError::MessageTypeMismatch)
        );
    }

    #[test]
    fn test_read_header_checks_version_first() {
        let mut r = KReader::new(&[5, 4], ByteOrder::Big);
        assert_eq!(
            read_header(&mut r, &[MessageType::KdcReply]),
            Err(KrbError::ProtocolVersionMismatch)
        );
        let mut r = KReader::new(&[4, 15], ByteOrder::Big);
        assert_eq!(
            read_header(&mut r, &[MessageType::KdcReply]),
            Err(KrbError::MessageTypeMismatch)
        );
        let mut r = KReader::new(&[4, 5], ByteOrder::Big);
        assert_eq!(
            read_header(&mut r, &[MessageType::KdcReply]),
            Ok(MessageType::KdcReply)
        );
        assert_eq!(r.order(), ByteOrder::Little);
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let k = SessionKey::new([0x42; 8]);
        assert!(!format!("{:?}", k).contains("42"));
        let d = DerivedKey::from_passphrase("password", 1).unwrap();
        assert_eq!(d.kvno(), 1);
        assert!(format!("{:?}", KeyProc::password("hunter2")).find("hunter2").is_none());
    }
}
