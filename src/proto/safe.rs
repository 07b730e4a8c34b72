//! Integrity protected application messages, and the pieces shared with private messages: the
//! direction encoded timestamp and the per-caller [MessageContext].

use super::time::{within_skew, KrbTime};
use super::wire::{ByteOrder, KReader, KText};
use super::{put_header, read_header, MessageType, SessionKey};
use crate::config::{AddressEquivalence, ClientConfig};
use crate::constants::*;
use crate::crypto::{fixup_quad_checksum, keyed_checksum};
use crate::error::KrbError;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, error};

/// The two word orderings peers have used for the safe message checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumVariant {
    Current,
    Legacy,
}

impl ChecksumVariant {
    fn other(self) -> Self {
        match self {
            ChecksumVariant::Current => ChecksumVariant::Legacy,
            ChecksumVariant::Legacy => ChecksumVariant::Current,
        }
    }
}

/// State for building and reading safe and private messages. The checksum variant a peer was
/// last seen using is latched here and reused for outgoing messages for as long as the caller
/// keeps the context.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub clock_skew: u32,
    pub time_offset: i64,
    pub reverse_lsb_test: bool,
    pub equivalence: AddressEquivalence,
    checksum_variant: Option<ChecksumVariant>,
}

impl Default for MessageContext {
    fn default() -> Self {
        MessageContext {
            clock_skew: CLOCK_SKEW,
            time_offset: 0,
            reverse_lsb_test: false,
            equivalence: AddressEquivalence::default(),
            checksum_variant: None,
        }
    }
}

impl MessageContext {
    pub fn from_config(config: &ClientConfig, equivalence: AddressEquivalence) -> Self {
        MessageContext {
            clock_skew: config.clock_skew,
            reverse_lsb_test: config.reverse_lsb_test,
            equivalence,
            ..Default::default()
        }
    }

    /// The variant latched from a previously read message, if any.
    pub fn checksum_variant(&self) -> Option<ChecksumVariant> {
        self.checksum_variant
    }

    pub fn reset_checksum_variant(&mut self) {
        self.checksum_variant = None;
    }

    fn now(&self) -> Result<KrbTime, KrbError> {
        KrbTime::now(self.time_offset)
    }
}

/// A verified application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgData {
    pub app_data: Vec<u8>,
    pub time_sec: u32,
    pub time_5ms: u8,
    pub order: ByteOrder,
    pub checksum: Option<[u8; CHECKSUM_LEN]>,
}

fn octets_lsb_first_less(a: &[u8], b: &[u8]) -> bool {
    a.iter().rev().lt(b.iter().rev())
}

/// Encode a timestamp so its sign carries the direction of travel. Applying it again with the
/// same sender and receiver recovers the original value.
pub fn lsb_time(t: u32, sender: &SocketAddrV4, receiver: &SocketAddrV4, reverse: bool) -> u32 {
    let s_ip = sender.ip().octets();
    let r_ip = receiver.ip().octets();

    let mut negative = if s_ip != r_ip {
        octets_lsb_first_less(&s_ip, &r_ip)
    } else {
        octets_lsb_first_less(&sender.port().to_be_bytes(), &receiver.port().to_be_bytes())
    };

    if reverse {
        negative = !negative;
    }

    if negative {
        t.wrapping_neg()
    } else {
        t
    }
}

/// Write len, data, time_5ms, sender address and the direction encoded time.
pub(crate) fn put_msg_block(
    buf: &mut KText,
    data: &[u8],
    now: &KrbTime,
    sender: &SocketAddrV4,
    receiver: &SocketAddrV4,
    reverse: bool,
) -> Result<(), KrbError> {
    let len = u32::try_from(data.len()).map_err(|_| KrbError::ValueOutOfRange)?;
    buf.put_u32(len)?;
    buf.put_bytes(data)?;
    buf.put_u8(now.time_5ms())?;
    buf.put_address(*sender.ip())?;
    buf.put_u32(lsb_time(now.sec, sender, receiver, reverse))?;
    Ok(())
}

/// Read the fields following the application data and check sender address and skew.
pub(crate) fn check_msg_trailer(
    r: &mut KReader<'_>,
    ctx: &MessageContext,
    sender: &SocketAddrV4,
    receiver: &SocketAddrV4,
) -> Result<(u8, u32), KrbError> {
    let time_5ms = r.get_u8()?;
    let src_addr: Ipv4Addr = r.get_address()?;

    if !ctx.equivalence.equivalent(src_addr, *sender.ip()) {
        error!(%src_addr, sender = %sender.ip(), "Message sender address mismatch");
        return Err(KrbError::AddressMismatch);
    }

    let time_sec = lsb_time(r.get_u32()?, sender, receiver, ctx.reverse_lsb_test);
    let now = ctx.now()?;
    if !within_skew(now.sec, time_sec, ctx.clock_skew) {
        error!(time_sec, now = now.sec, "Message time is outside the allowed skew");
        return Err(KrbError::ClockSkewExceeded);
    }

    Ok((time_5ms, time_sec))
}

fn checksum_with(
    key: &SessionKey,
    block: &[u8],
    variant: ChecksumVariant,
) -> Result<[u8; CHECKSUM_LEN], KrbError> {
    let mut cksum = keyed_checksum(key.k(), block)?;
    if variant == ChecksumVariant::Legacy {
        fixup_quad_checksum(&mut cksum);
    }
    Ok(cksum)
}

/// Build a safe message carrying `data` from `sender` to `receiver`.
pub fn mk_safe(
    data: &[u8],
    key: &SessionKey,
    sender: &SocketAddrV4,
    receiver: &SocketAddrV4,
    ctx: &MessageContext,
) -> Result<Vec<u8>, KrbError> {
    let now = ctx.now()?;
    let mut buf = KText::new();

    put_header(&mut buf, MessageType::Safe)?;
    put_msg_block(&mut buf, data, &now, sender, receiver, ctx.reverse_lsb_test)?;

    let variant = ctx.checksum_variant.unwrap_or(ChecksumVariant::Current);
    let cksum = checksum_with(key, &buf.as_slice()[2..], variant)?;
    buf.put_bytes(&cksum)?;

    Ok(buf.as_slice().to_vec())
}

/// Verify a safe message. Checks run in order: version, message type, declared length, sender
/// address, clock skew, then the checksum in either variant.
pub fn rd_safe(
    msg: &[u8],
    key: &SessionKey,
    sender: &SocketAddrV4,
    receiver: &SocketAddrV4,
    ctx: &mut MessageContext,
) -> Result<MsgData, KrbError> {
    let mut r = KReader::new(msg, ByteOrder::Big);
    read_header(&mut r, &[MessageType::Safe])?;

    let app_length = r.get_u32()? as usize;
    if app_length.saturating_add(31) > msg.len() {
        error!(app_length, len = msg.len(), "Safe message length is inconsistent");
        return Err(KrbError::MalformedMessage);
    }
    let app_data = r.get_bytes(app_length)?.to_vec();
    let (time_5ms, time_sec) = check_msg_trailer(&mut r, ctx, sender, receiver)?;

    let block = &msg[2..r.position()];
    let received: [u8; CHECKSUM_LEN] = r.get_array()?;

    let first = ctx.checksum_variant.unwrap_or(ChecksumVariant::Current);
    let matched = [first, first.other()].into_iter().find_map(|variant| {
        match checksum_with(key, block, variant) {
            Ok(c) if c == received => Some(Ok(variant)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }
    });

    match matched {
        Some(Ok(variant)) => {
            if ctx.checksum_variant != Some(variant) {
                debug!(?variant, "Latching safe message checksum variant");
                ctx.checksum_variant = Some(variant);
            }
        }
        Some(Err(e)) => return Err(e),
        None => {
            error!("Safe message checksum does not match");
            return Err(KrbError::DecryptionOrIntegrityFailure);
        }
    }

    Ok(MsgData {
        app_data,
        time_sec,
        time_5ms,
        order: r.order(),
        checksum: Some(received),
    })
}
