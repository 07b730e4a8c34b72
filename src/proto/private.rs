//! Confidential application messages. The same block a safe message checksums is instead
//! encrypted under the session key.

use super::safe::{check_msg_trailer, put_msg_block, MessageContext, MsgData};
use super::time::KrbTime;
use super::wire::{ByteOrder, KReader, KText};
use super::{put_header, read_header, MessageType, SessionKey};
use crate::constants::*;
use crate::crypto::{des_pcbc_in_place, Direction};
use crate::error::KrbError;
use std::net::SocketAddrV4;
use tracing::error;
use zeroize::Zeroizing;

// len(4) + time_5ms(1) + address(4) + time(4)
const PRIV_OVERHEAD: usize = 13;

/// Build a private message carrying `data` from `sender` to `receiver`.
pub fn mk_priv(
    data: &[u8],
    key: &SessionKey,
    sender: &SocketAddrV4,
    receiver: &SocketAddrV4,
    ctx: &MessageContext,
) -> Result<Vec<u8>, KrbError> {
    let now = KrbTime::now(ctx.time_offset)?;

    let mut block = KText::new();
    put_msg_block(&mut block, data, &now, sender, receiver, ctx.reverse_lsb_test)?;
    block.pad_to_block()?;
    des_pcbc_in_place(key.k(), block.as_mut_slice(), Direction::Encrypt)?;

    let mut buf = KText::new();
    put_header(&mut buf, MessageType::Private)?;
    let clen = u32::try_from(block.len()).map_err(|_| KrbError::ValueOutOfRange)?;
    buf.put_u32(clen)?;
    buf.put_bytes(block.as_slice())?;

    Ok(buf.as_slice().to_vec())
}

/// Decrypt and verify a private message.
pub fn rd_priv(
    msg: &[u8],
    key: &SessionKey,
    sender: &SocketAddrV4,
    receiver: &SocketAddrV4,
    ctx: &MessageContext,
) -> Result<MsgData, KrbError> {
    let mut r = KReader::new(msg, ByteOrder::Big);
    read_header(&mut r, &[MessageType::Private])?;
    let order = r.order();

    let clen = r.get_u32()? as usize;
    if clen.saturating_add(2) > msg.len() || clen % DES_BLOCK_SIZE != 0 {
        error!(clen, len = msg.len(), "Private message length is inconsistent");
        return Err(KrbError::MalformedMessage);
    }

    let mut plain = Zeroizing::new(r.get_bytes(clen)?.to_vec());
    des_pcbc_in_place(key.k(), &mut plain, Direction::Decrypt)?;

    let mut pr = KReader::new(&plain, order);
    let app_length = pr.get_u32()? as usize;
    if app_length.saturating_add(PRIV_OVERHEAD) > clen {
        error!(app_length, clen, "Private message payload length is inconsistent");
        return Err(KrbError::MalformedMessage);
    }
    let app_data = pr.get_bytes(app_length)?.to_vec();
    let (time_5ms, time_sec) = check_msg_trailer(&mut pr, ctx, sender, receiver)?;

    Ok(MsgData {
        app_data,
        time_sec,
        time_5ms,
        order,
        checksum: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (SocketAddrV4, SocketAddrV4) {
        (
            "192.0.2.1:1024".parse().unwrap(),
            "192.0.2.2:544".parse().unwrap(),
        )
    }

    #[test]
    fn test_priv_roundtrip() {
        let _ = tracing_subscriber::fmt::try_init();
        let (a, b) = addrs();
        let key = SessionKey::generate();
        let ctx = MessageContext::default();

        for len in [0usize, 3, 11, 100] {
            let data = vec![0x5a; len];
            let msg = mk_priv(&data, &key, &a, &b, &ctx).unwrap();
            // ciphertext must not leak the payload
            assert!(len < 8 || !msg.windows(8).any(|w| w == [0x5a; 8]));
            let out = rd_priv(&msg, &key, &a, &b, &ctx).unwrap();
            assert_eq!(out.app_data, data);
            assert_eq!(out.checksum, None);
        }
    }

    #[test]
    fn test_priv_wrong_key_or_direction() {
        let (a, b) = addrs();
        let key = SessionKey::generate();
        let other = SessionKey::generate();
        let ctx = MessageContext::default();
        let msg = mk_priv(b"secret", &key, &a, &b, &ctx).unwrap();

        assert!(rd_priv(&msg, &other, &a, &b, &ctx).is_err());
        // Reflected back at its sender the direction bit no longer decodes to now.
        assert_eq!(
            rd_priv(&msg, &key, &a, &a, &ctx).err(),
            Some(KrbError::ClockSkewExceeded)
        );
    }

    #[test]
    fn test_priv_truncated() {
        let (a, b) = addrs();
        let key = SessionKey::generate();
        let ctx = MessageContext::default();
        let msg = mk_priv(b"secret", &key, &a, &b, &ctx).unwrap();
        assert_eq!(
            rd_priv(&msg[..msg.len() - 8], &key, &a, &b, &ctx),
            Err(KrbError::MalformedMessage)
        );
        assert_eq!(
            rd_priv(&msg[..1], &key, &a, &b, &ctx),
            Err(KrbError::MalformedMessage)
        );
    }
}
