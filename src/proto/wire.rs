//! Fixed format primitives of the Kerberos IV wire encoding.
//!
//! Every encode operation checks the remaining capacity of the [KText] before writing and either
//! writes the whole field or nothing. Every decode operation on a [KReader] checks the remaining
//! message length before reading.

use crate::constants::{DES_BLOCK_SIZE, MAX_KTXT_LEN};
use crate::error::KrbError;
use std::net::Ipv4Addr;
use tracing::error;

/// The byte order a message's multi-byte integers were written in. Signalled on the wire by the
/// low bit of the message type byte (set means little endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

impl ByteOrder {
    pub fn from_flag(byte: u8) -> Self {
        if byte & 0x01 == 0x01 {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    pub fn flag(self) -> u8 {
        match self {
            ByteOrder::Big => 0,
            ByteOrder::Little => 1,
        }
    }
}

/// A bounded message buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct KText {
    buf: Vec<u8>,
    capacity: usize,
}

impl std::fmt::Debug for KText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KText")
            .field("len", &self.buf.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for KText {
    fn default() -> Self {
        Self::new()
    }
}

impl KText {
    pub fn new() -> Self {
        Self::with_capacity(MAX_KTXT_LEN)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        KText {
            buf: Vec::with_capacity(capacity.min(MAX_KTXT_LEN)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    fn reserve(&self, required: usize) -> Result<(), KrbError> {
        if required > self.remaining() {
            error!(
                required,
                remaining = self.remaining(),
                "Refusing to write past message capacity"
            );
            Err(KrbError::BufferOverflow)
        } else {
            Ok(())
        }
    }

    /// Write `value` as an unsigned integer of `width` (1, 2 or 4) bytes.
    pub fn put_int(
        &mut self,
        value: u32,
        width: usize,
        order: ByteOrder,
    ) -> Result<usize, KrbError> {
        let bytes = int_bytes(value, width, order)?;
        self.reserve(width)?;
        self.buf.extend_from_slice(&bytes[..width]);
        Ok(width)
    }

    pub fn put_u8(&mut self, value: u8) -> Result<usize, KrbError> {
        self.put_int(value as u32, 1, ByteOrder::Big)
    }

    pub fn put_u16(&mut self, value: u16) -> Result<usize, KrbError> {
        self.put_int(value as u32, 2, ByteOrder::Big)
    }

    pub fn put_u32(&mut self, value: u32) -> Result<usize, KrbError> {
        self.put_int(value, 4, ByteOrder::Big)
    }

    pub fn put_bytes(&mut self, data: &[u8]) -> Result<usize, KrbError> {
        self.reserve(data.len())?;
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    /// Write `s` and its NUL terminator.
    pub fn put_string(&mut self, s: &str) -> Result<usize, KrbError> {
        check_wire_string(s)?;
        self.reserve(s.len() + 1)?;
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(s.len() + 1)
    }

    /// Write name, instance and optionally realm as consecutive NUL terminated strings.
    pub fn put_nir(
        &mut self,
        name: &str,
        instance: &str,
        realm: Option<&str>,
    ) -> Result<usize, KrbError> {
        check_wire_string(name)?;
        check_wire_string(instance)?;
        let realm_len = match realm {
            Some(r) => {
                check_wire_string(r)?;
                r.len() + 1
            }
            None => 0,
        };

        let total = name.len() + 1 + instance.len() + 1 + realm_len;
        self.reserve(total)?;

        self.put_string(name)?;
        self.put_string(instance)?;
        if let Some(r) = realm {
            self.put_string(r)?;
        }
        Ok(total)
    }

    /// Addresses are always written as their four network order octets.
    pub fn put_address(&mut self, address: Ipv4Addr) -> Result<usize, KrbError> {
        self.put_bytes(&address.octets())
    }

    /// Zero fill up to the next cipher block boundary.
    pub fn pad_to_block(&mut self) -> Result<usize, KrbError> {
        let pad = padded_len(self.buf.len()) - self.buf.len();
        self.reserve(pad)?;
        self.buf.resize(self.buf.len() + pad, 0);
        Ok(pad)
    }

    pub(crate) fn zero(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.buf);
    }
}

impl Drop for KText {
    fn drop(&mut self) {
        // Buffers regularly hold key material or plaintext tickets.
        zeroize::Zeroize::zeroize(&mut self.buf);
    }
}

fn check_wire_string(s: &str) -> Result<(), KrbError> {
    if s.as_bytes().contains(&0) {
        error!("Refusing to encode a string containing NUL");
        Err(KrbError::ValueOutOfRange)
    } else {
        Ok(())
    }
}

fn int_bytes(value: u32, width: usize, order: ByteOrder) -> Result<[u8; 4], KrbError> {
    let fits = match width {
        1 => value <= u8::MAX as u32,
        2 => value <= u16::MAX as u32,
        4 => true,
        _ => {
            error!(width, "Unsupported integer width");
            return Err(KrbError::ValueOutOfRange);
        }
    };

    if !fits {
        error!(value, width, "Integer does not fit its field");
        return Err(KrbError::ValueOutOfRange);
    }

    let mut out = [0u8; 4];
    match order {
        ByteOrder::Big => {
            let be = value.to_be_bytes();
            out[..width].copy_from_slice(&be[4 - width..]);
        }
        ByteOrder::Little => {
            let le = value.to_le_bytes();
            out[..width].copy_from_slice(&le[..width]);
        }
    }
    Ok(out)
}

pub fn padded_len(len: usize) -> usize {
    len.div_ceil(DES_BLOCK_SIZE) * DES_BLOCK_SIZE
}

/// Decode an unsigned integer of `width` bytes from the front of `bytes`.
pub fn get_int(bytes: &[u8], width: usize, order: ByteOrder) -> Result<u32, KrbError> {
    if !matches!(width, 1 | 2 | 4) {
        error!(width, "Unsupported integer width");
        return Err(KrbError::ValueOutOfRange);
    }
    let field = bytes.get(..width).ok_or_else(|| {
        error!(width, available = bytes.len(), "Integer runs past message end");
        KrbError::MalformedMessage
    })?;

    let value = match order {
        ByteOrder::Big => field.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32),
        ByteOrder::Little => field
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32),
    };
    Ok(value)
}

/// A cursor over a received message.
#[derive(Debug)]
pub struct KReader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> KReader<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        KReader { buf, pos: 0, order }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn get_int(&mut self, width: usize) -> Result<u32, KrbError> {
        let v = get_int(&self.buf[self.pos..], width, self.order)?;
        self.pos += width;
        Ok(v)
    }

    pub fn get_u8(&mut self) -> Result<u8, KrbError> {
        let b = *self.buf.get(self.pos).ok_or_else(|| {
            error!(pos = self.pos, "Byte runs past message end");
            KrbError::MalformedMessage
        })?;
        self.pos += 1;
        Ok(b)
    }

    pub fn get_u16(&mut self) -> Result<u16, KrbError> {
        self.get_int(2).map(|v| v as u16)
    }

    pub fn get_u32(&mut self) -> Result<u32, KrbError> {
        self.get_int(4)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], KrbError> {
        if len > self.remaining() {
            error!(
                len,
                remaining = self.remaining(),
                "Field runs past message end"
            );
            return Err(KrbError::MalformedMessage);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Read a NUL terminated string of at most `max` bytes. A string longer than `max` is
    /// [KrbError::ValueOutOfRange]; a missing terminator is [KrbError::MalformedMessage].
    pub fn get_string(&mut self, max: usize) -> Result<String, KrbError> {
        let rest = &self.buf[self.pos..];
        let nul = rest.iter().position(|b| *b == 0).ok_or_else(|| {
            error!("String is not terminated within the message");
            KrbError::MalformedMessage
        })?;

        if nul > max {
            error!(len = nul, max, "String exceeds its field limit");
            return Err(KrbError::ValueOutOfRange);
        }

        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|err| {
                error!(?err, "String is not valid utf-8");
                KrbError::MalformedMessage
            })?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    pub fn get_address(&mut self) -> Result<Ipv4Addr, KrbError> {
        let b = self.get_bytes(4)?;
        Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], KrbError> {
        let b = self.get_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}
