//! The symmetric cipher capability used by every other layer: DES in propagating block
//! chaining mode for tickets and messages, a DES CBC checksum for string-to-key, and a 16 byte
//! keyed checksum for safe messages.

use crate::constants::*;
use crate::error::KrbError;

use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::Des;
use hmac::{Hmac, Mac};
use rand::{rng, Rng};
use tracing::error;
use zeroize::Zeroizing;

type DesCbcEnc = cbc::Encryptor<Des>;
type HmacMd5 = Hmac<md5::Md5>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

const WEAK_KEYS: [[u8; DES_KEY_LEN]; 16] = [
    // weak
    [0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01],
    [0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe],
    [0x1f, 0x1f, 0x1f, 0x1f, 0x0e, 0x0e, 0x0e, 0x0e],
    [0xe0, 0xe0, 0xe0, 0xe0, 0xf1, 0xf1, 0xf1, 0xf1],
    // semi-weak
    [0x01, 0xfe, 0x01, 0xfe, 0x01, 0xfe, 0x01, 0xfe],
    [0xfe, 0x01, 0xfe, 0x01, 0xfe, 0x01, 0xfe, 0x01],
    [0x1f, 0xe0, 0x1f, 0xe0, 0x0e, 0xf1, 0x0e, 0xf1],
    [0xe0, 0x1f, 0xe0, 0x1f, 0xf1, 0x0e, 0xf1, 0x0e],
    [0x01, 0xe0, 0x01, 0xe0, 0x01, 0xf1, 0x01, 0xf1],
    [0xe0, 0x01, 0xe0, 0x01, 0xf1, 0x01, 0xf1, 0x01],
    [0x1f, 0xfe, 0x1f, 0xfe, 0x0e, 0xfe, 0x0e, 0xfe],
    [0xfe, 0x1f, 0xfe, 0x1f, 0xfe, 0x0e, 0xfe, 0x0e],
    [0x01, 0x1f, 0x01, 0x1f, 0x01, 0x0e, 0x01, 0x0e],
    [0x1f, 0x01, 0x1f, 0x01, 0x0e, 0x01, 0x0e, 0x01],
    [0xe0, 0xfe, 0xe0, 0xfe, 0xf1, 0xfe, 0xf1, 0xfe],
    [0xfe, 0xe0, 0xfe, 0xe0, 0xfe, 0xf1, 0xfe, 0xf1],
];

fn des_cipher(key: &[u8; DES_KEY_LEN]) -> Result<Des, KrbError> {
    Des::new_from_slice(key).map_err(|err| {
        error!(?err, "Unable to schedule DES key");
        KrbError::DecryptionOrIntegrityFailure
    })
}

/// Encrypt or decrypt `data` in place with DES-PCBC, using the key as the initial vector.
/// The length must already be a multiple of the block size.
pub(crate) fn des_pcbc_in_place(
    key: &[u8; DES_KEY_LEN],
    data: &mut [u8],
    direction: Direction,
) -> Result<(), KrbError> {
    if data.len() % DES_BLOCK_SIZE != 0 {
        error!(len = data.len(), "PCBC input is not block aligned");
        return Err(KrbError::MalformedMessage);
    }

    let cipher = des_cipher(key)?;
    let mut chain = Zeroizing::new(*key);

    for block in data.chunks_exact_mut(DES_BLOCK_SIZE) {
        let mut input = Zeroizing::new([0u8; DES_BLOCK_SIZE]);
        input.copy_from_slice(block);

        match direction {
            Direction::Encrypt => {
                for (b, c) in block.iter_mut().zip(chain.iter()) {
                    *b ^= c;
                }
                cipher.encrypt_block(GenericArray::from_mut_slice(block));
                // next chain value is plaintext ^ ciphertext
                for ((c, p), o) in chain.iter_mut().zip(input.iter()).zip(block.iter()) {
                    *c = p ^ o;
                }
            }
            Direction::Decrypt => {
                cipher.decrypt_block(GenericArray::from_mut_slice(block));
                for (b, c) in block.iter_mut().zip(chain.iter()) {
                    *b ^= c;
                }
                for ((c, i), o) in chain.iter_mut().zip(input.iter()).zip(block.iter()) {
                    *c = i ^ o;
                }
            }
        }
    }

    Ok(())
}

/// DES CBC checksum: the last cipher block of `data` (zero padded) under `key` with `iv`.
pub(crate) fn des_cbc_cksum(
    key: &[u8; DES_KEY_LEN],
    iv: &[u8; DES_BLOCK_SIZE],
    data: &[u8],
) -> [u8; DES_BLOCK_SIZE] {
    let mut enc = DesCbcEnc::new(key.into(), iv.into());
    let mut out = [0u8; DES_BLOCK_SIZE];

    for chunk in data.chunks(DES_BLOCK_SIZE) {
        let mut block = Zeroizing::new([0u8; DES_BLOCK_SIZE]);
        block[..chunk.len()].copy_from_slice(chunk);
        enc.encrypt_block_b2b_mut((&*block).into(), (&mut out).into());
    }

    out
}

/// The 16 byte keyed checksum used by safe messages, in the current word ordering.
pub(crate) fn keyed_checksum(
    key: &[u8; DES_KEY_LEN],
    data: &[u8],
) -> Result<[u8; CHECKSUM_LEN], KrbError> {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).map_err(|err| {
        error!(?err, "Unable to key checksum");
        KrbError::DecryptionOrIntegrityFailure
    })?;
    mac.update(data);

    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(mac.finalize().into_bytes().as_slice());
    Ok(out)
}

/// Older peers computed the checksum words in the opposite byte order. Swap each 32 bit word.
pub(crate) fn fixup_quad_checksum(cksum: &mut [u8; CHECKSUM_LEN]) {
    for word in cksum.chunks_exact_mut(4) {
        word.reverse();
    }
}

pub(crate) fn set_odd_parity(key: &mut [u8; DES_KEY_LEN]) {
    for b in key.iter_mut() {
        let high = *b & 0xfe;
        *b = if high.count_ones() % 2 == 0 {
            high | 1
        } else {
            high
        };
    }
}

pub(crate) fn is_weak_key(key: &[u8; DES_KEY_LEN]) -> bool {
    WEAK_KEYS.iter().any(|weak| weak == key)
}

/// The classic DES string to key: fan-fold the passphrase into 56 bits, fix parity, then
/// run a CBC checksum over the passphrase keyed by that intermediate value.
pub(crate) fn des_string_to_key(passphrase: &[u8]) -> Result<[u8; DES_KEY_LEN], KrbError> {
    let mut key = Zeroizing::new([0u8; DES_KEY_LEN]);

    for (i, c) in passphrase.iter().enumerate() {
        if (i % 16) < 8 {
            key[i % 8] ^= c << 1;
        } else {
            key[7 - (i % 8)] ^= c.reverse_bits();
        }
    }

    set_odd_parity(&mut key);
    if is_weak_key(&key) {
        key[7] ^= 0xf0;
    }

    let iv = *key;
    let mut out = des_cbc_cksum(&key, &iv, passphrase);

    set_odd_parity(&mut out);
    if is_weak_key(&out) {
        out[7] ^= 0xf0;
    }

    Ok(out)
}

pub(crate) fn random_des_key() -> [u8; DES_KEY_LEN] {
    let mut k = [0u8; DES_KEY_LEN];
    loop {
        rng().fill(&mut k);
        set_odd_parity(&mut k);
        if !is_weak_key(&k) {
            return k;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcbc_roundtrip_and_propagation() {
        let key = [0x13, 0x34, 0x57, 0x79, 0x9b, 0xbc, 0xdf, 0xf1];
        let plain: Vec<u8> = (0u8..32).collect();

        let mut data = plain.clone();
        des_pcbc_in_place(&key, &mut data, Direction::Encrypt).unwrap();
        assert_ne!(data, plain);

        let mut tampered = data.clone();
        des_pcbc_in_place(&key, &mut data, Direction::Decrypt).unwrap();
        assert_eq!(data, plain);

        // PCBC propagates a flipped bit into every following block.
        tampered[3] ^= 0x01;
        des_pcbc_in_place(&key, &mut tampered, Direction::Decrypt).unwrap();
        assert_ne!(&tampered[0..8], &plain[0..8]);
        assert_ne!(&tampered[24..32], &plain[24..32]);
    }

    #[test]
    fn test_pcbc_rejects_unaligned() {
        let key = [0x13, 0x34, 0x57, 0x79, 0x9b, 0xbc, 0xdf, 0xf1];
        let mut data = vec![0u8; 13];
        assert_eq!(
            des_pcbc_in_place(&key, &mut data, Direction::Encrypt),
            Err(KrbError::MalformedMessage)
        );
    }

    #[test]
    fn test_string_to_key_properties() {
        let a = des_string_to_key(b"password").unwrap();
        let b = des_string_to_key(b"password").unwrap();
        let c = des_string_to_key(b"passwore").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        for byte in a {
            assert_eq!(byte.count_ones() % 2, 1);
        }
        assert!(!is_weak_key(&a));

        // Long passphrases exercise the reversed fan-fold.
        let long = des_string_to_key(b"a rather long passphrase indeed").unwrap();
        assert_ne!(long, a);
    }

    #[test]
    fn test_string_to_key_known_answers() {
        let key = des_string_to_key(b"passwordATHENA.MIT.EDUraeburn").unwrap();
        assert_hex::assert_eq_hex!(key.to_vec(), hex::decode("cbc22fae235298e3").unwrap());

        let key = des_string_to_key(b"potatoeWHITEHOUSE.GOVdanny").unwrap();
        assert_hex::assert_eq_hex!(key.to_vec(), hex::decode("df3d32a74fd92a01").unwrap());
    }

    #[test]
    fn test_pcbc_known_answer() {
        let key = [0x13, 0x34, 0x57, 0x79, 0x9b, 0xbc, 0xdf, 0xf1];
        // The key is the initial vector, so this block reaches the cipher
        // as 0123456789abcdef.
        let plain = hex::decode("1217121e1217121e").unwrap();

        let mut data = plain.clone();
        des_pcbc_in_place(&key, &mut data, Direction::Encrypt).unwrap();
        assert_hex::assert_eq_hex!(data, hex::decode("85e813540f0ab405").unwrap());

        des_pcbc_in_place(&key, &mut data, Direction::Decrypt).unwrap();
        assert_hex::assert_eq_hex!(data, plain);
    }

    #[test]
    fn test_checksum_fixup_swaps_words() {
        let key = [0x13, 0x34, 0x57, 0x79, 0x9b, 0xbc, 0xdf, 0xf1];
        let current = keyed_checksum(&key, b"hello world").unwrap();
        let mut legacy = current;
        fixup_quad_checksum(&mut legacy);
        assert_ne!(current, legacy);
        assert_eq!(legacy[0], current[3]);
        assert_eq!(legacy[7], current[4]);
        fixup_quad_checksum(&mut legacy);
        assert_eq!(current, legacy);
    }

    #[test]
    fn test_random_key_has_parity() {
        let k = random_des_key();
        assert!(!is_weak_key(&k));
        for byte in k {
            assert_eq!(byte.count_ones() % 2, 1);
        }
    }
}
