//! AES key wrap (RFC 3394).

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

const DEFAULT_IV: [u8; 8] = [0xA6; 8];
const ROUNDS: u64 = 6;

/// Bytes a wrapped key grows by.
pub const WRAP_OVERHEAD: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyWrapError {
    #[error("key-encryption key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKekLength(usize),
    #[error("key of {0} bytes cannot be wrapped; need a multiple of 8 of at least 16")]
    InvalidKeyLength(usize),
    #[error("integrity check failed (wrong key or corrupted data)")]
    IntegrityCheckFailed,
}

enum Kek {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl Kek {
    fn new(kek: &[u8]) -> Result<Self, KeyWrapError> {
        let invalid = |_| KeyWrapError::InvalidKekLength(kek.len());
        Ok(match kek.len() {
            16 => Kek::Aes128(Aes128::new_from_slice(kek).map_err(invalid)?),
            24 => Kek::Aes192(Aes192::new_from_slice(kek).map_err(invalid)?),
            32 => Kek::Aes256(Aes256::new_from_slice(kek).map_err(invalid)?),
            other => return Err(KeyWrapError::InvalidKekLength(other)),
        })
    }

    fn encrypt(&self, block: &mut [u8; 16]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Kek::Aes128(cipher) => cipher.encrypt_block(block),
            Kek::Aes192(cipher) => cipher.encrypt_block(block),
            Kek::Aes256(cipher) => cipher.encrypt_block(block),
        }
    }

    fn decrypt(&self, block: &mut [u8; 16]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Kek::Aes128(cipher) => cipher.decrypt_block(block),
            Kek::Aes192(cipher) => cipher.decrypt_block(block),
            Kek::Aes256(cipher) => cipher.decrypt_block(block),
        }
    }
}

/// Wrap `key` under `kek`. The output is `key.len() + 8` bytes.
pub fn wrap(kek: &[u8], key: &[u8]) -> Result<Vec<u8>, KeyWrapError> {
    if key.len() < 16 || key.len() % 8 != 0 {
        return Err(KeyWrapError::InvalidKeyLength(key.len()));
    }
    let cipher = Kek::new(kek)?;
    let n = (key.len() / 8) as u64;

    let mut out = vec![0u8; key.len() + WRAP_OVERHEAD];
    out[8..].copy_from_slice(key);
    let mut a = DEFAULT_IV;
    let mut block = [0u8; 16];

    for j in 0..ROUNDS {
        for i in 1..=n {
            let r = &mut out[(i as usize) * 8..][..8];
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(r);
            cipher.encrypt(&mut block);

            let t = (n * j + i).to_be_bytes();
            for (dst, (b, t)) in a.iter_mut().zip(block[..8].iter().zip(t)) {
                *dst = b ^ t;
            }
            r.copy_from_slice(&block[8..]);
        }
    }

    out[..8].copy_from_slice(&a);
    block.zeroize();
    Ok(out)
}

/// Unwrap `wrapped` under `kek`, failing with
/// [`KeyWrapError::IntegrityCheckFailed`] on a wrong KEK or altered input.
pub fn unwrap(kek: &[u8], wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeyWrapError> {
    if wrapped.len() < 24 || wrapped.len() % 8 != 0 {
        return Err(KeyWrapError::InvalidKeyLength(
            wrapped.len().saturating_sub(WRAP_OVERHEAD),
        ));
    }
    let cipher = Kek::new(kek)?;
    let n = (wrapped.len() / 8 - 1) as u64;

    let mut a = [0u8; 8];
    a.copy_from_slice(&wrapped[..8]);
    let mut key = Zeroizing::new(wrapped[8..].to_vec());
    let mut block = Zeroizing::new([0u8; 16]);

    for j in (0..ROUNDS).rev() {
        for i in (1..=n).rev() {
            let r = &mut key[((i - 1) as usize) * 8..][..8];
            let t = (n * j + i).to_be_bytes();
            for (dst, (x, t)) in block[..8].iter_mut().zip(a.iter().zip(t)) {
                *dst = x ^ t;
            }
            block[8..].copy_from_slice(r);
            cipher.decrypt(&mut block);

            a.copy_from_slice(&block[..8]);
            r.copy_from_slice(&block[8..]);
        }
    }

    let diff = a
        .iter()
        .zip(DEFAULT_IV.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    if diff != 0 {
        return Err(KeyWrapError::IntegrityCheckFailed);
    }
    Ok(key)
}
