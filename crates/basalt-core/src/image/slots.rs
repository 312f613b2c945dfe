//! Key hierarchy of encrypted volumes.
//!
//! The master key is wrapped once, under a random per-volume unlock key. Every
//! key slot wraps that unlock key under its own key-encryption key: all zeroes
//! for the clear slot, the recovery key, or a PBKDF2 derivation of a password.

use super::header::{KeySlot, SlotKind, WrappedKey, PBKDF2_SHA256};
use super::keywrap::{self, KeyWrapError};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

pub const UNLOCK_KEY_LEN: usize = 32;
pub const PASSWORD_SALT_LEN: usize = 32;

/// Well-known KEK of the clear slot.
pub const CLEAR_KEK: [u8; 32] = [0u8; 32];

/// Secret offered to open a volume.
pub enum UnlockMethod {
    Clear,
    RecoveryKey(Zeroizing<Vec<u8>>),
    Password(Zeroizing<String>),
}

impl UnlockMethod {
    pub fn name(&self) -> &'static str {
        match self {
            UnlockMethod::Clear => "clear",
            UnlockMethod::RecoveryKey(_) => "recovery",
            UnlockMethod::Password(_) => "password",
        }
    }
}

impl fmt::Debug for UnlockMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnlockMethod::{}", self.name())
    }
}

pub fn random_key(len: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(&mut key);
    key
}

pub fn password_kek(password: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<Vec<u8>> {
    let mut kek = Zeroizing::new(vec![0u8; 32]);
    pbkdf2_hmac::<Sha256>(password, salt, iterations.max(1), &mut kek);
    kek
}

/// Wrap `secret` under `kek` into a slot of the given kind.
pub fn seal(kind: SlotKind, kek: &[u8], secret: &[u8]) -> Result<KeySlot, KeyWrapError> {
    let wrapped = keywrap::wrap(kek, secret)?;
    Ok(KeySlot {
        kind,
        wrapped: WrappedKey::new(secret.len() as u64 * 8, wrapped),
    })
}

pub fn clear_slot(unlock_key: &[u8]) -> Result<KeySlot, KeyWrapError> {
    seal(SlotKind::Clear, &CLEAR_KEK, unlock_key)
}

pub fn recovery_slot(recovery_key: &[u8], unlock_key: &[u8]) -> Result<KeySlot, KeyWrapError> {
    seal(SlotKind::Recovery, recovery_key, unlock_key)
}

pub fn password_slot(
    password: &[u8],
    iterations: u32,
    unlock_key: &[u8],
) -> Result<KeySlot, KeyWrapError> {
    let mut salt = vec![0u8; PASSWORD_SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let kek = password_kek(password, &salt, iterations);
    seal(
        SlotKind::Password {
            kdf: PBKDF2_SHA256.to_string(),
            iterations: u64::from(iterations),
            salt,
        },
        &kek,
        unlock_key,
    )
}

/// Try to recover the unlock key from `slot`. `Ok(None)` means the slot
/// does not accept this kind of secret.
pub fn open(slot: &KeySlot, method: &UnlockMethod) -> Result<Option<Zeroizing<Vec<u8>>>, KeyWrapError> {
    let kek: Zeroizing<Vec<u8>> = match (&slot.kind, method) {
        (SlotKind::Clear, UnlockMethod::Clear) => Zeroizing::new(CLEAR_KEK.to_vec()),
        (SlotKind::Recovery, UnlockMethod::RecoveryKey(key)) => key.clone(),
        (
            SlotKind::Password {
                iterations, salt, ..
            },
            UnlockMethod::Password(password),
        ) => {
            let iterations = u32::try_from(*iterations).unwrap_or(u32::MAX);
            password_kek(password.as_bytes(), salt, iterations)
        }
        _ => return Ok(None),
    };
    keywrap::unwrap(&kek, &slot.wrapped.key).map(Some)
}
