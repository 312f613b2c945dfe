//! Human and JSON views of an image header.

use super::header::{EncryptedHeader, KeySlot, SignedHeader, SlotKind};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Signed,
    Encrypted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub kind: ImageKind,
    pub type_tag: String,
    pub label: String,
    pub object_uuid: String,
    pub data_offset: u64,
    pub data_size: u64,
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed: Option<SignedInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<EncryptedInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedInfo {
    pub hash_offset: u64,
    pub hash_size: u64,
    pub algorithm: String,
    pub digest_size: u64,
    pub hash_block_size: u64,
    pub data_block_size: u64,
    pub salt: String,
    /// `digest_size * 2` hex characters.
    pub root_hash: String,
    pub signature_offset: u64,
    pub signature_size: u64,
    pub signature_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncryptedInfo {
    pub cipher: String,
    pub master_key_bits: u64,
    pub n_key_slots: u64,
    pub slots: Vec<SlotInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub index: u64,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ImageInfo {
    pub fn from_signed(path: PathBuf, header: &SignedHeader) -> Self {
        let hash = &header.hash;
        Self {
            path,
            kind: ImageKind::Signed,
            type_tag: header.meta.type_tag.clone(),
            label: header.meta.label.clone(),
            object_uuid: header.meta.object_uuid.to_string(),
            data_offset: header.data.offset,
            data_size: header.data.size,
            data_type: header.data.data_type.clone(),
            signed: Some(SignedInfo {
                hash_offset: hash.offset,
                hash_size: hash.size,
                algorithm: hash.algorithm.clone(),
                digest_size: hash.digest_size,
                hash_block_size: hash.hash_block_size,
                data_block_size: hash.data_block_size,
                salt: hex::encode(&hash.salt),
                root_hash: hex::encode(&hash.root_hash),
                signature_offset: header.signature.offset,
                signature_size: header.signature.size,
                signature_type: header.signature.signature_type.clone(),
            }),
            encrypted: None,
        }
    }

    pub fn from_encrypted(
        path: PathBuf,
        header: &EncryptedHeader,
        slots: &[Option<KeySlot>],
    ) -> Self {
        let slots = slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let slot = slot.as_ref()?;
                let detail = match &slot.kind {
                    SlotKind::Password {
                        kdf, iterations, ..
                    } => Some(format!("{kdf}, {iterations} iterations")),
                    SlotKind::Smartcard { card_label, .. } => Some(format!("card {card_label}")),
                    SlotKind::Clear | SlotKind::Recovery => None,
                };
                Some(SlotInfo {
                    index: index as u64,
                    kind: slot.kind.name(),
                    detail,
                })
            })
            .collect();

        Self {
            path,
            kind: ImageKind::Encrypted,
            type_tag: header.meta.type_tag.clone(),
            label: header.meta.label.clone(),
            object_uuid: header.meta.object_uuid.to_string(),
            data_offset: header.data.offset,
            data_size: header.data.size,
            data_type: header.data.data_type.clone(),
            signed: None,
            encrypted: Some(EncryptedInfo {
                cipher: header.encrypt.cipher_spec(),
                master_key_bits: header.master_key.key_size,
                n_key_slots: header.n_key_slots,
                slots,
            }),
        }
    }
}

impl fmt::Display for ImageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "path:        {}", self.path.display())?;
        writeln!(f, "type:        {}", self.type_tag)?;
        writeln!(f, "label:       {}", self.label)?;
        writeln!(f, "uuid:        {}", self.object_uuid)?;
        writeln!(
            f,
            "data:        {} ({} bytes at offset {})",
            self.data_type, self.data_size, self.data_offset
        )?;
        if let Some(signed) = &self.signed {
            writeln!(
                f,
                "hash tree:   {} bytes at offset {}",
                signed.hash_size, signed.hash_offset
            )?;
            writeln!(
                f,
                "algorithm:   {} ({}-byte digests, {}/{} byte blocks)",
                signed.algorithm,
                signed.digest_size,
                signed.data_block_size,
                signed.hash_block_size
            )?;
            writeln!(f, "salt:        {}", signed.salt)?;
            writeln!(f, "root hash:   {}", signed.root_hash)?;
            writeln!(
                f,
                "signature:   {} ({} bytes reserved at offset {})",
                signed.signature_type, signed.signature_size, signed.signature_offset
            )?;
        }
        if let Some(encrypted) = &self.encrypted {
            writeln!(f, "cipher:      {}", encrypted.cipher)?;
            writeln!(f, "master key:  {} bits", encrypted.master_key_bits)?;
            writeln!(f, "key slots:   {}", encrypted.n_key_slots)?;
            for slot in &encrypted.slots {
                match &slot.detail {
                    Some(detail) => writeln!(f, "  slot {}: {} ({detail})", slot.index, slot.kind)?,
                    None => writeln!(f, "  slot {}: {}", slot.index, slot.kind)?,
                }
            }
        }
        Ok(())
    }
}
