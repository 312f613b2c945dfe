//! Fixed-size binary headers for signed images and encrypted volumes.
//!
//! Every header is 4096 bytes and starts with the same 368-byte super header:
//! the basalt magic UUID, a type UUID naming the layout, a type tag, a fresh
//! object UUID, and a label. Integers are little-endian; strings are
//! NUL-padded to their field width.

use super::hashtree::DigestAlgorithm;
use byteorder::{ByteOrder, LittleEndian};
use std::str;
use thiserror::Error;
use uuid::Uuid;

pub const HEADER_SIZE: usize = 4096;
pub const SUPER_HEADER_SIZE: usize = 368;
pub const KEY_SLOT_SIZE: usize = 4096;
pub const MAX_KEY_SLOTS: u64 = 64;

pub const SUPER_UUID: Uuid = Uuid::from_u128(0x6d2b_51a4_0c3f_4f8e_9a17_52c1_b0e4_d7a3);
pub const SIGNED_TYPE_UUID: Uuid = Uuid::from_u128(0x3f0e_9c58_7b1d_4c2a_8e64_f1d3_a9b2_0c75);
pub const ENCRYPTED_TYPE_UUID: Uuid = Uuid::from_u128(0xa41c_7e03_d5b8_4a96_b2f0_6e8d_13c9_57f4);

pub const SLOT_CLEAR_UUID: Uuid = Uuid::from_u128(0x1b7f_c2e9_4d30_4a85_9c6e_0f3a_b8d1_62e7);
pub const SLOT_RECOVERY_UUID: Uuid = Uuid::from_u128(0x8e25_a0d7_6f14_4b39_a7c2_d95e_3b08_f146);
pub const SLOT_PASSWORD_UUID: Uuid = Uuid::from_u128(0x54d9_3a6b_e8f2_4c17_b0a5_7c1e_92f4_d38a);
pub const SLOT_SMARTCARD_UUID: Uuid = Uuid::from_u128(0xc7a2_19f5_3e6d_4e08_8b4f_a2d7_5c91_e063);

pub const SIGNED_TYPE_TAG: &str = "basalt-signed-image";
pub const ENCRYPTED_TYPE_TAG: &str = "basalt-encrypted-volume";
pub const KEYWRAP_ENCRYPTION: &str = "aes-keywrap";
pub const PBKDF2_SHA256: &str = "pbkdf2-sha256";

const TAG_LEN: usize = 64;
const LABEL_LEN: usize = 256;
const TYPE_LEN: usize = 64;
const NAME_LEN: usize = 32;
const SALT_LEN: usize = 256;
const ROOT_HASH_LEN: usize = 256;
const WRAPPED_KEY_LEN: usize = 256;
const SLOT_SALT_LEN: usize = 64;
const CARD_LABEL_LEN: usize = 64;
const CERTIFICATE_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("super UUID {0} is not a basalt header")]
    BadMagic(Uuid),
    #[error("type UUID {found} is not {expected}")]
    WrongType { expected: Uuid, found: Uuid },
    #[error("unknown key slot type {0}")]
    UnknownSlotType(Uuid),
    #[error("{field} is out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
    #[error("{field} is not a valid string")]
    InvalidString { field: &'static str },
    #[error("{field} does not fit in {width} bytes")]
    FieldTooLong { field: &'static str, width: usize },
}

fn out_of_range(field: &'static str, reason: impl Into<String>) -> HeaderError {
    HeaderError::OutOfRange {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperHeader {
    pub type_uuid: Uuid,
    pub type_tag: String,
    pub object_uuid: Uuid,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRegion {
    pub offset: u64,
    pub size: u64,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRegion {
    pub offset: u64,
    pub size: u64,
    pub algorithm: String,
    pub digest_size: u64,
    pub hash_block_size: u64,
    pub data_block_size: u64,
    pub salt: Vec<u8>,
    pub root_hash: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRegion {
    pub offset: u64,
    pub size: u64,
    pub signature_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeader {
    pub meta: SuperHeader,
    pub data: DataRegion,
    pub hash: HashRegion,
    pub signature: SignatureRegion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptSpec {
    pub cipher: String,
    pub chain_mode: String,
    pub iv_mode: String,
}

impl EncryptSpec {
    /// Cipher string for a dm-crypt table, e.g. `aes-xts-plain64`.
    pub fn cipher_spec(&self) -> String {
        format!("{}-{}-{}", self.cipher, self.chain_mode, self.iv_mode)
    }
}

/// A key wrapped with AES key wrap. `key_size` counts plaintext bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub encryption: String,
    pub key_size: u64,
    pub key: Vec<u8>,
}

impl WrappedKey {
    pub fn new(key_bits: u64, wrapped: Vec<u8>) -> Self {
        Self {
            encryption: KEYWRAP_ENCRYPTION.to_string(),
            key_size: key_bits,
            key: wrapped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedHeader {
    pub meta: SuperHeader,
    pub data: DataRegion,
    pub encrypt: EncryptSpec,
    pub master_key: WrappedKey,
    pub n_key_slots: u64,
}

impl EncryptedHeader {
    /// Byte offset of key slot `index`.
    pub fn slot_offset(index: u64) -> u64 {
        HEADER_SIZE as u64 + index * KEY_SLOT_SIZE as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
    Clear,
    Recovery,
    Password {
        kdf: String,
        iterations: u64,
        salt: Vec<u8>,
    },
    Smartcard {
        card_label: String,
        certificate: Vec<u8>,
    },
}

impl SlotKind {
    pub fn type_uuid(&self) -> Uuid {
        match self {
            SlotKind::Clear => SLOT_CLEAR_UUID,
            SlotKind::Recovery => SLOT_RECOVERY_UUID,
            SlotKind::Password { .. } => SLOT_PASSWORD_UUID,
            SlotKind::Smartcard { .. } => SLOT_SMARTCARD_UUID,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SlotKind::Clear => "clear",
            SlotKind::Recovery => "recovery",
            SlotKind::Password { .. } => "password",
            SlotKind::Smartcard { .. } => "smartcard",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySlot {
    pub kind: SlotKind,
    pub wrapped: WrappedKey,
}

/// Either header layout, chosen by type UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Signed(SignedHeader),
    Encrypted(EncryptedHeader),
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, width: usize) -> Result<&'a [u8], HeaderError> {
        let end = self.pos + width;
        let field = self.buf.get(self.pos..end).ok_or(HeaderError::TooShort {
            expected: end,
            actual: self.buf.len(),
        })?;
        self.pos = end;
        Ok(field)
    }

    fn u64(&mut self) -> Result<u64, HeaderError> {
        Ok(LittleEndian::read_u64(self.bytes(8)?))
    }

    fn uuid(&mut self) -> Result<Uuid, HeaderError> {
        Uuid::from_slice(self.bytes(16)?).map_err(|_| HeaderError::TooShort {
            expected: self.pos,
            actual: self.buf.len(),
        })
    }

    fn string(&mut self, field: &'static str, width: usize) -> Result<String, HeaderError> {
        let raw = self.bytes(width)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        str::from_utf8(&raw[..end])
            .map(str::to_string)
            .map_err(|_| HeaderError::InvalidString { field })
    }

    /// First `len` bytes of a `width`-byte field.
    fn sized(&mut self, field: &'static str, width: usize, len: u64) -> Result<Vec<u8>, HeaderError> {
        let raw = self.bytes(width)?;
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= width)
            .ok_or_else(|| out_of_range(field, format!("{len} exceeds {width} bytes")))?;
        Ok(raw[..len].to_vec())
    }
}

struct FieldWriter {
    buf: Vec<u8>,
    pos: usize,
}

impl FieldWriter {
    fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size],
            pos: 0,
        }
    }

    fn bytes(&mut self, field: &'static str, value: &[u8], width: usize) -> Result<(), HeaderError> {
        if value.len() > width {
            return Err(HeaderError::FieldTooLong { field, width });
        }
        self.buf[self.pos..self.pos + value.len()].copy_from_slice(value);
        self.pos += width;
        Ok(())
    }

    fn u64(&mut self, value: u64) {
        LittleEndian::write_u64(&mut self.buf[self.pos..self.pos + 8], value);
        self.pos += 8;
    }

    fn uuid(&mut self, value: Uuid) {
        self.buf[self.pos..self.pos + 16].copy_from_slice(value.as_bytes());
        self.pos += 16;
    }

    fn string(&mut self, field: &'static str, value: &str, width: usize) -> Result<(), HeaderError> {
        if value.contains('\0') {
            return Err(HeaderError::InvalidString { field });
        }
        self.bytes(field, value.as_bytes(), width)
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), HeaderError> {
    if buf.len() < expected {
        return Err(HeaderError::TooShort {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn decode_super(reader: &mut FieldReader<'_>, expected: Uuid) -> Result<SuperHeader, HeaderError> {
    let magic = reader.uuid()?;
    if magic != SUPER_UUID {
        return Err(HeaderError::BadMagic(magic));
    }
    let type_uuid = reader.uuid()?;
    if type_uuid != expected {
        return Err(HeaderError::WrongType {
            expected,
            found: type_uuid,
        });
    }
    Ok(SuperHeader {
        type_uuid,
        type_tag: reader.string("type_tag", TAG_LEN)?,
        object_uuid: reader.uuid()?,
        label: reader.string("label", LABEL_LEN)?,
    })
}

fn encode_super(writer: &mut FieldWriter, meta: &SuperHeader) -> Result<(), HeaderError> {
    writer.uuid(SUPER_UUID);
    writer.uuid(meta.type_uuid);
    writer.string("type_tag", &meta.type_tag, TAG_LEN)?;
    writer.uuid(meta.object_uuid);
    writer.string("label", &meta.label, LABEL_LEN)
}

fn decode_data(reader: &mut FieldReader<'_>) -> Result<DataRegion, HeaderError> {
    Ok(DataRegion {
        offset: reader.u64()?,
        size: reader.u64()?,
        data_type: reader.string("data.type", TYPE_LEN)?,
    })
}

fn encode_data(writer: &mut FieldWriter, data: &DataRegion) -> Result<(), HeaderError> {
    writer.u64(data.offset);
    writer.u64(data.size);
    writer.string("data.type", &data.data_type, TYPE_LEN)
}

fn decode_wrapped(reader: &mut FieldReader<'_>, field: &'static str) -> Result<WrappedKey, HeaderError> {
    let encryption = reader.string("encryption", NAME_LEN)?;
    let key_size = reader.u64()?;
    if encryption != KEYWRAP_ENCRYPTION {
        return Err(out_of_range(field, format!("unsupported encryption `{encryption}`")));
    }
    if key_size % 64 != 0 || key_size == 0 {
        return Err(out_of_range(field, format!("{key_size}-bit key cannot be wrapped")));
    }
    let key = reader.sized(field, WRAPPED_KEY_LEN, key_size / 8 + 8)?;
    Ok(WrappedKey {
        encryption,
        key_size,
        key,
    })
}

fn encode_wrapped(writer: &mut FieldWriter, key: &WrappedKey) -> Result<(), HeaderError> {
    writer.string("encryption", &key.encryption, NAME_LEN)?;
    writer.u64(key.key_size);
    writer.bytes("key", &key.key, WRAPPED_KEY_LEN)
}

/// Super and type UUID of a header, without validating anything else.
pub fn peek_type(buf: &[u8]) -> Result<Uuid, HeaderError> {
    check_len(buf, HEADER_SIZE)?;
    let mut reader = FieldReader::new(buf);
    let magic = reader.uuid()?;
    if magic != SUPER_UUID {
        return Err(HeaderError::BadMagic(magic));
    }
    reader.uuid()
}

/// Decode whichever header `buf` holds.
pub fn decode(buf: &[u8]) -> Result<Header, HeaderError> {
    match peek_type(buf)? {
        SIGNED_TYPE_UUID => decode_signed(buf).map(Header::Signed),
        ENCRYPTED_TYPE_UUID => decode_encrypted(buf).map(Header::Encrypted),
        found => Err(HeaderError::WrongType {
            expected: SIGNED_TYPE_UUID,
            found,
        }),
    }
}

pub fn decode_signed(buf: &[u8]) -> Result<SignedHeader, HeaderError> {
    check_len(buf, HEADER_SIZE)?;
    let mut reader = FieldReader::new(&buf[..HEADER_SIZE]);
    let meta = decode_super(&mut reader, SIGNED_TYPE_UUID)?;
    let data = decode_data(&mut reader)?;

    let hash_offset = reader.u64()?;
    let hash_size = reader.u64()?;
    let algorithm = reader.string("hash.algorithm", NAME_LEN)?;
    let digest_size = reader.u64()?;
    let hash_block_size = reader.u64()?;
    let data_block_size = reader.u64()?;
    let salt_raw = reader.bytes(SALT_LEN)?;
    let salt_size = reader.u64()?;
    let root_raw = reader.bytes(ROOT_HASH_LEN)?;

    let digest = DigestAlgorithm::from_name(&algorithm)
        .ok_or_else(|| out_of_range("hash.algorithm", format!("unknown digest `{algorithm}`")))?;
    if digest_size != digest.size() as u64 {
        return Err(out_of_range(
            "hash.digest_size",
            format!("{algorithm} digests are {} bytes, not {digest_size}", digest.size()),
        ));
    }
    for (field, size) in [
        ("hash.hash_block_size", hash_block_size),
        ("hash.data_block_size", data_block_size),
    ] {
        if size == 0 || size > u64::from(u32::MAX) {
            return Err(out_of_range(field, format!("{size} is not a block size")));
        }
    }
    if hash_block_size % digest_size != 0 {
        return Err(out_of_range(
            "hash.hash_block_size",
            format!("{hash_block_size} is not a multiple of {digest_size}"),
        ));
    }
    if salt_size > SALT_LEN as u64 {
        return Err(out_of_range("hash.salt_size", format!("{salt_size} exceeds {SALT_LEN}")));
    }
    if data.size % data_block_size != 0 {
        return Err(out_of_range(
            "data.size",
            format!("{} is not a multiple of {data_block_size}", data.size),
        ));
    }
    let data_end = data
        .offset
        .checked_add(data.size)
        .ok_or_else(|| out_of_range("data.size", "region overflows"))?;
    if data.offset < HEADER_SIZE as u64 || hash_offset < data_end {
        return Err(out_of_range("hash.offset", "regions overlap"));
    }
    hash_offset
        .checked_add(hash_size)
        .ok_or_else(|| out_of_range("hash.size", "region overflows"))?;

    let signature = SignatureRegion {
        offset: reader.u64()?,
        size: reader.u64()?,
        signature_type: reader.string("signature.type", TYPE_LEN)?,
    };

    Ok(SignedHeader {
        meta,
        data,
        hash: HashRegion {
            offset: hash_offset,
            size: hash_size,
            algorithm,
            digest_size,
            hash_block_size,
            data_block_size,
            salt: salt_raw[..salt_size as usize].to_vec(),
            root_hash: root_raw[..digest_size as usize].to_vec(),
        },
        signature,
    })
}

pub fn encode_signed(header: &SignedHeader) -> Result<Vec<u8>, HeaderError> {
    let mut writer = FieldWriter::new(HEADER_SIZE);
    encode_super(&mut writer, &header.meta)?;
    encode_data(&mut writer, &header.data)?;

    let hash = &header.hash;
    writer.u64(hash.offset);
    writer.u64(hash.size);
    writer.string("hash.algorithm", &hash.algorithm, NAME_LEN)?;
    writer.u64(hash.digest_size);
    writer.u64(hash.hash_block_size);
    writer.u64(hash.data_block_size);
    writer.bytes("hash.salt", &hash.salt, SALT_LEN)?;
    writer.u64(hash.salt.len() as u64);
    writer.bytes("hash.root_hash", &hash.root_hash, ROOT_HASH_LEN)?;

    writer.u64(header.signature.offset);
    writer.u64(header.signature.size);
    writer.string("signature.type", &header.signature.signature_type, TYPE_LEN)?;
    Ok(writer.finish())
}

pub fn decode_encrypted(buf: &[u8]) -> Result<EncryptedHeader, HeaderError> {
    check_len(buf, HEADER_SIZE)?;
    let mut reader = FieldReader::new(&buf[..HEADER_SIZE]);
    let meta = decode_super(&mut reader, ENCRYPTED_TYPE_UUID)?;
    let data = decode_data(&mut reader)?;
    let encrypt = EncryptSpec {
        cipher: reader.string("encrypt.cipher", NAME_LEN)?,
        chain_mode: reader.string("encrypt.chain_mode", NAME_LEN)?,
        iv_mode: reader.string("encrypt.iv_mode", NAME_LEN)?,
    };
    let master_key = decode_wrapped(&mut reader, "master_key")?;
    let n_key_slots = reader.u64()?;

    if !(128..=2048).contains(&master_key.key_size) {
        return Err(out_of_range(
            "master_key.key_size",
            format!("{} bits is outside 128..=2048", master_key.key_size),
        ));
    }
    if n_key_slots == 0 || n_key_slots > MAX_KEY_SLOTS {
        return Err(out_of_range(
            "n_key_slots",
            format!("{n_key_slots} is outside 1..={MAX_KEY_SLOTS}"),
        ));
    }
    if data.offset < EncryptedHeader::slot_offset(n_key_slots) {
        return Err(out_of_range("data.offset", "payload overlaps the key slots"));
    }
    if data.offset % 512 != 0 {
        return Err(out_of_range("data.offset", "payload is not sector aligned"));
    }

    Ok(EncryptedHeader {
        meta,
        data,
        encrypt,
        master_key,
        n_key_slots,
    })
}

pub fn encode_encrypted(header: &EncryptedHeader) -> Result<Vec<u8>, HeaderError> {
    let mut writer = FieldWriter::new(HEADER_SIZE);
    encode_super(&mut writer, &header.meta)?;
    encode_data(&mut writer, &header.data)?;
    writer.string("encrypt.cipher", &header.encrypt.cipher, NAME_LEN)?;
    writer.string("encrypt.chain_mode", &header.encrypt.chain_mode, NAME_LEN)?;
    writer.string("encrypt.iv_mode", &header.encrypt.iv_mode, NAME_LEN)?;
    encode_wrapped(&mut writer, &header.master_key)?;
    writer.u64(header.n_key_slots);
    Ok(writer.finish())
}

/// Decode one key slot; `None` marks an unused slot.
pub fn decode_slot(buf: &[u8]) -> Result<Option<KeySlot>, HeaderError> {
    check_len(buf, KEY_SLOT_SIZE)?;
    let mut reader = FieldReader::new(&buf[..KEY_SLOT_SIZE]);
    let type_uuid = reader.uuid()?;
    if type_uuid.is_nil() {
        return Ok(None);
    }
    if ![
        SLOT_CLEAR_UUID,
        SLOT_RECOVERY_UUID,
        SLOT_PASSWORD_UUID,
        SLOT_SMARTCARD_UUID,
    ]
    .contains(&type_uuid)
    {
        return Err(HeaderError::UnknownSlotType(type_uuid));
    }

    let wrapped = decode_wrapped(&mut reader, "slot.key")?;
    let kind = match type_uuid {
        SLOT_CLEAR_UUID => SlotKind::Clear,
        SLOT_RECOVERY_UUID => SlotKind::Recovery,
        SLOT_PASSWORD_UUID => {
            let kdf = reader.string("slot.kdf", NAME_LEN)?;
            let iterations = reader.u64()?;
            let salt_raw = reader.bytes(SLOT_SALT_LEN)?;
            let salt_size = reader.u64()?;
            if kdf != PBKDF2_SHA256 {
                return Err(out_of_range("slot.kdf", format!("unsupported kdf `{kdf}`")));
            }
            if iterations == 0 || iterations > u64::from(u32::MAX) {
                return Err(out_of_range("slot.iterations", iterations.to_string()));
            }
            if salt_size == 0 || salt_size > SLOT_SALT_LEN as u64 {
                return Err(out_of_range("slot.salt_size", salt_size.to_string()));
            }
            SlotKind::Password {
                kdf,
                iterations,
                salt: salt_raw[..salt_size as usize].to_vec(),
            }
        }
        _ => {
            let card_label = reader.string("slot.card_label", CARD_LABEL_LEN)?;
            let certificate_size = reader.u64()?;
            let certificate = reader.sized("slot.certificate", CERTIFICATE_LEN, certificate_size)?;
            SlotKind::Smartcard {
                card_label,
                certificate,
            }
        }
    };

    Ok(Some(KeySlot { kind, wrapped }))
}

/// Encode one key slot; `None` yields an all-zero unused slot.
pub fn encode_slot(slot: Option<&KeySlot>) -> Result<Vec<u8>, HeaderError> {
    let mut writer = FieldWriter::new(KEY_SLOT_SIZE);
    let Some(slot) = slot else {
        return Ok(writer.finish());
    };
    writer.uuid(slot.kind.type_uuid());
    encode_wrapped(&mut writer, &slot.wrapped)?;
    match &slot.kind {
        SlotKind::Clear | SlotKind::Recovery => {}
        SlotKind::Password {
            kdf,
            iterations,
            salt,
        } => {
            writer.string("slot.kdf", kdf, NAME_LEN)?;
            writer.u64(*iterations);
            writer.bytes("slot.salt", salt, SLOT_SALT_LEN)?;
            writer.u64(salt.len() as u64);
        }
        SlotKind::Smartcard {
            card_label,
            certificate,
        } => {
            writer.string("slot.card_label", card_label, CARD_LABEL_LEN)?;
            writer.u64(certificate.len() as u64);
            writer.bytes("slot.certificate", certificate, CERTIFICATE_LEN)?;
        }
    }
    Ok(writer.finish())
}
