//! Formatting and activation of signed images and encrypted volumes.

use super::hashtree::{self, DigestAlgorithm, TreeParams};
use super::header::{
    self, DataRegion, EncryptSpec, EncryptedHeader, HashRegion, Header, KeySlot,
    SignatureRegion, SignedHeader, SuperHeader, WrappedKey, ENCRYPTED_TYPE_TAG,
    ENCRYPTED_TYPE_UUID, HEADER_SIZE, KEY_SLOT_SIZE, SIGNED_TYPE_TAG, SIGNED_TYPE_UUID,
};
use super::info::ImageInfo;
use super::keywrap::{self, KeyWrapError};
use super::slots::{self, UnlockMethod, UNLOCK_KEY_LEN};
use crate::config::{BasaltConfig, ImageCfg};
use crate::error::{BasaltError, BasaltResult};
use crate::keyfile::{format_recovery_key, RECOVERY_KEY_LEN};
use basalt_provider::{
    CryptTarget, DiscardMode, LoopOptions, MapperProvider, MappingDescriptor, VerityTarget,
};
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;
use zeroize::Zeroizing;

const SECTOR_SIZE: u64 = 512;
const ALIGNMENT: u64 = 4096;

/// Name of the device-mapper mapping for an image.
pub fn mapping_name(object_uuid: &Uuid) -> String {
    format!("basalt-{object_uuid}")
}

fn round_up(value: u64, to: u64) -> BasaltResult<u64> {
    value
        .div_ceil(to)
        .checked_mul(to)
        .ok_or_else(|| BasaltError::InvalidArgument(format!("{value} bytes overflow")))
}

/// High-level image operations on top of a [`MapperProvider`].
pub struct DiskImageService<P> {
    config: Arc<BasaltConfig>,
    provider: P,
}

impl<P> DiskImageService<P>
where
    P: MapperProvider,
{
    pub fn new(config: Arc<BasaltConfig>, provider: P) -> Self {
        Self { config, provider }
    }

    pub fn config(&self) -> &BasaltConfig {
        &self.config
    }

    /// Image settings, rejected up front if the configuration was built by
    /// hand and never went through [`BasaltConfig::load`].
    fn image_config(&self) -> BasaltResult<&ImageCfg> {
        let issues = self.config.validate();
        if !issues.is_empty() {
            return Err(BasaltError::InvalidConfig(issues.join("; ")));
        }
        Ok(&self.config.image)
    }

    fn provider_err(err: P::Error) -> BasaltError {
        BasaltError::Provider(err.to_string())
    }

    /// Format `volume` as an encrypted volume and return the recovery key.
    ///
    /// Existing content is discarded (secure discard first, plain discard as
    /// fallback, both best-effort). Slot 0 is the clear slot, slot 1 the
    /// recovery slot; the remaining slots are left unused.
    pub fn format_encrypted(
        &self,
        volume: &Path,
        label: &str,
        data_type: &str,
    ) -> BasaltResult<Zeroizing<String>> {
        let image = self.image_config()?;
        let mut file = OpenOptions::new().read(true).write(true).open(volume)?;
        let volume_size = file.seek(SeekFrom::End(0))?;

        let data_offset = EncryptedHeader::slot_offset(image.key_slots);
        let payload = volume_size.saturating_sub(data_offset) / SECTOR_SIZE * SECTOR_SIZE;
        if payload == 0 {
            return Err(BasaltError::InvalidArgument(format!(
                "{} is {volume_size} bytes; need more than {data_offset} for header and key slots",
                volume.display()
            )));
        }

        self.discard(volume);

        let master_key = slots::random_key((image.master_key_bits / 8) as usize);
        let unlock_key = slots::random_key(UNLOCK_KEY_LEN);
        let recovery_key = slots::random_key(RECOVERY_KEY_LEN);

        let header = EncryptedHeader {
            meta: SuperHeader {
                type_uuid: ENCRYPTED_TYPE_UUID,
                type_tag: ENCRYPTED_TYPE_TAG.to_string(),
                object_uuid: Uuid::new_v4(),
                label: label.to_string(),
            },
            data: DataRegion {
                offset: data_offset,
                size: payload,
                data_type: data_type.to_string(),
            },
            encrypt: EncryptSpec {
                cipher: image.cipher.clone(),
                chain_mode: image.chain_mode.clone(),
                iv_mode: image.iv_mode.clone(),
            },
            master_key: WrappedKey::new(
                image.master_key_bits,
                keywrap::wrap(&unlock_key, &master_key)?,
            ),
            n_key_slots: image.key_slots,
        };

        let mut key_slots: Vec<Option<KeySlot>> = vec![None; image.key_slots as usize];
        key_slots[0] = Some(slots::clear_slot(&unlock_key)?);
        key_slots[1] = Some(slots::recovery_slot(&recovery_key, &unlock_key)?);

        write_at(&mut file, 0, &header::encode_encrypted(&header)?)?;
        for (index, slot) in key_slots.iter().enumerate() {
            let offset = EncryptedHeader::slot_offset(index as u64);
            write_at(&mut file, offset, &header::encode_slot(slot.as_ref())?)?;
        }
        file.sync_all()?;

        info!(
            "formatted encrypted volume {} ({}, {} payload bytes)",
            volume.display(),
            header.meta.object_uuid,
            payload
        );
        Ok(format_recovery_key(&recovery_key))
    }

    fn discard(&self, volume: &Path) {
        for mode in [DiscardMode::Secure, DiscardMode::Plain] {
            match self.provider.discard(volume, mode) {
                Ok(()) => return,
                Err(err) => debug!("{mode:?} discard of {} failed: {err}", volume.display()),
            }
        }
        warn!(
            "could not discard {}; previous content stays on disk until overwritten",
            volume.display()
        );
    }

    /// Package `data_file` as a signed image at `image_file`.
    ///
    /// Layout: header, signature reservation, data padded to whole blocks,
    /// hash tree. The signature region is reserved but left zeroed.
    pub fn format_signed(
        &self,
        data_file: &Path,
        image_file: &Path,
        label: &str,
        data_type: &str,
    ) -> BasaltResult<SignedHeader> {
        let image = self.image_config()?;
        let algorithm = DigestAlgorithm::parse(&image.hash_algorithm)?;
        let data_block_size = u32::try_from(image.data_block_size).map_err(|_| {
            BasaltError::InvalidConfig("image.data_block_size does not fit in 32 bits".into())
        })?;
        let hash_block_size = u32::try_from(image.hash_block_size).map_err(|_| {
            BasaltError::InvalidConfig("image.hash_block_size does not fit in 32 bits".into())
        })?;

        let mut source = File::open(data_file)?;
        let data_len = source.metadata()?.len();
        let data_size = round_up(data_len, image.data_block_size)?;
        let n_data_blocks = data_size / image.data_block_size;

        let signature_offset = HEADER_SIZE as u64;
        let signature_size = round_up(image.signature_size, ALIGNMENT)?;
        let data_offset = signature_offset + signature_size;
        let hash_offset = data_offset
            .checked_add(data_size)
            .ok_or_else(|| BasaltError::InvalidArgument("image too large".into()))?;

        let params = TreeParams {
            algorithm,
            n_data_blocks,
            data_block_size,
            hash_block_size,
            salt: slots::random_key(image.salt_size).to_vec(),
        };
        hashtree::TreeGeometry::new(&params)?;

        let mut target = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(image_file)?;
        target.set_len(hash_offset)?;
        target.seek(SeekFrom::Start(data_offset))?;
        let copied = io::copy(&mut (&mut source).take(data_len), &mut target)?;
        if copied != data_len {
            return Err(BasaltError::InvalidArgument(format!(
                "{} shrank while copying ({copied} of {data_len} bytes)",
                data_file.display()
            )));
        }

        let tree = {
            let (mut reader, mut writer) = (&target, &target);
            hashtree::build(&mut reader, data_offset, &mut writer, hash_offset, &params)?
        };
        debug!(
            "hash tree for {}: {} levels, {} bytes",
            image_file.display(),
            tree.levels,
            tree.hash_bytes
        );

        let header = SignedHeader {
            meta: SuperHeader {
                type_uuid: SIGNED_TYPE_UUID,
                type_tag: SIGNED_TYPE_TAG.to_string(),
                object_uuid: Uuid::new_v4(),
                label: label.to_string(),
            },
            data: DataRegion {
                offset: data_offset,
                size: data_size,
                data_type: data_type.to_string(),
            },
            hash: HashRegion {
                offset: hash_offset,
                size: tree.hash_bytes,
                algorithm: algorithm.name().to_string(),
                digest_size: algorithm.size() as u64,
                hash_block_size: image.hash_block_size,
                data_block_size: image.data_block_size,
                salt: params.salt.clone(),
                root_hash: tree.root_hash,
            },
            signature: SignatureRegion {
                offset: signature_offset,
                size: signature_size,
                signature_type: image.signature_type.clone(),
            },
        };
        write_at(&mut target, 0, &header::encode_signed(&header)?)?;
        target.sync_all()?;

        info!(
            "signed image {} written ({n_data_blocks} data blocks)",
            image_file.display()
        );
        Ok(header)
    }

    /// Activate `path` as a verity mapping if it is a signed image, otherwise
    /// as a crypt mapping if it is an encrypted volume unlocked via its clear
    /// slot.
    pub fn setup(&self, path: &Path) -> BasaltResult<MappingDescriptor> {
        self.setup_with(path, &UnlockMethod::Clear)
    }

    /// Like [`setup`](Self::setup), unlocking an encrypted volume with
    /// `method` instead of the clear slot. Signed images ignore `method`.
    pub fn setup_with(
        &self,
        path: &Path,
        method: &UnlockMethod,
    ) -> BasaltResult<MappingDescriptor> {
        let signed = match self.setup_signed(path) {
            Ok(mapping) => return Ok(mapping),
            Err(BasaltError::Validation(err)) => err,
            Err(err) => return Err(err),
        };
        debug!("{} is not a signed image: {signed}", path.display());

        let encrypted = match self.setup_encrypted(path, method) {
            Ok(mapping) => return Ok(mapping),
            Err(BasaltError::Validation(err)) => err,
            Err(err) => return Err(err),
        };

        Err(BasaltError::NotAnImage {
            path: path.to_path_buf(),
            signed: signed.to_string(),
            encrypted: encrypted.to_string(),
        })
    }

    fn setup_signed(&self, path: &Path) -> BasaltResult<MappingDescriptor> {
        let file = File::open(path)?;
        let header = header::decode_signed(&read_header(&file)?)?;
        let hash = &header.hash;

        let params = signed_params(&header)?;
        {
            let (mut data, mut stored) = (&file, &file);
            hashtree::verify(
                &mut data,
                header.data.offset,
                &mut stored,
                hash.offset,
                &params,
                &hash.root_hash,
            )?;
        }
        debug!("hash tree of {} verified", path.display());

        let data_device = self
            .provider
            .attach_loop(
                path,
                LoopOptions {
                    read_only: true,
                    offset: header.data.offset,
                    size_limit: Some(header.data.size),
                },
            )
            .map_err(Self::provider_err)?;

        // Whole-file attachment when the tree is block aligned, else a loop
        // starting at the tree itself.
        let (hash_options, hash_start_block) = if hash.offset % hash.hash_block_size == 0 {
            (
                LoopOptions {
                    read_only: true,
                    ..LoopOptions::default()
                },
                hash.offset / hash.hash_block_size,
            )
        } else {
            (
                LoopOptions {
                    read_only: true,
                    offset: hash.offset,
                    size_limit: Some(hash.size),
                },
                0,
            )
        };
        let hash_device = match self.provider.attach_loop(path, hash_options) {
            Ok(device) => device,
            Err(err) => {
                self.release_loop(&data_device);
                return Err(Self::provider_err(err));
            }
        };

        let target = VerityTarget {
            data_device: data_device.clone(),
            hash_device: hash_device.clone(),
            data_block_size: hash.data_block_size,
            hash_block_size: hash.hash_block_size,
            data_blocks: params.n_data_blocks,
            hash_start_block,
            algorithm: hash.algorithm.clone(),
            root_hash: hash.root_hash.clone(),
            salt: hash.salt.clone(),
        };
        let name = mapping_name(&header.meta.object_uuid);
        match self.provider.create_verity(&name, &target) {
            Ok(mapping) => {
                info!(
                    "{} active as {} ({})",
                    path.display(),
                    mapping.device.display(),
                    name
                );
                Ok(mapping)
            }
            Err(err) => {
                self.release_loop(&hash_device);
                self.release_loop(&data_device);
                Err(Self::provider_err(err))
            }
        }
    }

    fn setup_encrypted(
        &self,
        path: &Path,
        method: &UnlockMethod,
    ) -> BasaltResult<MappingDescriptor> {
        let file = File::open(path)?;
        let header = header::decode_encrypted(&read_header(&file)?)?;
        let key_slots = read_slots(&file, &header)?;

        let master_key = unlock(&header, &key_slots, method)
            .map(|(master, _)| master)
            .map_err(|err| match err {
                BasaltError::Unlock(reason) => BasaltError::Unlock(format!(
                    "cannot unlock via {} key: {reason}",
                    method.name()
                )),
                other => other,
            })?;

        let device = self
            .provider
            .attach_loop(path, LoopOptions::default())
            .map_err(Self::provider_err)?;

        let target = CryptTarget {
            sectors: header.data.size / SECTOR_SIZE,
            cipher_spec: header.encrypt.cipher_spec(),
            key: master_key,
            device: device.clone(),
            offset_sectors: header.data.offset / SECTOR_SIZE,
        };
        let name = mapping_name(&header.meta.object_uuid);
        match self.provider.create_crypt(&name, &target) {
            Ok(mapping) => {
                info!(
                    "{} active as {} ({})",
                    path.display(),
                    mapping.device.display(),
                    name
                );
                Ok(mapping)
            }
            Err(err) => {
                self.release_loop(&device);
                Err(Self::provider_err(err))
            }
        }
    }

    fn release_loop(&self, device: &Path) {
        if let Err(err) = self.provider.detach_loop(device) {
            warn!("failed to detach {}: {err}", device.display());
        }
    }

    /// Describe the header of a signed image or encrypted volume.
    pub fn info(&self, path: &Path) -> BasaltResult<ImageInfo> {
        let file = File::open(path)?;
        match header::decode(&read_header(&file)?)? {
            Header::Signed(header) => Ok(ImageInfo::from_signed(path.to_path_buf(), &header)),
            Header::Encrypted(header) => {
                let key_slots = read_slots(&file, &header)?;
                Ok(ImageInfo::from_encrypted(
                    path.to_path_buf(),
                    &header,
                    &key_slots,
                ))
            }
        }
    }

    /// Recover the master key of `volume` with `method`.
    pub fn unlock_master_key(
        &self,
        volume: &Path,
        method: &UnlockMethod,
    ) -> BasaltResult<Zeroizing<Vec<u8>>> {
        let file = File::open(volume)?;
        let header = header::decode_encrypted(&read_header(&file)?)?;
        let key_slots = read_slots(&file, &header)?;
        unlock(&header, &key_slots, method).map(|(master, _)| master)
    }

    /// Add a password slot to `volume`, authorised by `method`. Returns the
    /// index of the new slot.
    pub fn add_password_slot(
        &self,
        volume: &Path,
        method: &UnlockMethod,
        password: &[u8],
    ) -> BasaltResult<u64> {
        if password.is_empty() {
            return Err(BasaltError::InvalidArgument("password must not be empty".into()));
        }
        let mut file = OpenOptions::new().read(true).write(true).open(volume)?;
        let header = header::decode_encrypted(&read_header(&file)?)?;
        let key_slots = read_slots(&file, &header)?;
        let (_, unlock_key) = unlock(&header, &key_slots, method)?;

        let index = key_slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| {
                BasaltError::InvalidArgument(format!(
                    "all {} key slots of {} are in use",
                    header.n_key_slots,
                    volume.display()
                ))
            })? as u64;

        let slot = slots::password_slot(password, self.config.image.password_iterations, &unlock_key)?;
        write_at(
            &mut file,
            EncryptedHeader::slot_offset(index),
            &header::encode_slot(Some(&slot))?,
        )?;
        file.sync_all()?;
        info!("added password slot {index} to {}", volume.display());
        Ok(index)
    }
}

/// Tree parameters described by a signed header.
pub fn signed_params(header: &SignedHeader) -> BasaltResult<TreeParams> {
    let hash = &header.hash;
    let to_u32 = |value: u64, field: &str| {
        u32::try_from(value).map_err(|_| BasaltError::InvalidArgument(format!("{field} too large")))
    };
    Ok(TreeParams {
        algorithm: DigestAlgorithm::parse(&hash.algorithm)?,
        n_data_blocks: header.data.size / hash.data_block_size,
        data_block_size: to_u32(hash.data_block_size, "data_block_size")?,
        hash_block_size: to_u32(hash.hash_block_size, "hash_block_size")?,
        salt: hash.salt.clone(),
    })
}

/// Try every slot matching `method`; returns the master key and the unlock
/// key it was wrapped under.
fn unlock(
    header: &EncryptedHeader,
    key_slots: &[Option<KeySlot>],
    method: &UnlockMethod,
) -> BasaltResult<(Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>)> {
    let mut tried = 0;
    for (index, slot) in key_slots.iter().enumerate() {
        let Some(slot) = slot else { continue };
        let unlock_key = match slots::open(slot, method) {
            Ok(Some(key)) => key,
            Ok(None) => continue,
            Err(KeyWrapError::IntegrityCheckFailed) => {
                tried += 1;
                debug!("slot {index} rejected the {} secret", method.name());
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        tried += 1;
        match keywrap::unwrap(&unlock_key, &header.master_key.key) {
            Ok(master) => {
                debug!("unlocked with {} slot {index}", method.name());
                return Ok((master, unlock_key));
            }
            Err(KeyWrapError::IntegrityCheckFailed) => {
                warn!("slot {index} opened but its unlock key does not fit the master key");
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(BasaltError::Unlock(if tried == 0 {
        format!("no {} key slot present", method.name())
    } else {
        format!("none of {tried} {} key slot(s) accepted the secret", method.name())
    }))
}

fn read_header(file: &File) -> BasaltResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    let mut reader = file;
    reader.seek(SeekFrom::Start(0))?;
    reader.take(HEADER_SIZE as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

fn read_slots(file: &File, header: &EncryptedHeader) -> BasaltResult<Vec<Option<KeySlot>>> {
    let mut reader = file;
    let mut buf = vec![0u8; KEY_SLOT_SIZE];
    (0..header.n_key_slots)
        .map(|index| -> BasaltResult<Option<KeySlot>> {
            reader.seek(SeekFrom::Start(EncryptedHeader::slot_offset(index)))?;
            reader.read_exact(&mut buf)?;
            Ok(header::decode_slot(&buf)?)
        })
        .collect()
}

fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)
}
