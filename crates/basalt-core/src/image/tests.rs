use super::header::{self, EncryptedHeader, KEY_SLOT_SIZE};
use super::*;
use crate::config::BasaltConfig;
use crate::error::BasaltError;
use crate::keyfile::decode_key_bytes;
use basalt_provider::{
    CryptTarget, DiscardMode, LoopOptions, MapperProvider, MappingDescriptor, MappingKind,
    VerityTarget,
};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};
use zeroize::Zeroizing;

#[derive(Default)]
struct MockState {
    loops: Vec<(PathBuf, LoopOptions)>,
    detached: Vec<PathBuf>,
    discards: Vec<DiscardMode>,
    verity: Vec<(String, VerityTarget)>,
    crypt: Vec<(String, String, Vec<u8>)>,
    fail_mapping: bool,
    fail_discard: bool,
}

#[derive(Clone, Default)]
struct MockMapper {
    state: Arc<Mutex<MockState>>,
}

impl MockMapper {
    fn failing_mapping() -> Self {
        let mock = Self::default();
        mock.state.lock().unwrap().fail_mapping = true;
        mock
    }

    fn mapping(&self, name: &str, kind: MappingKind, read_only: bool) -> MappingDescriptor {
        let state = self.state.lock().unwrap();
        MappingDescriptor {
            name: name.to_string(),
            device: PathBuf::from(format!("/dev/dm-{}", state.verity.len() + state.crypt.len())),
            kind,
            read_only,
        }
    }
}

impl MapperProvider for MockMapper {
    type Error = io::Error;

    fn attach_loop(&self, file: &Path, options: LoopOptions) -> io::Result<PathBuf> {
        let mut state = self.state.lock().unwrap();
        state.loops.push((file.to_path_buf(), options));
        Ok(PathBuf::from(format!("/dev/loop{}", state.loops.len() - 1)))
    }

    fn detach_loop(&self, device: &Path) -> io::Result<()> {
        self.state.lock().unwrap().detached.push(device.to_path_buf());
        Ok(())
    }

    fn create_verity(&self, name: &str, target: &VerityTarget) -> io::Result<MappingDescriptor> {
        if self.state.lock().unwrap().fail_mapping {
            return Err(io::Error::new(io::ErrorKind::Other, "dm table rejected"));
        }
        let mapping = self.mapping(name, MappingKind::Verity, true);
        self.state
            .lock()
            .unwrap()
            .verity
            .push((name.to_string(), target.clone()));
        Ok(mapping)
    }

    fn create_crypt(&self, name: &str, target: &CryptTarget) -> io::Result<MappingDescriptor> {
        if self.state.lock().unwrap().fail_mapping {
            return Err(io::Error::new(io::ErrorKind::Other, "dm table rejected"));
        }
        let mapping = self.mapping(name, MappingKind::Crypt, false);
        self.state.lock().unwrap().crypt.push((
            name.to_string(),
            target.table().to_string(),
            target.key.to_vec(),
        ));
        Ok(mapping)
    }

    fn discard(&self, _device: &Path, mode: DiscardMode) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.discards.push(mode);
        if state.fail_discard && mode == DiscardMode::Secure {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "no secure discard"));
        }
        Ok(())
    }
}

fn test_config() -> Arc<BasaltConfig> {
    let mut config = BasaltConfig::default();
    config.image.password_iterations = 1000;
    Arc::new(config)
}

fn volume(dir: &TempDir, size: u64) -> PathBuf {
    let path = dir.path().join("volume.img");
    File::create(&path).unwrap().set_len(size).unwrap();
    path
}

fn signed_image(dir: &TempDir, service: &DiskImageService<MockMapper>) -> PathBuf {
    let data = dir.path().join("rootfs.squashfs");
    let payload: Vec<u8> = (0..4096u32 * 128).map(|i| (i % 253) as u8).collect();
    fs::write(&data, payload).unwrap();
    let image = dir.path().join("rootfs.img");
    service
        .format_signed(&data, &image, "rootfs", "squashfs")
        .unwrap();
    image
}

#[test]
fn encrypted_volume_formats_and_sets_up_via_clear_slot() {
    let dir = tempdir().unwrap();
    let path = volume(&dir, 10 * 1024 * 1024);
    let mock = MockMapper::default();
    let service = DiskImageService::new(test_config(), mock.clone());

    let recovery = service.format_encrypted(&path, "vol1", "ext4").unwrap();
    assert_eq!(recovery.len(), 64 + 7);

    let info = service.info(&path).unwrap();
    assert_eq!(info.kind, ImageKind::Encrypted);
    assert_eq!(info.label, "vol1");
    assert_eq!(info.data_type, "ext4");
    let encrypted = info.encrypted.as_ref().unwrap();
    assert_eq!(encrypted.n_key_slots, 8);
    assert_eq!(encrypted.slots[0].index, 0);
    assert_eq!(encrypted.slots[0].kind, "clear");
    assert_eq!(encrypted.slots[1].kind, "recovery");
    assert_eq!(encrypted.slots.len(), 2);
    assert_eq!(encrypted.cipher, "aes-xts-plain64");
    assert_eq!(info.data_offset, EncryptedHeader::slot_offset(8));

    let mapping = service.setup(&path).unwrap();
    assert!(mapping
        .device
        .to_string_lossy()
        .starts_with("/dev/dm-"));
    assert_eq!(mapping.kind, MappingKind::Crypt);
    assert_eq!(mapping.name, format!("basalt-{}", info.object_uuid));

    let master = service
        .unlock_master_key(&path, &UnlockMethod::Clear)
        .unwrap();
    assert_eq!(master.len(), 64);

    let state = mock.state.lock().unwrap();
    assert_eq!(state.discards, vec![DiscardMode::Secure]);
    assert_eq!(state.loops.len(), 1);
    assert!(!state.loops[0].1.read_only);
    let (_, table, key) = &state.crypt[0];
    assert_eq!(key.as_slice(), master.as_slice());
    let sectors = (10 * 1024 * 1024 - EncryptedHeader::slot_offset(8)) / 512;
    assert!(table.starts_with(&format!("0 {sectors} crypt aes-xts-plain64 ")));
    assert!(table.ends_with(" 0 /dev/loop0 72"));
}

#[test]
fn discard_falls_back_to_plain() {
    let dir = tempdir().unwrap();
    let path = volume(&dir, 1024 * 1024);
    let mock = MockMapper::default();
    mock.state.lock().unwrap().fail_discard = true;
    let service = DiskImageService::new(test_config(), mock.clone());
    service.format_encrypted(&path, "vol2", "xfs").unwrap();
    assert_eq!(
        mock.state.lock().unwrap().discards,
        vec![DiscardMode::Secure, DiscardMode::Plain]
    );
}

#[test]
fn volume_too_small_for_slots_is_rejected() {
    let dir = tempdir().unwrap();
    let path = volume(&dir, EncryptedHeader::slot_offset(8));
    let service = DiskImageService::new(test_config(), MockMapper::default());
    let err = service.format_encrypted(&path, "vol1", "ext4").unwrap_err();
    assert!(matches!(err, BasaltError::InvalidArgument(_)));
}

#[test]
fn recovery_key_and_password_unlock_the_same_master_key() {
    let dir = tempdir().unwrap();
    let path = volume(&dir, 1024 * 1024);
    let service = DiskImageService::new(test_config(), MockMapper::default());
    let recovery = service.format_encrypted(&path, "vol1", "ext4").unwrap();
    let clear = service
        .unlock_master_key(&path, &UnlockMethod::Clear)
        .unwrap();

    let recovery_bytes = decode_key_bytes(Path::new("<test>"), recovery.as_bytes()).unwrap();
    let via_recovery = service
        .unlock_master_key(&path, &UnlockMethod::RecoveryKey(recovery_bytes.clone()))
        .unwrap();
    assert_eq!(via_recovery, clear);

    let index = service
        .add_password_slot(&path, &UnlockMethod::RecoveryKey(recovery_bytes), b"correct horse")
        .unwrap();
    assert_eq!(index, 2);

    let via_password = service
        .unlock_master_key(
            &path,
            &UnlockMethod::Password(Zeroizing::new("correct horse".into())),
        )
        .unwrap();
    assert_eq!(via_password, clear);

    let err = service
        .unlock_master_key(
            &path,
            &UnlockMethod::Password(Zeroizing::new("battery staple".into())),
        )
        .unwrap_err();
    assert!(matches!(err, BasaltError::Unlock(_)));

    let info = service.info(&path).unwrap();
    let slots = &info.encrypted.as_ref().unwrap().slots;
    assert_eq!(slots[2].kind, "password");
    assert!(slots[2].detail.as_deref().unwrap().contains("1000 iterations"));
}

#[test]
fn wrong_recovery_key_moves_on_and_fails() {
    let dir = tempdir().unwrap();
    let path = volume(&dir, 1024 * 1024);
    let service = DiskImageService::new(test_config(), MockMapper::default());
    service.format_encrypted(&path, "vol1", "ext4").unwrap();

    let err = service
        .unlock_master_key(
            &path,
            &UnlockMethod::RecoveryKey(Zeroizing::new(vec![0x77; 32])),
        )
        .unwrap_err();
    match err {
        BasaltError::Unlock(message) => assert!(message.contains("1 recovery")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn password_slot_needs_a_free_slot() {
    let dir = tempdir().unwrap();
    let path = volume(&dir, 1024 * 1024);
    let mut config = BasaltConfig::default();
    config.image.key_slots = 2;
    config.image.password_iterations = 1000;
    let service = DiskImageService::new(Arc::new(config), MockMapper::default());
    service.format_encrypted(&path, "vol1", "ext4").unwrap();

    let err = service
        .add_password_slot(&path, &UnlockMethod::Clear, b"pw")
        .unwrap_err();
    assert!(matches!(err, BasaltError::InvalidArgument(_)));
}

#[test]
fn setup_reports_clear_slot_failure() {
    let dir = tempdir().unwrap();
    let path = volume(&dir, 1024 * 1024);
    let mock = MockMapper::default();
    let service = DiskImageService::new(test_config(), mock.clone());
    service.format_encrypted(&path, "vol1", "ext4").unwrap();

    // Wipe the clear slot; the recovery slot alone cannot be used by setup.
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(EncryptedHeader::slot_offset(0)))
        .unwrap();
    file.write_all(&[0u8; KEY_SLOT_SIZE]).unwrap();

    let err = service.setup(&path).unwrap_err();
    match err {
        BasaltError::Unlock(message) => assert!(message.contains("clear key")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(mock.state.lock().unwrap().loops.is_empty());
}

#[test]
fn failed_crypt_mapping_releases_loop() {
    let dir = tempdir().unwrap();
    let path = volume(&dir, 1024 * 1024);
    let mock = MockMapper::failing_mapping();
    let service = DiskImageService::new(test_config(), mock.clone());
    service.format_encrypted(&path, "vol1", "ext4").unwrap();

    let err = service.setup(&path).unwrap_err();
    assert!(matches!(err, BasaltError::Provider(_)));
    assert_eq!(
        mock.state.lock().unwrap().detached,
        vec![PathBuf::from("/dev/loop0")]
    );
}

#[test]
fn signed_image_reports_root_hash_and_sets_up_verity() {
    let dir = tempdir().unwrap();
    let mock = MockMapper::default();
    let service = DiskImageService::new(test_config(), mock.clone());
    let image = signed_image(&dir, &service);

    let info = service.info(&image).unwrap();
    assert_eq!(info.kind, ImageKind::Signed);
    let signed = info.signed.as_ref().unwrap();
    assert_eq!(signed.digest_size, 32);
    assert_eq!(signed.root_hash.len(), 64);
    assert!(signed.root_hash.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(signed.salt.len(), 64);
    // 128 digests fill exactly one hash block.
    assert_eq!(signed.hash_size, 4096);
    assert_eq!(info.data_offset, 8192);
    assert_eq!(signed.hash_offset, 8192 + 4096 * 128);
    assert!(info.to_string().contains(&signed.root_hash));

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["kind"], "signed");
    assert_eq!(json["signed"]["root_hash"], signed.root_hash.as_str());
    assert!(json.get("encrypted").is_none());

    let mapping = service.setup(&image).unwrap();
    assert_eq!(mapping.kind, MappingKind::Verity);
    assert!(mapping.read_only);

    let state = mock.state.lock().unwrap();
    assert_eq!(
        state.loops[0].1,
        LoopOptions {
            read_only: true,
            offset: 8192,
            size_limit: Some(4096 * 128),
        }
    );
    assert_eq!(state.loops[1].1.offset, 0);
    let (_, target) = &state.verity[0];
    assert_eq!(target.data_blocks, 128);
    assert_eq!(target.hash_start_block, (8192 + 4096 * 128) / 4096);
    assert_eq!(hex::encode(&target.root_hash), signed.root_hash);
    assert_eq!(target.data_device, PathBuf::from("/dev/loop0"));
    assert_eq!(target.hash_device, PathBuf::from("/dev/loop1"));
}

#[test]
fn tampered_signed_image_is_refused() {
    let dir = tempdir().unwrap();
    let mock = MockMapper::default();
    let service = DiskImageService::new(test_config(), mock.clone());
    let image = signed_image(&dir, &service);

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&image)
        .unwrap();
    file.seek(SeekFrom::Start(8192 + 4096 * 5 + 17)).unwrap();
    file.write_all(&[0xFF]).unwrap();

    let err = service.setup(&image).unwrap_err();
    assert!(matches!(
        err,
        BasaltError::HashTree(hashtree::HashTreeError::Mismatch { level: 0, block: 0 })
    ));
    assert!(mock.state.lock().unwrap().loops.is_empty());
}

#[test]
fn unknown_file_is_neither_format() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("random.bin");
    fs::write(&path, vec![0x3C; 8192]).unwrap();
    let service = DiskImageService::new(test_config(), MockMapper::default());

    match service.setup(&path).unwrap_err() {
        BasaltError::NotAnImage { signed, encrypted, .. } => {
            assert!(signed.contains("super UUID"));
            assert!(encrypted.contains("super UUID"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let short = dir.path().join("short.bin");
    fs::write(&short, b"tiny").unwrap();
    assert!(matches!(
        service.setup(&short),
        Err(BasaltError::NotAnImage { .. })
    ));
    assert!(matches!(
        service.info(&short),
        Err(BasaltError::Validation(header::HeaderError::TooShort { .. }))
    ));
}

#[test]
fn tiny_data_file_cannot_be_signed() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("small.bin");
    fs::write(&data, vec![1u8; 4096 * 2]).unwrap();
    let service = DiskImageService::new(test_config(), MockMapper::default());
    let err = service
        .format_signed(&data, &dir.path().join("small.img"), "small", "raw")
        .unwrap_err();
    assert!(matches!(
        err,
        BasaltError::HashTree(hashtree::HashTreeError::InvalidParameters(_))
    ));
    assert!(!dir.path().join("small.img").exists());
}

#[test]
fn hand_built_config_with_zero_block_size_is_rejected() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("payload.bin");
    fs::write(&data, vec![7u8; 4096 * 4]).unwrap();

    let mut config = BasaltConfig::default();
    config.image.data_block_size = 0;
    let mock = MockMapper::default();
    let service = DiskImageService::new(Arc::new(config), mock.clone());

    let err = service
        .format_signed(&data, &dir.path().join("out.img"), "rootfs", "raw")
        .unwrap_err();
    match err {
        BasaltError::InvalidConfig(message) => {
            assert!(message.contains("image.data_block_size"), "{message}")
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!dir.path().join("out.img").exists());

    let path = volume(&dir, 1024 * 1024);
    let err = service.format_encrypted(&path, "vol1", "ext4").unwrap_err();
    assert!(matches!(err, BasaltError::InvalidConfig(_)));
    assert!(mock.state.lock().unwrap().discards.is_empty());
}
