//! Recovery-key parsing and persistence used by `diskctl`.
//!
//! A recovery key is 32 raw bytes. On screen and on disk it is usually written
//! as hex, grouped with dashes so operators can read it back.

use crate::error::{BasaltError, BasaltResult};
use std::fs;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

pub const RECOVERY_KEY_LEN: usize = 32;
const GROUP_DIGITS: usize = 8;

/// Render key bytes as dash-separated groups of eight hex digits.
pub fn format_recovery_key(key: &[u8]) -> Zeroizing<String> {
    let digits = Zeroizing::new(hex::encode(key));
    let mut grouped = String::with_capacity(digits.len() + digits.len() / GROUP_DIGITS);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && idx % GROUP_DIGITS == 0 {
            grouped.push('-');
        }
        grouped.push(ch);
    }
    Zeroizing::new(grouped)
}

/// Read a recovery key file.
pub fn read_key_file(path: &Path) -> BasaltResult<Zeroizing<Vec<u8>>> {
    let contents = Zeroizing::new(fs::read(path)?);
    decode_key_bytes(path, &contents)
}

/// Decode raw bytes into key material, accepting either a 32-byte binary key
/// or 64 hex digits (whitespace and dashes ignored).
pub fn decode_key_bytes(origin: &Path, bytes: &[u8]) -> BasaltResult<Zeroizing<Vec<u8>>> {
    if bytes.len() == RECOVERY_KEY_LEN {
        return Ok(Zeroizing::new(bytes.to_vec()));
    }

    if bytes.is_empty() {
        return Err(invalid_key(origin, "file is empty"));
    }

    let mut filtered = Zeroizing::new(Vec::with_capacity(bytes.len()));
    for byte in bytes {
        if byte.is_ascii_whitespace() || *byte == b'-' {
            continue;
        }
        if !byte.is_ascii_hexdigit() {
            return Err(invalid_key(
                origin,
                format!("found non-hex byte 0x{byte:02x}"),
            ));
        }
        filtered.push(*byte);
    }

    if filtered.len() != RECOVERY_KEY_LEN * 2 {
        return Err(invalid_key(
            origin,
            format!(
                "hex key must contain exactly {} hex digits (got {})",
                RECOVERY_KEY_LEN * 2,
                filtered.len()
            ),
        ));
    }

    let key = hex::decode(&filtered[..])
        .map_err(|err| invalid_key(origin, format!("hex decode failed: {err}")))?;
    Ok(Zeroizing::new(key))
}

/// Write key material to `path` atomically with mode 0400.
pub fn write_key_file(path: &Path, contents: &[u8]) -> BasaltResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let ownership = fs::metadata(path)
        .ok()
        .map(|meta| (meta.uid(), meta.gid()));

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(contents)?;
    temp.as_file_mut().flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o400))?;

    if let Some((uid, gid)) = ownership {
        let rc = unsafe { libc::fchown(temp.as_file().as_raw_fd(), uid, gid) };
        if rc != 0 {
            return Err(BasaltError::Io(std::io::Error::last_os_error()));
        }
    }

    let _ = temp.as_file().sync_all();
    temp.persist(path).map_err(|err| BasaltError::Io(err.error))?;
    let _ = fs::File::open(parent).and_then(|dir| dir.sync_all());
    Ok(())
}

fn invalid_key(path: &Path, reason: impl Into<String>) -> BasaltError {
    BasaltError::InvalidHexKey {
        path: PathBuf::from(path),
        reason: reason.into(),
    }
}
