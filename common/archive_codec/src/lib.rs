//! Encrypted, compressed archives of validator state.
//!
//! An unpacked validator data directory looks like:
//!
//! ```text
//! slashing-protection.json
//! validators/<0x[0-9a-f]{96}>/keystore.json
//! validators/<0x[0-9a-f]{96}>/password.txt
//! ```
//!
//! [`BackupArchive::pack`] tars and xz-compresses such a directory; [`BackupArchive::lock`]
//! seals the result (plus a creation timestamp) with an AEAD cipher so the on-disk/uploaded
//! form reveals nothing and cannot be replayed with a rolled-forward timestamp.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use regex::Regex;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const NONCE_SIZE: usize = 24;

#[derive(Debug, Error)]
pub enum Error {
    #[error("archive is corrupt or the wrong key was used")]
    CorruptArchive,
    #[error("missing validator data: {0}")]
    MissingValidatorData(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An in-memory handle to an unsealed backup: a compressed tar payload plus its creation time.
#[derive(Debug)]
pub struct BackupArchive {
    pub payload: Vec<u8>,
    pub timestamp: u32,
}

impl BackupArchive {
    /// Tar and xz-compress `dir`, stamping the archive with the current time.
    pub fn pack(dir: &Path) -> Result<Self, Error> {
        let xz_buf = Vec::new();
        let mut encoder = xz2::write::XzEncoder::new(xz_buf, 6);
        {
            let mut builder = tar::Builder::new(&mut encoder);
            // `append_dir_all` recurses into subdirectories, unlike `append_path_with_name`,
            // which only adds a directory's own entry.
            builder.append_dir_all(".", dir)?;
            builder.finish()?;
        }
        let payload = encoder.finish()?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is after the epoch")
            .as_secs() as u32;
        Ok(Self { payload, timestamp })
    }

    /// Seal the archive with `key`, writing `nonce || ciphertext` to `dst`.
    ///
    /// Returns the number of bytes written. The timestamp is inside the authenticated
    /// plaintext, so it cannot be rolled forward without invalidating the AEAD tag.
    pub fn lock(&self, key: &[u8], dst: &mut impl Write) -> Result<usize, Error> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let mut plaintext = Vec::with_capacity(4 + self.payload.len());
        plaintext.extend_from_slice(&self.timestamp.to_le_bytes());
        plaintext.extend_from_slice(&self.payload);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| Error::CorruptArchive)?;

        dst.write_all(&nonce_bytes)?;
        dst.write_all(&ciphertext)?;
        Ok(NONCE_SIZE + ciphertext.len())
    }

    /// Unseal an archive previously written by [`BackupArchive::lock`].
    ///
    /// A decryption failure, truncated input, or malformed header all become
    /// [`Error::CorruptArchive`]: the caller should treat the archive as absent.
    pub fn unlock(key: &[u8], src: &mut impl Read) -> Result<Self, Error> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        src.read_exact(&mut nonce_bytes)
            .map_err(|_| Error::CorruptArchive)?;
        let mut ciphertext = Vec::new();
        src.read_to_end(&mut ciphertext)?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        let plaintext = cipher
            .decrypt(XNonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| Error::CorruptArchive)?;

        if plaintext.len() < 4 {
            return Err(Error::CorruptArchive);
        }
        let timestamp = u32::from_le_bytes(plaintext[..4].try_into().unwrap());
        Ok(Self {
            payload: plaintext[4..].to_vec(),
            timestamp,
        })
    }

    /// Extract the archive's contents into `dir`, which the caller guarantees is empty.
    pub fn unpack(&self, dir: &Path) -> Result<(), Error> {
        let decoder = xz2::read::XzDecoder::new(Cursor::new(&self.payload));
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(dir).map_err(|_| Error::CorruptArchive)
    }
}

/// Validate that `dir` has the validator data directory shape documented on [`BackupArchive`].
///
/// Does not check for extraneous files, only missing ones.
pub fn check_validator_data_dir(dir: &Path) -> Result<(), Error> {
    if !dir.is_dir() {
        return Err(Error::MissingValidatorData(
            "missing validator data directory".into(),
        ));
    }
    if !dir.join("slashing-protection.json").is_file() {
        return Err(Error::MissingValidatorData(
            "missing slashing-protection.json file".into(),
        ));
    }

    let validators_dir = dir.join("validators");
    if !validators_dir.is_dir() {
        return Err(Error::MissingValidatorData(
            "missing validators directory".into(),
        ));
    }

    let pubkey_re = Regex::new(r"^0x[0-9a-f]{96}$").expect("static regex is valid");
    for entry in fs::read_dir(&validators_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !pubkey_re.is_match(&name) || !entry.path().is_dir() {
            continue;
        }

        let validator_dir = validators_dir.join(name.as_ref());
        if !validator_dir.join("keystore.json").is_file() {
            return Err(Error::MissingValidatorData(format!(
                "missing keystore.json for {name}"
            )));
        }
        if !validator_dir.join("password.txt").is_file() {
            return Err(Error::MissingValidatorData(format!(
                "missing password.txt for {name}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn now_secs() -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32
    }

    #[test]
    fn round_trip_pack_lock_unlock_unpack() {
        let src_dir = tempfile::tempdir().unwrap();
        File::create(src_dir.path().join("hello.txt"))
            .unwrap()
            .write_all(b"hello world")
            .unwrap();

        let t_before = now_secs();
        let archive = BackupArchive::pack(src_dir.path()).unwrap();
        let t_after = now_secs();
        assert!(archive.timestamp >= t_before && archive.timestamp <= t_after);

        let key = [7u8; 32];
        let mut locked = Vec::new();
        archive.lock(&key, &mut locked).unwrap();

        let unlocked = BackupArchive::unlock(&key, &mut Cursor::new(&locked)).unwrap();
        assert_eq!(unlocked.timestamp, archive.timestamp);

        let dst_dir = tempfile::tempdir().unwrap();
        unlocked.unpack(dst_dir.path()).unwrap();
        let contents = fs::read(dst_dir.path().join("hello.txt")).unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[test]
    fn pack_unpack_recurses_into_nested_validator_directories() {
        let src_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(src_dir.path().join("validators").join("0xabc")).unwrap();
        File::create(src_dir.path().join("slashing-protection.json")).unwrap();
        File::create(src_dir.path().join("validators").join("0xabc").join("keystore.json"))
            .unwrap()
            .write_all(b"keystore contents")
            .unwrap();
        File::create(src_dir.path().join("validators").join("0xabc").join("password.txt"))
            .unwrap()
            .write_all(b"hunter2")
            .unwrap();

        let archive = BackupArchive::pack(src_dir.path()).unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        archive.unpack(dst_dir.path()).unwrap();

        assert!(dst_dir.path().join("slashing-protection.json").is_file());
        let keystore = fs::read(dst_dir.path().join("validators").join("0xabc").join("keystore.json")).unwrap();
        assert_eq!(keystore, b"keystore contents");
        let password = fs::read(dst_dir.path().join("validators").join("0xabc").join("password.txt")).unwrap();
        assert_eq!(password, b"hunter2");
    }

    #[test]
    fn wrong_key_is_corrupt_archive() {
        let src_dir = tempfile::tempdir().unwrap();
        File::create(src_dir.path().join("hello.txt"))
            .unwrap()
            .write_all(b"hello world")
            .unwrap();
        let archive = BackupArchive::pack(src_dir.path()).unwrap();

        let key = [1u8; 32];
        let wrong_key = [2u8; 32];
        let mut locked = Vec::new();
        archive.lock(&key, &mut locked).unwrap();

        let err = BackupArchive::unlock(&wrong_key, &mut Cursor::new(&locked)).unwrap_err();
        assert!(matches!(err, Error::CorruptArchive));
    }

    #[test]
    fn truncated_archive_is_corrupt() {
        let err = BackupArchive::unlock(&[0u8; 32], &mut Cursor::new(&[1, 2, 3])).unwrap_err();
        assert!(matches!(err, Error::CorruptArchive));
    }

    #[test]
    fn validator_data_dir_checks_required_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_validator_data_dir(dir.path()).is_err());

        File::create(dir.path().join("slashing-protection.json")).unwrap();
        fs::create_dir(dir.path().join("validators")).unwrap();
        assert!(check_validator_data_dir(dir.path()).is_ok());

        let pubkey = format!("0x{}", "a".repeat(96));
        let validator_dir = dir.path().join("validators").join(&pubkey);
        fs::create_dir(&validator_dir).unwrap();
        assert!(check_validator_data_dir(dir.path()).is_err());

        File::create(validator_dir.join("keystore.json")).unwrap();
        assert!(check_validator_data_dir(dir.path()).is_err());

        File::create(validator_dir.join("password.txt")).unwrap();
        assert!(check_validator_data_dir(dir.path()).is_ok());
    }
}
