//! Password-protected root key storage and deterministic subkey derivation.
//!
//! A [`RootKey`] is a 16-byte secret that never leaves memory in plaintext except when the
//! caller explicitly asks for its hex representation (for the on-disk key cache). Operators
//! recover it from a password via a [`KeyDescriptor`], a public commitment that can be safely
//! persisted in configuration.

use argon2::Argon2;
use blake2::digest::{FixedOutput, Mac, Update};
use blake2::Blake2bMac512;
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// PKDF work factor. `Weak` exists only so tests don't spend seconds per key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algo {
    Strong,
    Weak,
}

impl Algo {
    fn params(self) -> argon2::Params {
        match self {
            // argon2's own defaults (19 MiB, 2 passes) are adequate for an operator-facing
            // unlock and cheap enough not to block the daemon's single event loop for long.
            Algo::Strong => argon2::Params::new(19 * 1024, 2, 1, Some(RootKey::SIZE)).unwrap(),
            Algo::Weak => argon2::Params::new(8, 1, 1, Some(RootKey::SIZE)).unwrap(),
        }
    }
}

const CHECKSUM_DOMAIN: &[u8] = b"validator-supervisor/root-key-checksum/v1";
const DERIVATION_DOMAIN: &[u8] = b"validator-supervisor/root-key-derivation/v1";
const SALT_SIZE: usize = 16;
const CHECKSUM_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("incorrect password")]
    IncorrectPassword,
    #[error("invalid key descriptor: {0}")]
    InvalidKeyDescriptor(&'static str),
}

/// A root key held only in memory, from which purpose-specific subkeys are derived.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    data: [u8; RootKey::SIZE],
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootKey").field("data", &"<redacted>").finish()
    }
}

impl RootKey {
    pub const SIZE: usize = 16;

    fn from_bytes(data: [u8; Self::SIZE]) -> Self {
        Self { data }
    }

    /// Derive a deterministic subkey for `tag`, `size` bytes long (at most 64).
    ///
    /// Uses a keyed Blake2b MAC over a fixed domain-separation prefix and the tag, truncated
    /// to the requested size.
    pub fn derive(&self, tag: &[u8], size: usize) -> Vec<u8> {
        keyed_hash(&self.data, DERIVATION_DOMAIN, tag, size)
    }

    /// Derive the symmetric key used to seal backup archives (see `archive_codec`).
    pub fn derive_backup_key(&self) -> Vec<u8> {
        self.derive(b"backup-archive-key", 32)
    }

    /// Hex-encode the key. Only ever call this for the on-disk key cache file.
    pub fn to_hex(&self) -> String {
        hex::encode(self.data)
    }

    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s.trim()).map_err(|_| Error::InvalidKeyDescriptor("not hex"))?;
        let arr: [u8; Self::SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKeyDescriptor("wrong key length"))?;
        Ok(Self::from_bytes(arr))
    }

    /// Write the key's hex form to `path`, creating it with mode 0600 (owner read/write only).
    #[cfg(unix)]
    pub fn write_to_file(&self, path: &std::path::Path) -> std::io::Result<()> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(self.to_hex().as_bytes())
    }

    /// Read a previously cached root key back from `path`, written by [`Self::write_to_file`].
    pub fn read_from_file(path: &std::path::Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|_| Error::InvalidKeyDescriptor("could not read key cache file"))?;
        Self::from_hex(&contents)
    }
}

/// A public commitment to a [`RootKey`], safe to persist in configuration.
///
/// `descriptor.check(key)` holds iff `key` is the one this descriptor was generated from.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KeyDescriptor {
    pub algo: Algo,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub checksum: Vec<u8>,
}

impl KeyDescriptor {
    /// Generate a fresh random root key and its descriptor from a password.
    pub fn generate(password: &str, algo: Algo) -> (Self, RootKey) {
        let mut salt = vec![0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let key_data = run_kdf(password, &salt, algo);
        let checksum = checksum_of(&key_data);
        (
            Self {
                algo,
                salt,
                checksum,
            },
            RootKey::from_bytes(key_data),
        )
    }

    /// Recover the root key from a password, failing if it is incorrect.
    pub fn open(&self, password: &str) -> Result<RootKey, Error> {
        if self.salt.len() != SALT_SIZE {
            return Err(Error::InvalidKeyDescriptor("salt is incorrect length"));
        }
        if self.checksum.len() != CHECKSUM_SIZE {
            return Err(Error::InvalidKeyDescriptor("checksum is incorrect length"));
        }
        let key_data = run_kdf(password, &self.salt, self.algo);
        self.check(&key_data).ok_or(Error::IncorrectPassword)
    }

    /// Constant-time check of raw key bytes against this descriptor's commitment.
    pub fn check(&self, key_data: &[u8; RootKey::SIZE]) -> Option<RootKey> {
        let candidate = checksum_of(key_data);
        if candidate.ct_eq(&self.checksum).into() {
            Some(RootKey::from_bytes(*key_data))
        } else {
            None
        }
    }
}

fn run_kdf(password: &str, salt: &[u8], algo: Algo) -> [u8; RootKey::SIZE] {
    let params = algo.params();
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut out = [0u8; RootKey::SIZE];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .expect("argon2 output buffer is sized from its own Params");
    out
}

fn checksum_of(key_data: &[u8; RootKey::SIZE]) -> Vec<u8> {
    keyed_hash(key_data, CHECKSUM_DOMAIN, b"", CHECKSUM_SIZE)
}

fn keyed_hash(key: &[u8], domain: &[u8], input: &[u8], out_len: usize) -> Vec<u8> {
    assert!(out_len <= 64, "blake2b output is at most 64 bytes");
    let mut mac = Blake2bMac512::new_from_slice(key).expect("key is a valid MAC key");
    Update::update(&mut mac, domain);
    Update::update(&mut mac, input);
    let full = mac.finalize_fixed();
    full[..out_len].to_vec()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_open_round_trips() {
        let (desc, root_key) = KeyDescriptor::generate("hunter2", Algo::Weak);
        let opened = desc.open("hunter2").expect("correct password");
        assert_eq!(opened.data, root_key.data);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let (desc, _root_key) = KeyDescriptor::generate("hunter2", Algo::Weak);
        let err = desc.open("wrong password").unwrap_err();
        assert!(matches!(err, Error::IncorrectPassword));
    }

    #[test]
    fn derive_is_deterministic_and_tag_dependent() {
        let (_desc, root_key) = KeyDescriptor::generate("hunter2", Algo::Weak);
        let a = root_key.derive(b"tag-a", 32);
        let a_again = root_key.derive(b"tag-a", 32);
        let b = root_key.derive(b"tag-b", 32);
        assert_eq!(a, a_again);
        assert_ne!(a, b);
    }

    #[test]
    fn backup_key_is_32_bytes() {
        let (_desc, root_key) = KeyDescriptor::generate("hunter2", Algo::Weak);
        assert_eq!(root_key.derive_backup_key().len(), 32);
    }

    #[test]
    fn key_cache_file_round_trips_and_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor-key.hex");
        let (_desc, root_key) = KeyDescriptor::generate("hunter2", Algo::Weak);

        root_key.write_to_file(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let reloaded = RootKey::read_from_file(&path).unwrap();
        assert_eq!(reloaded.data, root_key.data);
    }

    #[test]
    fn descriptor_serializes_as_hex_yaml() {
        let (desc, _) = KeyDescriptor::generate("hunter2", Algo::Weak);
        let yaml = serde_yaml::to_string(&desc).unwrap();
        let back: KeyDescriptor = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(desc.salt, back.salt);
        assert_eq!(desc.checksum, back.checksum);
    }
}
