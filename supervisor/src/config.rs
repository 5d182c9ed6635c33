//! Static and dynamic on-disk configuration (spec.md §6).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator_orchestrator::ValidatorReleaseConfig;

use crate::Error;

const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pubkey: Option<String>,
    pub identity_file: Option<PathBuf>,
}

/// The log-shipper child is an opaque collaborator (spec.md §1); the daemon only needs enough
/// to launch and supervise it. Absent from config, no log shipper is started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogShipperConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
}

/// Operator-provided configuration, produced by the (out-of-core) interactive setup step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticConfig {
    pub version: u32,
    pub eth2_network: String,
    pub key_descriptor: Option<key_vault::KeyDescriptor>,
    pub fee_recipient: String,
    pub nodes: Vec<NodeConfig>,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub ssl_cert_file: Option<PathBuf>,
    pub ssl_key_file: Option<PathBuf>,
    pub port_range: (u16, u16),
    pub rpc_users: std::collections::HashMap<String, String>,
    pub backup_filename: String,
    #[serde(default)]
    pub log_shipper: Option<LogShipperConfig>,
}

impl StaticConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::InvalidConfig(format!("reading {}: {err}", path.display())))?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|err| Error::InvalidConfig(format!("parsing {}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.version != SUPPORTED_VERSION {
            return Err(Error::InvalidConfig(format!(
                "unsupported config version {} (expected {SUPPORTED_VERSION})",
                self.version
            )));
        }
        let fee_recipient_re = Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("static regex is valid");
        if !fee_recipient_re.is_match(&self.fee_recipient) {
            return Err(Error::InvalidConfig(format!(
                "fee_recipient {} is not a 20-byte hex address",
                self.fee_recipient
            )));
        }
        if self.port_range.0 >= self.port_range.1 {
            return Err(Error::InvalidConfig("port_range must be non-empty and increasing".into()));
        }
        if self.nodes.is_empty() {
            return Err(Error::InvalidConfig("at least one node must be configured".into()));
        }
        Ok(())
    }

    pub fn backup_path(&self) -> PathBuf {
        self.data_dir.join(&self.backup_filename)
    }

    pub fn key_cache_path(&self) -> PathBuf {
        self.data_dir.join("supervisor-key.hex")
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.data_dir.join("ssh_known_hosts")
    }

    pub fn rpc_sock_path(&self) -> PathBuf {
        self.data_dir.join("rpc.sock")
    }

    pub fn dynamic_config_path(&self) -> PathBuf {
        self.data_dir.join("dynamic_config.yml")
    }
}

/// Mutable configuration, rewritten only by `set_validator_release`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicConfig {
    pub version: u32,
    pub validator_release: ValidatorReleaseConfig,
}

impl DynamicConfig {
    pub fn load_or_default(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Ok(Self {
                version: SUPPORTED_VERSION,
                validator_release: validator_orchestrator::ValidatorRelease::default_release().to_config(),
            });
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::InvalidConfig(format!("reading {}: {err}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|err| Error::InvalidConfig(format!("parsing {}: {err}", path.display())))
    }

    /// Atomically persist via a temp file + rename in the same directory.
    pub fn persist(&self, path: &Path) -> Result<(), Error> {
        let yaml = serde_yaml::to_string(self)?;
        let tmp_path = path.with_extension("yml.tmp");
        std::fs::write(&tmp_path, yaml)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_yaml() -> String {
        r#"
version: 1
eth2_network: mainnet
key_descriptor: null
fee_recipient: "0x000000000000000000000000000000000000dEaD"
nodes:
  - host: bastion.example.com
    port: 2222
    user: somebody
    pubkey: null
    identity_file: null
data_dir: /var/lib/validator-supervisor
logs_dir: /var/log/validator-supervisor
ssl_cert_file: null
ssl_key_file: null
port_range: [40000, 40100]
rpc_users:
  admin: deadbeef
backup_filename: backup.bin
"#
        .to_string()
    }

    #[test]
    fn loads_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, valid_yaml()).unwrap();
        let config = StaticConfig::load(&path).unwrap();
        assert_eq!(config.eth2_network, "mainnet");
        assert_eq!(config.nodes.len(), 1);
    }

    #[test]
    fn rejects_bad_fee_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, valid_yaml().replace("0x000000000000000000000000000000000000dEaD", "not-an-address")).unwrap();
        let err = StaticConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn rejects_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, valid_yaml().replace("version: 1", "version: 2")).unwrap();
        let err = StaticConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn dynamic_config_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dynamic_config.yml");
        let config = DynamicConfig::load_or_default(&path).unwrap();
        assert_eq!(config.validator_release.impl_name, "lighthouse");

        config.persist(&path).unwrap();
        let reloaded = DynamicConfig::load_or_default(&path).unwrap();
        assert_eq!(reloaded.validator_release, config.validator_release);
    }
}
