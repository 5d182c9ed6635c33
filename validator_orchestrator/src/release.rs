use serde::{Deserialize, Serialize};

use crate::port_map::BeaconNodePortMap;
use crate::Error;

/// On-disk / RPC-wire shape of a [`ValidatorRelease`]: a flat `{impl_name, version, checksum}`
/// record that doesn't commit to a known implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorReleaseConfig {
    pub impl_name: String,
    pub version: String,
    pub checksum: String,
}

/// A validator client implementation and version to run, dispatched as a tagged variant rather
/// than stringly, per the open dispatch question in the source design notes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatorRelease {
    Lighthouse { version: String, checksum: String },
    Prysm { version: String, checksum: String },
}

impl ValidatorRelease {
    pub fn default_release() -> Self {
        ValidatorRelease::Lighthouse {
            version: "v3.0.0".to_string(),
            checksum: "23e898614d370f16144f5f3c8f3d3e387fed10caa17bad2bb24395d76f18cbc9".to_string(),
        }
    }

    pub fn from_config(cfg: ValidatorReleaseConfig) -> Result<Self, Error> {
        match cfg.impl_name.as_str() {
            "lighthouse" => Ok(ValidatorRelease::Lighthouse {
                version: cfg.version,
                checksum: cfg.checksum,
            }),
            "prysm" => Ok(ValidatorRelease::Prysm {
                version: cfg.version,
                checksum: cfg.checksum,
            }),
            other => Err(Error::BadValidatorRelease(format!(
                "invalid implementation name: {other}"
            ))),
        }
    }

    pub fn to_config(&self) -> ValidatorReleaseConfig {
        ValidatorReleaseConfig {
            impl_name: self.impl_name().to_string(),
            version: self.version().to_string(),
            checksum: self.checksum().to_string(),
        }
    }

    pub fn impl_name(&self) -> &'static str {
        match self {
            ValidatorRelease::Lighthouse { .. } => "lighthouse",
            ValidatorRelease::Prysm { .. } => "prysm",
        }
    }

    pub fn version(&self) -> &str {
        match self {
            ValidatorRelease::Lighthouse { version, .. } => version,
            ValidatorRelease::Prysm { version, .. } => version,
        }
    }

    pub fn checksum(&self) -> &str {
        match self {
            ValidatorRelease::Lighthouse { checksum, .. } => checksum,
            ValidatorRelease::Prysm { checksum, .. } => checksum,
        }
    }

    /// The port on which this release's beacon-node client answers the Eth2 HTTP API.
    pub fn beacon_api_port(&self, port_map: &BeaconNodePortMap) -> u16 {
        match self {
            ValidatorRelease::Lighthouse { .. } => port_map.lighthouse_rpc,
            ValidatorRelease::Prysm { .. } => port_map.prysm_http,
        }
    }

    /// Whether this release has a working container launch path. Prysm support was never
    /// finished upstream; carry that forward as an explicit, surfaced gap rather than a launch
    /// that silently fails.
    pub fn is_supported(&self) -> bool {
        matches!(self, ValidatorRelease::Lighthouse { .. })
    }
}
