use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("port range exhausted")]
    OutOfPorts,
    #[error("operation needs an unlocked root key")]
    UnlockRequired,
    #[error(transparent)]
    KeyVault(#[from] key_vault::Error),
    #[error(transparent)]
    Archive(#[from] archive_codec::Error),
    #[error(transparent)]
    BackupSync(#[from] backup_sync::Error),
    #[error(transparent)]
    Orchestrator(#[from] validator_orchestrator::Error),
    #[error(transparent)]
    Supervisor(#[from] subprocess_supervisor::Error),
    #[error(transparent)]
    Tunnel(#[from] tunnel::Error),
    #[error(transparent)]
    Rpc(#[from] rpc::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
