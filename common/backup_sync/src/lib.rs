//! Multi-site freshest-wins backup sync: load the newest validator-state archive across local
//! disk and every reachable remote node before a validator launch, and fan an upload of the
//! freshly produced archive back out to every remote after a validator stop.

use archive_codec::BackupArchive;
use async_trait::async_trait;
use slog::{info, warn, Logger};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tunnel::TunnelClient;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validator is currently running")]
    ValidatorRunning,
    #[error(transparent)]
    Archive(#[from] archive_codec::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Whatever the caller uses to decide "is the validator task currently running" — the load and
/// save protocols both refuse to run while it is. Kept as a trait (rather than depending on
/// `validator_orchestrator` directly) so this crate has no upward dependency on its caller.
#[async_trait]
pub trait ValidatorState: Send + Sync {
    async fn is_running(&self) -> bool;
}

/// One remote node reachable for backup sync.
pub struct RemoteNode {
    pub label: String,
    pub client: Arc<dyn TunnelClient>,
}

/// Runs the load (pre-launch) and save (post-stop) protocols from spec.md §4.F.
pub struct BackupSync {
    local_backup_path: PathBuf,
    remote_filename: String,
    nodes: Vec<RemoteNode>,
    log: Logger,
}

impl BackupSync {
    pub fn new(local_backup_path: PathBuf, backup_filename: String, nodes: Vec<RemoteNode>, log: Logger) -> Self {
        Self {
            local_backup_path,
            remote_filename: format!("supervisor-backups/{backup_filename}"),
            nodes,
            log,
        }
    }

    /// Load the freshest archive across local disk and every reachable remote node, unpacking
    /// it into `scratch_dir` (which the caller guarantees is empty). Returns `false` if no
    /// archive was found anywhere — the caller decides how to proceed, typically by blocking
    /// validator start.
    pub async fn load(
        &self,
        key: &[u8],
        state: &dyn ValidatorState,
        scratch_dir: &Path,
    ) -> Result<bool, Error> {
        if state.is_running().await {
            return Err(Error::ValidatorRunning);
        }

        let mut candidate: Option<BackupArchive> = None;

        if self.local_backup_path.exists() {
            match self.unlock_file(&self.local_backup_path, key) {
                Ok(archive) => candidate = Some(archive),
                Err(archive_codec::Error::CorruptArchive) => {
                    warn!(self.log, "local backup archive is corrupt, ignoring";
                        "path" => %self.local_backup_path.display());
                }
                Err(err) => return Err(err.into()),
            }
        }

        for node in &self.nodes {
            let tmp = tempfile::NamedTempFile::new_in(
                self.local_backup_path.parent().unwrap_or_else(|| Path::new(".")),
            )?;
            let tmp_path = tmp.path().to_path_buf();
            let tmp_path_str = tmp_path.to_string_lossy().into_owned();

            match node.client.copy_to_local(&self.remote_filename, &tmp_path_str).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(self.log, "remote has no backup archive to fetch"; "node" => %node.label);
                    continue;
                }
                Err(err) => {
                    warn!(self.log, "failed to copy backup archive from remote";
                        "node" => %node.label, "error" => %err);
                    continue;
                }
            }

            match self.unlock_file(&tmp_path, key) {
                Ok(archive) => {
                    let is_newer = candidate.as_ref().map(|c| archive.timestamp > c.timestamp).unwrap_or(true);
                    if is_newer {
                        tokio::fs::rename(&tmp_path, &self.local_backup_path).await?;
                        info!(self.log, "remote archive is freshest so far";
                            "node" => %node.label, "timestamp" => archive.timestamp);
                        candidate = Some(archive);
                    }
                }
                Err(archive_codec::Error::CorruptArchive) => {
                    warn!(self.log, "remote backup archive is corrupt, ignoring"; "node" => %node.label);
                }
                Err(err) => return Err(err.into()),
            }
        }

        let Some(candidate) = candidate else {
            return Ok(false);
        };
        candidate.unpack(scratch_dir)?;
        Ok(true)
    }

    /// Pack, seal, and persist `data_dir` locally, then fan the upload out to every remote node.
    /// Per-node upload failures are logged, not propagated: the local archive is always the
    /// source of truth once this returns.
    pub async fn save(&self, key: &[u8], state: &dyn ValidatorState, data_dir: &Path) -> Result<(), Error> {
        if state.is_running().await {
            return Err(Error::ValidatorRunning);
        }
        archive_codec::check_validator_data_dir(data_dir)?;

        let archive = BackupArchive::pack(data_dir)?;
        let mut sealed = Vec::new();
        archive.lock(key, &mut sealed)?;
        tokio::fs::write(&self.local_backup_path, &sealed).await?;
        info!(self.log, "saved backup archive locally"; "timestamp" => archive.timestamp);

        let local_path_str = self.local_backup_path.to_string_lossy().into_owned();
        for node in &self.nodes {
            match node.client.copy_to_remote(&local_path_str, &self.remote_filename).await {
                Ok(true) => info!(self.log, "uploaded backup archive"; "node" => %node.label),
                Ok(false) => warn!(self.log, "backup archive upload was rejected"; "node" => %node.label),
                Err(err) => warn!(self.log, "backup archive upload failed"; "node" => %node.label, "error" => %err),
            }
        }
        Ok(())
    }

    fn unlock_file(&self, path: &Path, key: &[u8]) -> Result<BackupArchive, archive_codec::Error> {
        let mut file = std::fs::File::open(path)?;
        BackupArchive::unlock(key, &mut file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::fs;
    use tunnel::Error as TunnelError;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    /// Simulates a remote node's `~/supervisor-backups/<filename>` as a plain file on disk.
    struct FakeRemote {
        storage_dir: PathBuf,
    }

    #[async_trait]
    impl TunnelClient for FakeRemote {
        async fn check_host_key(&self) -> Result<bool, TunnelError> {
            Ok(true)
        }

        async fn copy_to_local(&self, remote_path: &str, local_path: &str) -> Result<bool, TunnelError> {
            let src = self.storage_dir.join(remote_path);
            if !src.exists() {
                return Ok(false);
            }
            fs::copy(&src, local_path)?;
            Ok(true)
        }

        async fn copy_to_remote(&self, local_path: &str, remote_path: &str) -> Result<bool, TunnelError> {
            let dst = self.storage_dir.join(remote_path);
            fs::create_dir_all(dst.parent().unwrap())?;
            fs::copy(local_path, dst)?;
            Ok(true)
        }
    }

    struct NotRunning;

    #[async_trait]
    impl ValidatorState for NotRunning {
        async fn is_running(&self) -> bool {
            false
        }
    }

    struct AlwaysRunning;

    #[async_trait]
    impl ValidatorState for AlwaysRunning {
        async fn is_running(&self) -> bool {
            true
        }
    }

    fn seal_at(path: &Path, data_dir: &Path, key: &[u8], timestamp: u32) {
        let mut archive = BackupArchive::pack(data_dir).unwrap();
        archive.timestamp = timestamp;
        let mut buf = Vec::new();
        archive.lock(key, &mut buf).unwrap();
        fs::write(path, buf).unwrap();
    }

    fn make_validator_data_dir(dir: &Path, marker: &str) {
        fs::write(dir.join("slashing-protection.json"), marker).unwrap();
        let pubkey = format!("0x{}", "a".repeat(96));
        let vdir = dir.join("validators").join(pubkey);
        fs::create_dir_all(&vdir).unwrap();
        fs::write(vdir.join("keystore.json"), "{}").unwrap();
        fs::write(vdir.join("password.txt"), "hunter2").unwrap();
    }

    #[tokio::test]
    async fn freshest_wins_across_local_and_remote() {
        let root = tempfile::tempdir().unwrap();
        let key = [9u8; 32];

        let local_data = root.path().join("local_data");
        fs::create_dir_all(&local_data).unwrap();
        make_validator_data_dir(&local_data, "local");
        let local_backup_path = root.path().join("backup.bin");
        seal_at(&local_backup_path, &local_data, &key, 1000);

        let remote_data = root.path().join("remote_data");
        fs::create_dir_all(&remote_data).unwrap();
        make_validator_data_dir(&remote_data, "remote");
        let remote_storage = root.path().join("remote_storage");
        fs::create_dir_all(remote_storage.join("supervisor-backups")).unwrap();
        seal_at(
            &remote_storage.join("supervisor-backups/backup.bin"),
            &remote_data,
            &key,
            2000,
        );

        let sync = BackupSync::new(
            local_backup_path.clone(),
            "backup.bin".to_string(),
            vec![RemoteNode {
                label: "node-a".to_string(),
                client: Arc::new(FakeRemote { storage_dir: remote_storage }),
            }],
            test_logger(),
        );

        let scratch = tempfile::tempdir().unwrap();
        let found = sync.load(&key, &NotRunning, scratch.path()).await.unwrap();
        assert!(found);

        let on_disk = BackupArchive::unlock(&key, &mut std::fs::File::open(&local_backup_path).unwrap()).unwrap();
        assert_eq!(on_disk.timestamp, 2000);

        let contents = fs::read_to_string(scratch.path().join("slashing-protection.json")).unwrap();
        assert_eq!(contents, "remote");

        let pubkey = format!("0x{}", "a".repeat(96));
        let vdir = scratch.path().join("validators").join(pubkey);
        assert_eq!(fs::read_to_string(vdir.join("keystore.json")).unwrap(), "{}");
        assert_eq!(fs::read_to_string(vdir.join("password.txt")).unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn load_returns_false_when_nothing_found() {
        let root = tempfile::tempdir().unwrap();
        let sync = BackupSync::new(
            root.path().join("backup.bin"),
            "backup.bin".to_string(),
            vec![],
            test_logger(),
        );
        let scratch = tempfile::tempdir().unwrap();
        assert!(!sync.load(&[0u8; 32], &NotRunning, scratch.path()).await.unwrap());
    }

    #[tokio::test]
    async fn load_and_save_reject_while_validator_running() {
        let root = tempfile::tempdir().unwrap();
        let sync = BackupSync::new(
            root.path().join("backup.bin"),
            "backup.bin".to_string(),
            vec![],
            test_logger(),
        );
        let scratch = tempfile::tempdir().unwrap();
        assert!(matches!(
            sync.load(&[0u8; 32], &AlwaysRunning, scratch.path()).await,
            Err(Error::ValidatorRunning)
        ));
        assert!(matches!(
            sync.save(&[0u8; 32], &AlwaysRunning, root.path()).await,
            Err(Error::ValidatorRunning)
        ));
    }

    #[tokio::test]
    async fn save_fails_fast_on_missing_validator_data() {
        let root = tempfile::tempdir().unwrap();
        let sync = BackupSync::new(
            root.path().join("backup.bin"),
            "backup.bin".to_string(),
            vec![],
            test_logger(),
        );
        let empty_data = tempfile::tempdir().unwrap();
        let err = sync.save(&[0u8; 32], &NotRunning, empty_data.path()).await.unwrap_err();
        assert!(matches!(err, Error::Archive(archive_codec::Error::MissingValidatorData(_))));
    }

    #[tokio::test]
    async fn save_then_upload_fans_out_to_every_remote() {
        let root = tempfile::tempdir().unwrap();
        let key = [3u8; 32];
        let data_dir = root.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();
        make_validator_data_dir(&data_dir, "hello");

        let remote_storage = root.path().join("remote_storage");
        fs::create_dir_all(&remote_storage).unwrap();
        let sync = BackupSync::new(
            root.path().join("backup.bin"),
            "backup.bin".to_string(),
            vec![RemoteNode {
                label: "node-a".to_string(),
                client: Arc::new(FakeRemote { storage_dir: remote_storage.clone() }),
            }],
            test_logger(),
        );

        sync.save(&key, &NotRunning, &data_dir).await.unwrap();

        let uploaded = remote_storage.join("supervisor-backups/backup.bin");
        assert!(uploaded.exists());
        let archive = BackupArchive::unlock(&key, &mut std::fs::File::open(&uploaded).unwrap()).unwrap();
        assert!(!archive.payload.is_empty());
    }
}
