//! Wires components A–G together: the key vault, the tunnels, the RPC server, the validator
//! orchestrator and its backup sync, and the daemon's global exit signal.

use async_trait::async_trait;
use backup_sync::{BackupSync, RemoteNode};
use key_vault::RootKey;
use rpc::{RpcServer, RpcTarget};
use serde_json::{json, Value};
use slog::{info, o, warn, Logger};
use std::sync::{Arc, Weak};
use std::time::Duration;
use subprocess_supervisor::{start_supervised, start_supervised_multi, SupervisedProcess};
use tokio::sync::{watch, Mutex, Notify};
use tunnel::{PortForward, Socket, SshClient, SshConnInfo, SshTunnel};
use validator_orchestrator::{
    BeaconNodePortMap, ContainerLauncher, DockerLauncher, HealthChecker, HttpBeaconHealth, Orchestrator,
    ValidatorRelease, ValidatorReleaseConfig,
};

use crate::config::{DynamicConfig, StaticConfig};
use crate::log_shipper::LogShipperChild;
use crate::Error;

const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Well-known ports the beacon-node software listens on, on the remote side of the tunnel.
const REMOTE_LIGHTHOUSE_HTTP_PORT: u16 = 5052;
const REMOTE_PRYSM_HTTP_PORT: u16 = 3500;
const REMOTE_PRYSM_GRPC_PORT: u16 = 4000;

struct RunningChild {
    stop_tx: async_channel::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl RunningChild {
    async fn stop(self) {
        self.stop_tx.close();
        let _ = self.handle.await;
    }
}

/// A batch of children started together via [`start_supervised_multi`], sharing one stop
/// signal so the whole group tears down together.
struct RunningChildGroup {
    stop_tx: async_channel::Sender<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl RunningChildGroup {
    async fn stop(self) {
        self.stop_tx.close();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// `backup_sync::ValidatorState` adapter so `backup_sync` never has to depend on
/// `validator_orchestrator`.
struct OrchestratorState(Arc<Orchestrator>);

#[async_trait]
impl backup_sync::ValidatorState for OrchestratorState {
    async fn is_running(&self) -> bool {
        self.0.is_running().await
    }
}

/// Forwards `RpcTarget` calls to the coordinator, via a `Weak` reference so `RpcServer` (built
/// during `Coordinator::new`) does not have to own a handle to the not-yet-complete `Coordinator`.
struct CoordinatorRpcTarget(Weak<Coordinator>);

#[async_trait]
impl RpcTarget for CoordinatorRpcTarget {
    async fn get_health(&self) -> Value {
        match self.0.upgrade() {
            Some(c) => c.get_health().await,
            None => json!({"unlocked": false, "validator_running": false}),
        }
    }

    async fn start_validator(&self) -> bool {
        match self.0.upgrade() {
            Some(c) => c.start_validator().await.unwrap_or(false),
            None => false,
        }
    }

    async fn stop_validator(&self) -> bool {
        match self.0.upgrade() {
            Some(c) => c.stop_validator().await.unwrap_or(false),
            None => false,
        }
    }

    async fn connect_eth2_node(&self, host: String, port: Option<u16>) -> Result<(), String> {
        let Some(c) = self.0.upgrade() else {
            return Err("daemon is shutting down".to_string());
        };
        c.connect_eth2_node(host, port).await.map_err(|err| err.to_string())
    }

    async fn set_validator_release(&self, release: ValidatorReleaseConfig) -> Result<(), String> {
        let Some(c) = self.0.upgrade() else {
            return Err("daemon is shutting down".to_string());
        };
        c.set_validator_release(release).await.map_err(|err| err.to_string())
    }

    async fn unlock(&self, password: String) -> bool {
        match self.0.upgrade() {
            Some(c) => c.unlock(password).await,
            None => false,
        }
    }

    async fn shutdown(&self) {
        if let Some(c) = self.0.upgrade() {
            c.request_shutdown();
        }
    }
}

pub struct Coordinator {
    static_config: StaticConfig,
    dynamic_config_path: std::path::PathBuf,
    root_key: Mutex<Option<RootKey>>,
    unlocked: Notify,
    orchestrator: Arc<Orchestrator>,
    backup_sync: BackupSync,
    scratch_dir: tempfile::TempDir,
    rpc_server: RpcServer,
    tunnel_specs: Mutex<Vec<(String, SshTunnel)>>,
    tunnels: Mutex<Option<RunningChildGroup>>,
    log_shippers: Mutex<Vec<RunningChild>>,
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,
    log: Logger,
}

impl Coordinator {
    pub fn new(static_config: StaticConfig, log: Logger) -> Result<Arc<Self>, Error> {
        std::fs::create_dir_all(&static_config.data_dir)?;
        std::fs::create_dir_all(&static_config.logs_dir)?;
        let scratch_dir = tempfile::tempdir()?;

        let root_key = if static_config.key_cache_path().exists() {
            Some(RootKey::read_from_file(&static_config.key_cache_path())?)
        } else {
            None
        };

        let mut ports = crate::ports::PortAllocator::new(static_config.port_range.0, static_config.port_range.1);
        let known_hosts_lock = Arc::new(Mutex::new(()));
        let mut port_maps = Vec::new();
        let mut tunnel_specs = Vec::new();
        let mut remote_nodes = Vec::new();

        for node in &static_config.nodes {
            let port_map = BeaconNodePortMap {
                host_id: (node.host.clone(), node.port),
                lighthouse_rpc: ports.allocate()?,
                prysm_http: ports.allocate()?,
                prysm_grpc: ports.allocate()?,
            };
            let rpc_reverse_port = ports.allocate()?;

            let conn_info = SshConnInfo {
                host: node.host.clone(),
                user: node.user.clone(),
                port: node.port,
                pubkey: node.pubkey.clone(),
                identity_file: node.identity_file.clone(),
            };
            let client = Arc::new(SshClient::new(
                conn_info,
                static_config.known_hosts_path(),
                known_hosts_lock.clone(),
                log.new(o!("node" => node.host.clone())),
            ));

            let forwards = vec![
                PortForward {
                    local: Socket::localhost(port_map.lighthouse_rpc),
                    remote: Socket::Tcp {
                        host: "localhost".to_string(),
                        port: REMOTE_LIGHTHOUSE_HTTP_PORT,
                    },
                    reverse: false,
                },
                PortForward {
                    local: Socket::localhost(port_map.prysm_http),
                    remote: Socket::Tcp {
                        host: "localhost".to_string(),
                        port: REMOTE_PRYSM_HTTP_PORT,
                    },
                    reverse: false,
                },
                PortForward {
                    local: Socket::localhost(port_map.prysm_grpc),
                    remote: Socket::Tcp {
                        host: "localhost".to_string(),
                        port: REMOTE_PRYSM_GRPC_PORT,
                    },
                    reverse: false,
                },
                PortForward {
                    local: Socket::Unix {
                        path: static_config.rpc_sock_path(),
                    },
                    remote: Socket::Tcp {
                        host: "localhost".to_string(),
                        port: rpc_reverse_port,
                    },
                    reverse: true,
                },
            ];

            remote_nodes.push(RemoteNode {
                label: node.host.clone(),
                client: client.clone() as Arc<dyn tunnel::TunnelClient>,
            });
            tunnel_specs.push((
                node.host.clone(),
                SshTunnel::new(client, forwards, log.new(o!("component" => "tunnel", "node" => node.host.clone()))),
            ));
            port_maps.push(port_map);
        }

        let dynamic_config_path = static_config.dynamic_config_path();
        let dynamic_config = DynamicConfig::load_or_default(&dynamic_config_path)?;
        let release = ValidatorRelease::from_config(dynamic_config.validator_release)?;

        let launcher: Arc<dyn ContainerLauncher> = Arc::new(DockerLauncher::new(
            static_config.data_dir.join("images"),
            log.new(o!("component" => "launcher")),
        ));
        let health: Arc<dyn HealthChecker> = Arc::new(HttpBeaconHealth::new());

        let orchestrator = Arc::new(Orchestrator::new(
            port_maps,
            release,
            launcher,
            health,
            static_config.eth2_network.clone(),
            static_config.fee_recipient.clone(),
            scratch_dir.path().to_path_buf(),
            "validator-supervisor-validator".to_string(),
            RETRY_DELAY,
            log.new(o!("component" => "orchestrator")),
        ));

        let backup_sync = BackupSync::new(
            static_config.backup_path(),
            static_config.backup_filename.clone(),
            remote_nodes,
            log.new(o!("component" => "backup_sync")),
        );

        let (exit_tx, exit_rx) = watch::channel(false);

        let coordinator = Arc::new_cyclic(|weak| {
            let rpc_server = RpcServer::new(
                Arc::new(CoordinatorRpcTarget(weak.clone())),
                static_config.rpc_users.clone(),
                static_config.rpc_sock_path(),
                log.new(o!("component" => "rpc")),
            );
            Self {
                static_config,
                dynamic_config_path,
                root_key: Mutex::new(root_key),
                unlocked: Notify::new(),
                orchestrator,
                backup_sync,
                scratch_dir,
                rpc_server,
                tunnel_specs: Mutex::new(tunnel_specs),
                tunnels: Mutex::new(None),
                log_shippers: Mutex::new(Vec::new()),
                exit_tx,
                exit_rx,
                log,
            }
        });

        Ok(coordinator)
    }

    /// Startup order from spec.md §4.H: tunnels, RPC server, then an attempt at
    /// `start_validator` that waits for an `unlock` RPC call if the root key isn't cached.
    /// Blocks until the global exit event fires, then runs shutdown in reverse order.
    pub async fn run(self: &Arc<Self>) -> Result<(), Error> {
        self.start_tunnels().await?;
        self.start_log_shippers().await?;
        self.rpc_server.start().await?;

        tokio::select! {
            _ = self.start_validator_waiting_for_unlock() => {}
            _ = self.wait_for_exit() => {}
        }

        self.wait_for_exit().await;
        self.shutdown().await
    }

    /// Starts every configured tunnel concurrently via [`start_supervised_multi`], so startup
    /// latency is bounded by the slowest SSH connect rather than their sum.
    async fn start_tunnels(self: &Arc<Self>) -> Result<(), Error> {
        let specs = std::mem::take(&mut *self.tunnel_specs.lock().await);
        let children = specs
            .into_iter()
            .map(|(host, spec)| {
                let child: Arc<dyn subprocess_supervisor::SupervisedChild> =
                    SupervisedProcess::new("tunnel", spec, self.log.new(o!("node" => host.clone())));
                (host, child)
            })
            .collect();

        let (stop_tx, stop_rx) = async_channel::bounded(1);
        let handles = start_supervised_multi(children, RETRY_DELAY, stop_rx, self.log.clone())
            .await
            .map_err(Error::Supervisor)?;
        *self.tunnels.lock().await = Some(RunningChildGroup { stop_tx, handles });
        Ok(())
    }

    async fn start_log_shippers(self: &Arc<Self>) -> Result<(), Error> {
        let Some(cfg) = &self.static_config.log_shipper else {
            return Ok(());
        };
        let mut log_shippers = self.log_shippers.lock().await;
        for node in &self.static_config.nodes {
            let mut env = cfg.env.clone();
            env.insert("NODE_HOST".to_string(), node.host.clone());
            env.insert("NODE_PORT".to_string(), node.port.to_string());
            let spec = LogShipperChild {
                command: cfg.command.clone(),
                args: cfg.args.clone(),
                env,
            };
            let child = SupervisedProcess::new(
                "log-shipper",
                spec,
                self.log.new(o!("component" => "log-shipper", "node" => node.host.clone())),
            );
            let (stop_tx, stop_rx) = async_channel::bounded(1);
            let handle = start_supervised("log-shipper", child, RETRY_DELAY, stop_rx, self.log.clone())
                .await
                .map_err(Error::Supervisor)?;
            log_shippers.push(RunningChild { stop_tx, handle });
        }
        Ok(())
    }

    async fn start_validator_waiting_for_unlock(self: &Arc<Self>) {
        loop {
            if self.root_key.lock().await.is_some() {
                match self.start_validator().await {
                    Ok(true) => info!(self.log, "validator started"),
                    Ok(false) => warn!(self.log, "validator start deferred: no backup archive found yet"),
                    Err(err) => warn!(self.log, "validator failed to start"; "error" => %err),
                }
                return;
            }
            info!(self.log, "waiting for unlock RPC call before starting validator");
            self.unlocked.notified().await;
        }
    }

    async fn wait_for_exit(&self) {
        let mut rx = self.exit_rx.clone();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    /// Shutdown order from spec.md §4.H: RPC, validator (which saves a backup), a brief grace
    /// period for the log shipper to flush, log shippers, then tunnels.
    async fn shutdown(&self) -> Result<(), Error> {
        info!(self.log, "shutting down");
        self.rpc_server.stop().await;
        let _ = self.stop_validator().await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        let log_shippers = std::mem::take(&mut *self.log_shippers.lock().await);
        for shipper in log_shippers {
            shipper.stop().await;
        }

        if let Some(tunnels) = self.tunnels.lock().await.take() {
            tunnels.stop().await;
        }
        Ok(())
    }

    pub fn request_shutdown(&self) {
        let _ = self.exit_tx.send(true);
    }

    async fn get_health(&self) -> Value {
        json!({
            "unlocked": self.root_key.lock().await.is_some(),
            "validator_running": self.orchestrator.is_running().await,
            "connected_node": self.orchestrator.connected_node_host().await,
            "validator_release": self.orchestrator.current_release().await.to_config(),
        })
    }

    async fn start_validator(&self) -> Result<bool, Error> {
        let key = {
            let guard = self.root_key.lock().await;
            let root_key = guard.as_ref().ok_or(Error::UnlockRequired)?;
            root_key.derive_backup_key()
        };

        let state = OrchestratorState(self.orchestrator.clone());
        let found = self.backup_sync.load(&key, &state, self.scratch_dir.path()).await?;
        if !found {
            return Ok(false);
        }
        Ok(self.orchestrator.start_validator().await?)
    }

    async fn stop_validator(&self) -> Result<bool, Error> {
        let was_running = self.orchestrator.stop_validator().await?;
        if was_running {
            if let Some(key) = self.root_key.lock().await.as_ref().map(RootKey::derive_backup_key) {
                let state = OrchestratorState(self.orchestrator.clone());
                if let Err(err) = self.backup_sync.save(&key, &state, self.scratch_dir.path()).await {
                    warn!(self.log, "backup save after validator stop failed"; "error" => %err);
                }
            }
        }
        Ok(was_running)
    }

    async fn connect_eth2_node(&self, host: String, port: Option<u16>) -> Result<(), Error> {
        let port = port.ok_or_else(|| Error::InvalidConfig("connect requires a port".to_string()))?;
        Ok(self.orchestrator.connect_eth2_node(&host, port).await?)
    }

    async fn set_validator_release(&self, release: ValidatorReleaseConfig) -> Result<(), Error> {
        let parsed = ValidatorRelease::from_config(release)?;
        self.orchestrator.set_validator_release(parsed.clone()).await?;

        let dynamic_config = DynamicConfig {
            version: 1,
            validator_release: parsed.to_config(),
        };
        dynamic_config.persist(&self.dynamic_config_path)?;
        Ok(())
    }

    async fn unlock(&self, password: String) -> bool {
        let Some(descriptor) = &self.static_config.key_descriptor else {
            warn!(self.log, "unlock requested but no key_descriptor is configured");
            return false;
        };
        let Ok(root_key) = descriptor.open(&password) else {
            return false;
        };
        if let Err(err) = root_key.write_to_file(&self.static_config.key_cache_path()) {
            warn!(self.log, "failed to cache root key to disk"; "error" => %err);
        }
        *self.root_key.lock().await = Some(root_key);
        self.unlocked.notify_waiters();
        true
    }
}
