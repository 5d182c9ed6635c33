use async_trait::async_trait;
use slog::{info, o, warn, Logger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subprocess_supervisor::{start_supervised, ChildSpec, HealthCheck, SupervisedChild, SupervisedProcess};
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::health::HealthChecker;
use crate::launcher::{ContainerLauncher, LaunchOpts};
use crate::port_map::BeaconNodePortMap;
use crate::release::ValidatorRelease;
use crate::Error;

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_PROBE_RETRIES: u32 = 2;

/// The running validator's currently-bound beacon node, shared between [`ValidatorChild::launch`]
/// and its [`HealthCheck`] probe.
type Selected = Arc<Mutex<Option<(String, u16)>>>;

/// A [`ChildSpec`] that, on each launch, re-runs beacon-node selection over the orchestrator's
/// current port-map order and launches the validator container bound to the first healthy node.
struct ValidatorChild {
    port_maps: Arc<Mutex<Vec<BeaconNodePortMap>>>,
    release: Arc<Mutex<ValidatorRelease>>,
    launcher: Arc<dyn ContainerLauncher>,
    health: Arc<dyn HealthChecker>,
    eth2_network: String,
    fee_recipient: String,
    datadir: PathBuf,
    container_name: String,
    selected: Selected,
    log: Logger,
}

#[async_trait]
impl ChildSpec for ValidatorChild {
    async fn launch(&self) -> std::io::Result<Option<Child>> {
        let maps = self.port_maps.lock().await.clone();
        let release = self.release.lock().await.clone();

        let mut chosen = None;
        for port_map in &maps {
            let port = release.beacon_api_port(port_map);
            if self.health.is_healthy("localhost", port).await {
                chosen = Some((port_map.host_id.clone(), port));
                break;
            }
        }

        let Some((host_id, port)) = chosen else {
            warn!(self.log, "no healthy beacon node; deferring validator launch");
            return Ok(None);
        };
        *self.selected.lock().await = Some((host_id.0.clone(), port));

        let image_id = self
            .launcher
            .build_image(&release)
            .await
            .map_err(std::io::Error::other)?;

        info!(self.log, "launching validator"; "node" => %host_id.0, "port" => port);
        self.launcher
            .launch(
                &image_id,
                LaunchOpts {
                    eth2_network: self.eth2_network.clone(),
                    fee_recipient: self.fee_recipient.clone(),
                    datadir: self.datadir.clone(),
                    container_name: self.container_name.clone(),
                    beacon_host: host_id.0,
                    beacon_port: port,
                },
            )
            .await
    }

    async fn cleanup(&self, _stopped: bool) {
        *self.selected.lock().await = None;
    }

    fn health_check(&self) -> Option<Arc<dyn HealthCheck>> {
        Some(Arc::new(ValidatorHealthProbe {
            selected: self.selected.clone(),
            health: self.health.clone(),
        }))
    }
}

struct ValidatorHealthProbe {
    selected: Selected,
    health: Arc<dyn HealthChecker>,
}

#[async_trait]
impl HealthCheck for ValidatorHealthProbe {
    async fn is_ok(&self) -> bool {
        match self.selected.lock().await.clone() {
            Some((host, port)) => self.health.is_healthy(&host, port).await,
            None => true,
        }
    }

    fn interval(&self) -> Duration {
        HEALTH_PROBE_INTERVAL
    }

    fn retries(&self) -> u32 {
        HEALTH_PROBE_RETRIES
    }
}

struct RunningValidator {
    child: Arc<SupervisedProcess<ValidatorChild>>,
    stop_tx: async_channel::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

/// Owns the beacon-node port maps and the currently-running validator child.
///
/// Beacon-node selection, health probing, prioritization, and release swaps all live here; see
/// the method docs below for the exact contract each implements.
pub struct Orchestrator {
    port_maps: Arc<Mutex<Vec<BeaconNodePortMap>>>,
    release: Arc<Mutex<ValidatorRelease>>,
    launcher: Arc<dyn ContainerLauncher>,
    health: Arc<dyn HealthChecker>,
    eth2_network: String,
    fee_recipient: String,
    datadir: PathBuf,
    container_name: String,
    retry_delay: Duration,
    running: Mutex<Option<RunningValidator>>,
    log: Logger,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        port_maps: Vec<BeaconNodePortMap>,
        release: ValidatorRelease,
        launcher: Arc<dyn ContainerLauncher>,
        health: Arc<dyn HealthChecker>,
        eth2_network: String,
        fee_recipient: String,
        datadir: PathBuf,
        container_name: String,
        retry_delay: Duration,
        log: Logger,
    ) -> Self {
        Self {
            port_maps: Arc::new(Mutex::new(port_maps)),
            release: Arc::new(Mutex::new(release)),
            launcher,
            health,
            eth2_network,
            fee_recipient,
            datadir,
            container_name,
            retry_delay,
            running: Mutex::new(None),
            log,
        }
    }

    pub async fn current_release(&self) -> ValidatorRelease {
        self.release.lock().await.clone()
    }

    pub async fn port_maps(&self) -> Vec<BeaconNodePortMap> {
        self.port_maps.lock().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start the validator subprocess if not already running. Returns `false` if already
    /// running, matching `start_validator`'s idempotent contract.
    pub async fn start_validator(&self) -> Result<bool, Error> {
        if self.is_running().await {
            return Ok(false);
        }

        let child_spec = ValidatorChild {
            port_maps: self.port_maps.clone(),
            release: self.release.clone(),
            launcher: self.launcher.clone(),
            health: self.health.clone(),
            eth2_network: self.eth2_network.clone(),
            fee_recipient: self.fee_recipient.clone(),
            datadir: self.datadir.clone(),
            container_name: self.container_name.clone(),
            selected: Arc::new(Mutex::new(None)),
            log: self.log.new(o!("component" => "validator")),
        };
        let child = SupervisedProcess::new("validator", child_spec, self.log.clone());
        let (stop_tx, stop_rx) = async_channel::bounded(1);
        let dyn_child: Arc<dyn SupervisedChild> = child.clone();
        let handle = start_supervised(
            "validator",
            dyn_child,
            self.retry_delay,
            stop_rx,
            self.log.clone(),
        )
        .await
        .map_err(Error::Supervisor)?;

        *self.running.lock().await = Some(RunningValidator {
            child,
            stop_tx,
            handle,
        });
        Ok(true)
    }

    /// Stop the validator subprocess if running, waiting for its supervision task to exit.
    /// Returns `false` if it was not running.
    pub async fn stop_validator(&self) -> Result<bool, Error> {
        let running = self.running.lock().await.take();
        let Some(running) = running else {
            return Ok(false);
        };
        running.stop_tx.close();
        let _ = running.handle.await;
        Ok(true)
    }

    /// Move the matching port map to the front of the order and, if the validator is running,
    /// signal it to stop so the next restart re-runs selection.
    ///
    /// `UnknownNode` is raised, and the order left unchanged, if no configured port map matches.
    pub async fn connect_eth2_node(&self, host: &str, port: u16) -> Result<(), Error> {
        let mut maps = self.port_maps.lock().await;
        let index = maps
            .iter()
            .position(|pm| pm.host_id == (host.to_string(), port))
            .ok_or_else(|| Error::UnknownNode(format!("{host}:{port}")))?;
        let port_map = maps.remove(index);
        maps.insert(0, port_map);
        drop(maps);

        if let Some(running) = self.running.lock().await.as_ref() {
            running.child.stop();
        }
        Ok(())
    }

    /// Swap the validator release, refusing while the validator is running. Verifies the new
    /// release's image builds before committing the in-memory swap; persisting it to the
    /// dynamic config file is the caller's responsibility.
    pub async fn set_validator_release(&self, release: ValidatorRelease) -> Result<(), Error> {
        if self.is_running().await {
            return Err(Error::ValidatorRunning);
        }
        self.launcher.build_image(&release).await?;
        *self.release.lock().await = release;
        Ok(())
    }

    /// The host currently bound as the validator's beacon node, if running and selected.
    pub async fn connected_node_host(&self) -> Option<String> {
        let running = self.running.lock().await;
        let selected = running.as_ref()?.child.spec().selected.clone();
        drop(running);
        let host = selected.lock().await.clone().map(|(host, _)| host);
        host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::process::Stdio;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    struct FakeHealth {
        healthy: Mutex<HashMap<u16, bool>>,
    }

    impl FakeHealth {
        fn new(healthy_ports: &[u16]) -> Arc<Self> {
            Arc::new(Self {
                healthy: Mutex::new(healthy_ports.iter().map(|p| (*p, true)).collect()),
            })
        }

        async fn set(&self, port: u16, healthy: bool) {
            self.healthy.lock().await.insert(port, healthy);
        }
    }

    #[async_trait]
    impl HealthChecker for FakeHealth {
        async fn is_healthy(&self, _host: &str, port: u16) -> bool {
            self.healthy.lock().await.get(&port).copied().unwrap_or(false)
        }
    }

    struct FakeLauncher;

    #[async_trait]
    impl ContainerLauncher for FakeLauncher {
        async fn build_image(&self, _release: &ValidatorRelease) -> Result<String, Error> {
            Ok("fake-image".to_string())
        }

        async fn launch(&self, _image_id: &str, _opts: LaunchOpts) -> std::io::Result<Option<Child>> {
            let child = tokio::process::Command::new("sleep")
                .arg("60")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()?;
            Ok(Some(child))
        }
    }

    fn port_maps() -> Vec<BeaconNodePortMap> {
        vec![
            BeaconNodePortMap {
                host_id: ("localhost".to_string(), 2222),
                lighthouse_rpc: 2222,
                prysm_http: 0,
                prysm_grpc: 0,
            },
            BeaconNodePortMap {
                host_id: ("localhost".to_string(), 2223),
                lighthouse_rpc: 2223,
                prysm_http: 0,
                prysm_grpc: 0,
            },
        ]
    }

    fn test_orchestrator(health: Arc<FakeHealth>) -> Orchestrator {
        Orchestrator::new(
            port_maps(),
            ValidatorRelease::default_release(),
            Arc::new(FakeLauncher),
            health,
            "mainnet".to_string(),
            "0x0000000000000000000000000000000000000000".to_string(),
            std::env::temp_dir(),
            "test-validator".to_string(),
            Duration::from_millis(50),
            test_logger(),
        )
    }

    #[tokio::test]
    async fn prioritize_then_restart_rebinds_to_newly_healthy_node() {
        let health = FakeHealth::new(&[2222]);
        let orch = test_orchestrator(health.clone());

        assert!(orch.start_validator().await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orch.connected_node_host().await, Some("localhost".to_string()));

        health.set(2223, true).await;
        orch.connect_eth2_node("localhost", 2223).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(orch.is_running().await);
        let maps = orch.port_maps().await;
        assert_eq!(maps[0].host_id, ("localhost".to_string(), 2223));

        orch.stop_validator().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_node_is_rejected_and_order_unchanged() {
        let health = FakeHealth::new(&[2222]);
        let orch = test_orchestrator(health);

        let before = orch.port_maps().await;
        let err = orch.connect_eth2_node("localhost", 2224).await.unwrap_err();
        assert!(matches!(err, Error::UnknownNode(_)));
        assert_eq!(orch.port_maps().await, before);
    }
}
