use async_trait::async_trait;
use slog::{debug, Logger};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Child;

use crate::release::ValidatorRelease;
use crate::Error;

/// Where the validator container should connect for its beacon node and how it should identify
/// itself.
pub struct LaunchOpts {
    pub eth2_network: String,
    pub fee_recipient: String,
    pub datadir: PathBuf,
    pub container_name: String,
    pub beacon_host: String,
    pub beacon_port: u16,
}

/// Builds and launches validator client containers. Separated from [`ValidatorRelease`] so
/// tests can substitute a launcher that never touches the `docker` CLI.
#[async_trait]
pub trait ContainerLauncher: Send + Sync {
    async fn build_image(&self, release: &ValidatorRelease) -> Result<String, Error>;
    async fn launch(&self, image_id: &str, opts: LaunchOpts) -> std::io::Result<Option<Child>>;
}

/// Builds images from `images_dir/<impl_name>` and runs them via the host's `docker` binary,
/// mirroring the reference implementation's `build_docker_image` helper and per-release `docker
/// run` invocations.
pub struct DockerLauncher {
    pub images_dir: PathBuf,
    pub log: Logger,
}

impl DockerLauncher {
    pub fn new(images_dir: PathBuf, log: Logger) -> Self {
        Self { images_dir, log }
    }
}

#[async_trait]
impl ContainerLauncher for DockerLauncher {
    async fn build_image(&self, release: &ValidatorRelease) -> Result<String, Error> {
        if !release.is_supported() {
            return Err(Error::BadValidatorRelease(format!(
                "{} support is incomplete",
                release.impl_name()
            )));
        }

        let mut build_args = BTreeMap::new();
        build_args.insert("VERSION".to_string(), release.version().to_string());
        build_args.insert("CHECKSUM".to_string(), release.checksum().to_string());

        build_docker_image(
            release.impl_name(),
            release.version(),
            &build_args,
            &self.images_dir,
            &self.log,
        )
        .await
    }

    async fn launch(&self, image_id: &str, opts: LaunchOpts) -> std::io::Result<Option<Child>> {
        let beacon_nodes = format!("http://localhost:{}", opts.beacon_port);
        let child = tokio::process::Command::new("docker")
            .arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(&opts.container_name)
            .arg("-e")
            .arg(format!("ETH2_NETWORK={}", opts.eth2_network))
            .arg("-e")
            .arg(format!("FEE_RECIPIENT={}", opts.fee_recipient))
            .arg("-e")
            .arg(format!("BEACON_NODES={beacon_nodes}"))
            .arg("--volume")
            .arg(format!("{}:/app/canonical", opts.datadir.display()))
            .arg("--tmpfs")
            .arg("/app/lighthouse")
            .arg(image_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(Some(child))
    }
}

/// Build a Docker image from `images_dir/<image_name>`, tagged `validator-supervisor/<image_name>:<version>`.
pub async fn build_docker_image(
    image_name: &str,
    version: &str,
    build_args: &BTreeMap<String, String>,
    images_dir: &Path,
    log: &Logger,
) -> Result<String, Error> {
    let image_tag = format!("validator-supervisor/{image_name}:{version}");
    let context_dir = images_dir.join(image_name);
    debug!(log, "building docker image"; "tag" => &image_tag);

    let mut cmd = tokio::process::Command::new("docker");
    cmd.arg("build").arg("--pull");
    for (key, val) in build_args {
        cmd.arg("--build-arg").arg(format!("{key}={val}"));
    }
    cmd.arg("-t").arg(&image_tag).arg(&context_dir).arg("--quiet");

    let output = cmd.output().await.map_err(Error::Io)?;
    if !output.status.success() {
        return Err(Error::DockerBuild {
            image_name: image_name.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let image_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(log, "built docker image"; "tag" => &image_tag, "id" => &image_id);
    Ok(image_id)
}
