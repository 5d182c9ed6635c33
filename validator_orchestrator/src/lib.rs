//! Owns beacon-node selection, health probing, and the supervised validator client container.
//!
//! See [`orchestrator::Orchestrator`] for the component's public surface.

mod health;
mod launcher;
mod orchestrator;
mod port_map;
mod release;

pub use health::{HealthChecker, HttpBeaconHealth};
pub use launcher::{build_docker_image, ContainerLauncher, DockerLauncher, LaunchOpts};
pub use orchestrator::Orchestrator;
pub use port_map::BeaconNodePortMap;
pub use release::{ValidatorRelease, ValidatorReleaseConfig};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no configured beacon node matches {0}")]
    UnknownNode(String),
    #[error("validator is currently running")]
    ValidatorRunning,
    #[error("invalid validator release: {0}")]
    BadValidatorRelease(String),
    #[error("docker build for {image_name} failed ({status}): {stderr}")]
    DockerBuild {
        image_name: String,
        status: String,
        stderr: String,
    },
    #[error(transparent)]
    Supervisor(#[from] subprocess_supervisor::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
