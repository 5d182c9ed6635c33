//! The log-shipper child is treated as opaque: the supervisor only needs to launch it with an
//! environment and restart it on exit, per spec.md §1's "out of core" boundary.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use subprocess_supervisor::ChildSpec;
use tokio::process::Child;

pub struct LogShipperChild {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[async_trait]
impl ChildSpec for LogShipperChild {
    async fn launch(&self) -> std::io::Result<Option<Child>> {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(Some(cmd.spawn()?))
    }
}
