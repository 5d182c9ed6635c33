use async_trait::async_trait;
use std::time::Duration;

/// Liveness probe abstraction for a beacon node, separated from [`crate::Orchestrator`] so tests
/// can substitute a fake rather than requiring a live beacon node.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn is_healthy(&self, host: &str, port: u16) -> bool;
}

/// Queries a beacon node's standard Eth2 HTTP API.
pub struct HttpBeaconHealth {
    client: reqwest::Client,
}

impl HttpBeaconHealth {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builds with a fixed timeout"),
        }
    }
}

impl Default for HttpBeaconHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthChecker for HttpBeaconHealth {
    async fn is_healthy(&self, host: &str, port: u16) -> bool {
        let url = format!("http://{host}:{port}/eth/v1/node/syncing");
        let Ok(resp) = self.client.get(url).send().await else {
            return false;
        };
        if resp.status() != reqwest::StatusCode::OK {
            return false;
        }
        let Ok(body) = resp.json::<serde_json::Value>().await else {
            return false;
        };
        body.get("data")
            .and_then(|d| d.get("is_syncing"))
            .and_then(serde_json::Value::as_bool)
            == Some(false)
    }
}
