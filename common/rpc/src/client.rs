use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use validator_orchestrator::ValidatorReleaseConfig;

use crate::auth::auth_response;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, BEGIN_UNLOCK_RESULT};
use crate::Error;

/// A JSON-RPC client for an [`crate::RpcServer`], opening a fresh authenticated connection per
/// call. See [`RpcClientConnection`] to issue several calls over one connection.
pub struct RpcClient {
    user: String,
    auth_key: String,
    sock_path: PathBuf,
}

impl RpcClient {
    pub fn new(user: impl Into<String>, auth_key: impl Into<String>, sock_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            auth_key: auth_key.into(),
            sock_path: sock_path.into(),
        }
    }

    pub async fn connect(&self) -> Result<RpcClientConnection, Error> {
        let stream = UnixStream::connect(&self.sock_path).await?;
        Ok(RpcClientConnection::new(stream))
    }

    pub async fn connect_and_auth(&self) -> Result<RpcClientConnection, Error> {
        let mut conn = self.connect().await?;
        conn.auth(&self.user, &self.auth_key).await?;
        Ok(conn)
    }

    pub async fn get_health(&self) -> Result<Value, Error> {
        self.connect_and_auth().await?.get_health().await
    }

    pub async fn start_validator(&self) -> Result<bool, Error> {
        self.connect_and_auth().await?.start_validator().await
    }

    pub async fn stop_validator(&self) -> Result<bool, Error> {
        self.connect_and_auth().await?.stop_validator().await
    }

    pub async fn connect_eth2_node(&self, host: String, port: Option<u16>) -> Result<(), Error> {
        self.connect_and_auth().await?.connect_eth2_node(host, port).await
    }

    pub async fn set_validator_release(&self, release: ValidatorReleaseConfig) -> Result<(), Error> {
        self.connect_and_auth().await?.set_validator_release(release).await
    }

    pub async fn unlock(&self, password: String) -> Result<bool, Error> {
        self.connect_and_auth().await?.unlock_checked(password).await
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        self.connect_and_auth().await?.shutdown_checked().await
    }
}

/// One authenticated connection over which several RPC calls can be made.
pub struct RpcClientConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RpcClientConnection {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn auth(&mut self, user: &str, auth_key: &str) -> Result<(), Error> {
        let challenge = self.rpc_call("get_auth_challenge", Value::Array(vec![])).await?;
        let challenge = challenge
            .as_str()
            .ok_or_else(|| Error::BadRpcResponse("expected string".to_string()))?;
        let token = auth_response(auth_key, challenge);
        self.rpc_call("auth", json!([user, token])).await?;
        Ok(())
    }

    pub async fn get_health(&mut self) -> Result<Value, Error> {
        let result = self.rpc_call("get_health", Value::Array(vec![])).await?;
        if !result.is_object() {
            return Err(Error::BadRpcResponse("expected object".to_string()));
        }
        Ok(result)
    }

    pub async fn start_validator(&mut self) -> Result<bool, Error> {
        let result = self.rpc_call("start_validator", Value::Array(vec![])).await?;
        result.as_bool().ok_or_else(|| Error::BadRpcResponse("expected bool".to_string()))
    }

    pub async fn stop_validator(&mut self) -> Result<bool, Error> {
        let result = self.rpc_call("stop_validator", Value::Array(vec![])).await?;
        result.as_bool().ok_or_else(|| Error::BadRpcResponse("expected bool".to_string()))
    }

    pub async fn connect_eth2_node(&mut self, host: String, port: Option<u16>) -> Result<(), Error> {
        let params = match port {
            Some(port) => json!([host, port]),
            None => json!([host]),
        };
        self.rpc_call("connect", params).await?;
        Ok(())
    }

    pub async fn set_validator_release(&mut self, release: ValidatorReleaseConfig) -> Result<(), Error> {
        self.rpc_call(
            "set_validator_release",
            serde_json::to_value(release).expect("ValidatorReleaseConfig serializes"),
        )
        .await?;
        Ok(())
    }

    /// Submit a password via the side-channel protocol: `begin_unlock`, a raw line carrying the
    /// password, then `check_unlock`.
    pub async fn unlock_checked(&mut self, password: String) -> Result<bool, Error> {
        if password.contains('\n') {
            return Err(Error::BadRpcResponse("password cannot contain newlines".to_string()));
        }

        let begin_result = self.rpc_call("begin_unlock", Value::Array(vec![])).await?;
        if begin_result.as_str() != Some(BEGIN_UNLOCK_RESULT) {
            return Err(Error::BadRpcResponse(format!("expected {BEGIN_UNLOCK_RESULT}")));
        }

        self.writer.write_all(password.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let result = self.rpc_call("check_unlock", Value::Array(vec![])).await?;
        result.as_bool().ok_or_else(|| Error::BadRpcResponse("expected bool".to_string()))
    }

    pub async fn shutdown_checked(&mut self) -> Result<(), Error> {
        self.rpc_call("shutdown", Value::Array(vec![])).await?;
        Ok(())
    }

    async fn rpc_call(&mut self, method: &str, params: Value) -> Result<Value, Error> {
        let request = JsonRpcRequest::new(method, params);
        let mut line = request.to_json().to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let mut response_line = String::new();
        self.reader.read_line(&mut response_line).await?;

        let msg: Value = serde_json::from_str(&response_line)
            .map_err(|_| Error::BadRpcResponse("malformed JSON response".to_string()))?;
        let response = JsonRpcResponse::from_json(&msg)
            .map_err(|_| Error::BadRpcResponse("malformed JSON-RPC response".to_string()))?;

        if response.call_id != Some(request.call_id) {
            return Err(Error::BadRpcResponse("response id does not match request id".to_string()));
        }
        if response.is_error {
            return Err(Error::RpcError(response.result.to_string()));
        }
        Ok(response.result)
    }
}
