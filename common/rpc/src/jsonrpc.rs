use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use validator_orchestrator::ValidatorReleaseConfig;

use crate::Error;

/// Exclusive upper bound for randomly generated request ids.
pub const ID_LIMIT: i64 = 10000;
/// Sentinel `begin_unlock` result that arms the password side-channel.
pub const BEGIN_UNLOCK_RESULT: &str = "ENTER PASSPHRASE";

/// A JSON-RPC 2.0 request: `{"jsonrpc":"2.0","method":...,"params":...,"id":int}`.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub method: String,
    pub call_id: i64,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            call_id: rand::thread_rng().gen_range(0..ID_LIMIT),
            params,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": self.method,
            "params": self.params,
            "id": self.call_id,
        })
    }

    pub fn from_json(msg: &Value) -> Result<Self, Error> {
        let obj = msg.as_object().ok_or(Error::MalformedJsonRpc)?;
        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(Error::MalformedJsonRpc);
        }
        let method = obj
            .get("method")
            .and_then(Value::as_str)
            .ok_or(Error::MalformedJsonRpc)?
            .to_string();
        let call_id = obj.get("id").and_then(Value::as_i64).ok_or(Error::MalformedJsonRpc)?;
        let params = obj.get("params").cloned().ok_or(Error::MalformedJsonRpc)?;
        Ok(Self {
            method,
            call_id,
            params,
        })
    }
}

/// A JSON-RPC 2.0 response: either `{"jsonrpc":"2.0","id":...,"result":...}` or
/// `{"jsonrpc":"2.0","id":...,"error":...}`.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub call_id: Option<i64>,
    pub result: Value,
    pub is_error: bool,
}

impl JsonRpcResponse {
    pub fn ok(call_id: i64, result: Value) -> Self {
        Self {
            call_id: Some(call_id),
            result,
            is_error: false,
        }
    }

    pub fn err(call_id: Option<i64>, result: Value) -> Self {
        Self {
            call_id,
            result,
            is_error: true,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("jsonrpc".to_string(), json!("2.0"));
        obj.insert("id".to_string(), json!(self.call_id));
        if self.is_error {
            obj.insert("error".to_string(), self.result.clone());
        } else {
            obj.insert("result".to_string(), self.result.clone());
        }
        Value::Object(obj)
    }

    pub fn from_json(msg: &Value) -> Result<Self, Error> {
        let obj = msg.as_object().ok_or(Error::MalformedJsonRpc)?;
        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(Error::MalformedJsonRpc);
        }
        let call_id = match obj.get("id") {
            Some(Value::Null) | None if obj.contains_key("id") => None,
            Some(v) => Some(v.as_i64().ok_or(Error::MalformedJsonRpc)?),
            None => return Err(Error::MalformedJsonRpc),
        };

        let (is_error, result) = match (obj.get("result"), obj.get("error")) {
            (Some(result), None) => (false, result.clone()),
            (None, Some(error)) => (true, error.clone()),
            _ => return Err(Error::MalformedJsonRpc),
        };

        Ok(Self {
            call_id,
            result,
            is_error,
        })
    }
}

/// The server's view of the supervised daemon, dispatched to from the session state machine.
#[async_trait]
pub trait RpcTarget: Send + Sync {
    async fn get_health(&self) -> Value;
    async fn start_validator(&self) -> bool;
    async fn stop_validator(&self) -> bool;
    async fn connect_eth2_node(&self, host: String, port: Option<u16>) -> Result<(), String>;
    async fn set_validator_release(&self, release: ValidatorReleaseConfig) -> Result<(), String>;
    async fn unlock(&self, password: String) -> bool;
    async fn shutdown(&self);
}
