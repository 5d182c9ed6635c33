use slog::{debug, error, info, o, warn, Logger};
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};

use crate::auth::{check_auth_response, gen_auth_challenge};
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, RpcTarget, BEGIN_UNLOCK_RESULT};
use crate::Error;
use serde_json::Value;
use validator_orchestrator::ValidatorReleaseConfig;

fn methods() -> &'static HashSet<&'static str> {
    static METHODS: std::sync::OnceLock<HashSet<&'static str>> = std::sync::OnceLock::new();
    METHODS.get_or_init(|| {
        [
            "get_health",
            "start_validator",
            "stop_validator",
            "connect",
            "shutdown",
            "begin_unlock",
            "check_unlock",
            "get_auth_challenge",
            "auth",
            "set_validator_release",
        ]
        .into_iter()
        .collect()
    })
}

fn unauthenticated_methods() -> &'static HashSet<&'static str> {
    static METHODS: std::sync::OnceLock<HashSet<&'static str>> = std::sync::OnceLock::new();
    METHODS.get_or_init(|| ["get_auth_challenge", "auth"].into_iter().collect())
}

/// JSON-RPC over a Unix domain socket, controlling one [`RpcTarget`].
///
/// One session per accepted connection; a single handler mutex serializes every dispatched
/// method across every session, since the controlled subsystems are not safe to re-enter.
pub struct RpcServer {
    target: Arc<dyn RpcTarget>,
    user_keys: Arc<HashMap<String, String>>,
    sock_path: PathBuf,
    handler_lock: Arc<Mutex<()>>,
    stop: Arc<Notify>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    log: Logger,
}

impl RpcServer {
    pub fn new(
        target: Arc<dyn RpcTarget>,
        user_keys: HashMap<String, String>,
        sock_path: PathBuf,
        log: Logger,
    ) -> Self {
        Self {
            target,
            user_keys: Arc::new(user_keys),
            sock_path,
            handler_lock: Arc::new(Mutex::new(())),
            stop: Arc::new(Notify::new()),
            accept_task: Mutex::new(None),
            log,
        }
    }

    pub async fn start(&self) -> Result<(), Error> {
        if self.accept_task.lock().await.is_some() {
            return Ok(());
        }

        let _ = std::fs::remove_file(&self.sock_path);
        let listener = UnixListener::bind(&self.sock_path)?;
        std::fs::set_permissions(&self.sock_path, std::fs::Permissions::from_mode(0o777))?;
        info!(self.log, "started RPC server"; "path" => %self.sock_path.display());

        let target = self.target.clone();
        let user_keys = self.user_keys.clone();
        let handler_lock = self.handler_lock.clone();
        let stop = self.stop.clone();
        let log = self.log.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, _addr)) => {
                                let session = Session::new(
                                    target.clone(),
                                    user_keys.clone(),
                                    handler_lock.clone(),
                                    log.new(o!("component" => "rpc-session")),
                                );
                                tokio::spawn(session.run(stream));
                            }
                            Err(err) => {
                                error!(log, "RPC accept failed"; "error" => %err);
                            }
                        }
                    }
                    _ = stop.notified() => return,
                }
            }
        });
        *self.accept_task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        let handle = self.accept_task.lock().await.take();
        let Some(handle) = handle else {
            return;
        };
        info!(self.log, "shutting down RPC server");
        self.stop.notify_one();
        let _ = handle.await;
        let _ = std::fs::remove_file(&self.sock_path);
    }
}

struct Session {
    target: Arc<dyn RpcTarget>,
    user_keys: Arc<HashMap<String, String>>,
    handler_lock: Arc<Mutex<()>>,
    log: Logger,
    user: Option<String>,
    auth_challenge: String,
    unlocking: bool,
    password: Option<Vec<u8>>,
}

impl Session {
    fn new(
        target: Arc<dyn RpcTarget>,
        user_keys: Arc<HashMap<String, String>>,
        handler_lock: Arc<Mutex<()>>,
        log: Logger,
    ) -> Self {
        Self {
            target,
            user_keys,
            handler_lock,
            log,
            user: None,
            auth_challenge: gen_auth_challenge(),
            unlocking: false,
            password: None,
        }
    }

    async fn run(mut self, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let n = match reader.read_line(&mut line).await {
                Ok(n) => n,
                Err(err) => {
                    warn!(self.log, "RPC session read error"; "error" => %err);
                    break;
                }
            };
            if n == 0 {
                break;
            }

            if self.unlocking {
                self.password = Some(line.trim_end_matches(['\n', '\r']).as_bytes().to_vec());
                self.unlocking = false;
                continue;
            }

            let response = self.handle_request(&line).await;
            let mut out = response.to_json().to_string();
            out.push('\n');
            if writer.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    }

    async fn handle_request(&mut self, line: &str) -> JsonRpcResponse {
        let msg: Value = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(err) => {
                let msg = format!("Failed to parse request body JSON: {err}");
                warn!(self.log, "{}", msg);
                return JsonRpcResponse::err(None, Value::String(msg));
            }
        };

        let request = match JsonRpcRequest::from_json(&msg) {
            Ok(request) => request,
            Err(_) => {
                let msg = "Received malformed JSON-RPC request".to_string();
                warn!(self.log, "{}", msg);
                return JsonRpcResponse::err(None, Value::String(msg));
            }
        };

        self.handle_rpc(request).await
    }

    async fn handle_rpc(&mut self, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!(self.log, "received RPC request"; "method" => &request.method);

        if !methods().contains(request.method.as_str()) {
            error!(self.log, "unknown RPC method"; "method" => &request.method);
            return JsonRpcResponse::err(Some(request.call_id), Value::String("Unknown JSON-RPC command".to_string()));
        }

        let authorized = self.user.is_some() || unauthenticated_methods().contains(request.method.as_str());
        let (success, result) = if authorized {
            let _guard = self.handler_lock.clone().lock_owned().await;
            self.dispatch(&request.method, request.params).await
        } else {
            (false, Value::String(format!("{} requires authentication", request.method)))
        };

        JsonRpcResponse {
            call_id: Some(request.call_id),
            result,
            is_error: !success,
        }
    }

    async fn dispatch(&mut self, method: &str, params: Value) -> (bool, Value) {
        match method {
            "get_auth_challenge" => (true, Value::String(self.auth_challenge.clone())),
            "auth" => self.handle_auth(params),
            "begin_unlock" => {
                self.unlocking = true;
                (true, Value::String(BEGIN_UNLOCK_RESULT.to_string()))
            }
            "check_unlock" => self.handle_check_unlock().await,
            "start_validator" => (true, Value::Bool(self.target.start_validator().await)),
            "stop_validator" => (true, Value::Bool(self.target.stop_validator().await)),
            "connect" => self.handle_connect(params).await,
            "shutdown" => {
                self.target.shutdown().await;
                (true, Value::Null)
            }
            "get_health" => (true, self.target.get_health().await),
            "set_validator_release" => self.handle_set_validator_release(params).await,
            _ => unreachable!("checked against methods() before dispatch"),
        }
    }

    fn handle_auth(&mut self, params: Value) -> (bool, Value) {
        let Some(params) = params.as_array().filter(|p| p.len() == 2) else {
            return (false, Value::String("params must be an array [USER, AUTH_RESPONSE]".to_string()));
        };
        let Some(user) = params[0].as_str() else {
            return (false, Value::String("user must be a string".to_string()));
        };
        let Some(response) = params[1].as_str() else {
            return (false, Value::String("auth response must be a string".to_string()));
        };

        let Some(user_key) = self.user_keys.get(user) else {
            return (false, Value::String("user not found".to_string()));
        };

        if !check_auth_response(user_key, &self.auth_challenge, response) {
            return (false, Value::String("denied".to_string()));
        }

        self.user = Some(user.to_string());
        (true, Value::String("accepted".to_string()))
    }

    async fn handle_check_unlock(&mut self) -> (bool, Value) {
        let Some(password_bytes) = self.password.take() else {
            return (false, Value::String("Must first call begin_unlock".to_string()));
        };

        let password = match String::from_utf8(password_bytes) {
            Ok(s) => s.trim().to_string(),
            Err(_) => return (false, Value::String("Password is not valid UTF-8".to_string())),
        };

        let success = self.target.unlock(password).await;
        (true, Value::Bool(success))
    }

    async fn handle_connect(&mut self, params: Value) -> (bool, Value) {
        let Some(params) = params.as_array().filter(|p| p.len() == 1 || p.len() == 2) else {
            return (false, Value::String("params must be an array [HOST, [PORT]]".to_string()));
        };
        let Some(host) = params[0].as_str() else {
            return (false, Value::String("host must be a string".to_string()));
        };
        let port = if params.len() == 2 {
            match params[1].as_u64() {
                Some(p) => Some(p as u16),
                None => return (false, Value::String("port must be an int".to_string())),
            }
        } else {
            None
        };

        match self.target.connect_eth2_node(host.to_string(), port).await {
            Ok(()) => (true, Value::String("OK".to_string())),
            Err(err) => (false, Value::String(err)),
        }
    }

    async fn handle_set_validator_release(&mut self, params: Value) -> (bool, Value) {
        if !params.is_object() {
            return (false, Value::String("params must be an JSON object".to_string()));
        }
        let release: ValidatorReleaseConfig = match serde_json::from_value(params) {
            Ok(release) => release,
            Err(err) => return (false, Value::String(format!("invalid release: {err}"))),
        };

        match self.target.set_validator_release(release).await {
            Ok(()) => (true, Value::Null),
            Err(err) => (false, Value::String(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{auth_response, gen_user_key};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncReadExt;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    struct FakeTarget {
        started: AtomicBool,
    }

    #[async_trait]
    impl RpcTarget for FakeTarget {
        async fn get_health(&self) -> Value {
            json!({"unlocked": true, "validator_running": false})
        }
        async fn start_validator(&self) -> bool {
            !self.started.swap(true, Ordering::SeqCst)
        }
        async fn stop_validator(&self) -> bool {
            self.started.swap(false, Ordering::SeqCst)
        }
        async fn connect_eth2_node(&self, _host: String, _port: Option<u16>) -> Result<(), String> {
            Ok(())
        }
        async fn set_validator_release(&self, _release: ValidatorReleaseConfig) -> Result<(), String> {
            Ok(())
        }
        async fn unlock(&self, _password: String) -> bool {
            true
        }
        async fn shutdown(&self) {}
    }

    async fn start_test_server() -> (RpcServer, PathBuf, String, tempfile::TempDir) {
        let tmpdir = tempfile::tempdir().unwrap();
        let sock_path = tmpdir.path().join("validator_supervisor.sock");
        let auth_key = gen_user_key();
        let mut user_keys = HashMap::new();
        user_keys.insert("admin".to_string(), auth_key.clone());

        let target: Arc<dyn RpcTarget> = Arc::new(FakeTarget {
            started: AtomicBool::new(false),
        });
        let server = RpcServer::new(target, user_keys, sock_path.clone(), test_logger());
        server.start().await.unwrap();
        (server, sock_path, auth_key, tmpdir)
    }

    async fn call(stream: &mut UnixStream, request: &JsonRpcRequest) -> JsonRpcResponse {
        let mut line = request.to_json().to_string();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.unwrap();

        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        let msg: Value = serde_json::from_slice(&buf).unwrap();
        JsonRpcResponse::from_json(&msg).unwrap()
    }

    #[tokio::test]
    async fn bad_auth_is_denied() {
        let (server, sock_path, _auth_key, _tmpdir) = start_test_server().await;
        let mut stream = UnixStream::connect(&sock_path).await.unwrap();

        let request = JsonRpcRequest::new("auth", json!(["admin", "abcd"]));
        let response = call(&mut stream, &request).await;

        assert_eq!(response.call_id, Some(request.call_id));
        assert!(response.is_error);
        assert_eq!(response.result, json!("denied"));

        server.stop().await;
    }

    #[tokio::test]
    async fn unauthenticated_call_is_rejected() {
        let (server, sock_path, _auth_key, _tmpdir) = start_test_server().await;
        let mut stream = UnixStream::connect(&sock_path).await.unwrap();

        let request = JsonRpcRequest::new("get_health", Value::Array(vec![]));
        let response = call(&mut stream, &request).await;

        assert!(response.is_error);
        assert_eq!(
            response.result,
            json!("get_health requires authentication")
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn auth_then_get_health_succeeds() {
        let (server, sock_path, auth_key, _tmpdir) = start_test_server().await;
        let mut stream = UnixStream::connect(&sock_path).await.unwrap();

        let challenge_req = JsonRpcRequest::new("get_auth_challenge", Value::Array(vec![]));
        let challenge_resp = call(&mut stream, &challenge_req).await;
        let challenge = challenge_resp.result.as_str().unwrap();
        let token = auth_response(&auth_key, challenge);

        let auth_req = JsonRpcRequest::new("auth", json!(["admin", token]));
        let auth_resp = call(&mut stream, &auth_req).await;
        assert!(!auth_resp.is_error);

        let health_req = JsonRpcRequest::new("get_health", Value::Array(vec![]));
        let health_resp = call(&mut stream, &health_req).await;
        assert!(!health_resp.is_error);
        assert!(health_resp.result.is_object());

        server.stop().await;
    }
}
