//! Length-delimited JSON-RPC 2.0 over a Unix domain socket, with per-connection
//! challenge/response authentication and a password side-channel for `unlock`.

mod auth;
mod client;
mod jsonrpc;
mod server;

pub use auth::{auth_response, check_auth_response, gen_auth_challenge, gen_user_key};
pub use client::{RpcClient, RpcClientConnection};
pub use jsonrpc::{JsonRpcRequest, JsonRpcResponse, RpcTarget, BEGIN_UNLOCK_RESULT};
pub use server::RpcServer;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed JSON-RPC message")]
    MalformedJsonRpc,
    #[error("bad RPC response: {0}")]
    BadRpcResponse(String),
    #[error("RPC error: {0}")]
    RpcError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
