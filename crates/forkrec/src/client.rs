//! Raw JSON-RPC passthrough to fork endpoints.
//!
//! The session router answers read calls by proxying them verbatim to the
//! active fork's RPC endpoint; this module is that transport. It is a
//! capability trait so tests can script responses without a network.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use alloy_rpc_client::{ClientBuilder, RpcClient};
use alloy_transport::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;
use url::Url;

use crate::RpcError;

/// Capability interface for sending an arbitrary JSON-RPC call to a fork
/// endpoint and returning the bare result.
#[async_trait]
#[auto_impl::auto_impl(&, Arc)]
pub trait ForkRpc: Send + Sync {
    /// Sends `method`/`params` to `endpoint` and returns the result value.
    /// A JSON-RPC error response is surfaced with its original code and
    /// message so the page cannot tell the proxy from a direct connection.
    async fn raw_request(
        &self,
        endpoint: &Url,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError>;
}

/// [`ForkRpc`] over HTTP, keeping one client per fork endpoint.
#[derive(Debug, Clone, Default)]
pub struct HttpForkRpc {
    clients: Arc<Mutex<HashMap<Url, RpcClient>>>,
}

impl HttpForkRpc {
    /// Creates an empty client cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, endpoint: &Url) -> RpcClient {
        let mut clients = self.clients.lock().unwrap();
        clients
            .entry(endpoint.clone())
            .or_insert_with(|| ClientBuilder::default().http(endpoint.clone()))
            .clone()
    }
}

#[async_trait]
impl ForkRpc for HttpForkRpc {
    async fn raw_request(
        &self,
        endpoint: &Url,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        trace!(%endpoint, method, "proxying call to fork endpoint");
        let client = self.client_for(endpoint);
        client
            .request::<Value, Value>(method.to_owned(), params)
            .await
            .map_err(rpc_error_from_transport)
    }
}

/// Maps a transport failure onto the JSON-RPC error surface. Error responses
/// from the fork keep their code; everything else is an internal error.
fn rpc_error_from_transport(error: TransportError) -> RpcError {
    match error {
        TransportError::ErrorResp(payload) => rpc_error_from_payload(payload),
        other => RpcError::internal(format!("fork endpoint unreachable: {other}")),
    }
}

fn rpc_error_from_payload(payload: alloy_json_rpc::ErrorPayload) -> RpcError {
    RpcError {
        code: payload.code,
        message: payload.message.to_string(),
        data: payload.data.as_deref().and_then(|raw| serde_json::from_str(raw.get()).ok()),
    }
}
