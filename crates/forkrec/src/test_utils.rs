//! In-memory fakes for the external collaborators, used by unit and
//! integration tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use crate::{ChainId, ForkId, ForkProvisioner, ForkRpc, ProvisionError, ProvisionedFork, RpcError};

/// [`ForkProvisioner`] fake that tracks which forks are alive.
#[derive(Debug, Default)]
pub struct FakeProvisioner {
    counter: AtomicU64,
    fail_next: AtomicBool,
    created: Mutex<Vec<ForkId>>,
    deleted: Mutex<Vec<ForkId>>,
}

impl FakeProvisioner {
    /// A provisioner with no forks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `create_fork` call fail.
    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Forks created and not yet deleted, in creation order.
    pub fn active_forks(&self) -> Vec<ForkId> {
        let deleted = self.deleted.lock().unwrap();
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|id| !deleted.contains(id))
            .cloned()
            .collect()
    }

    /// Every fork ever created, in creation order.
    pub fn created_forks(&self) -> Vec<ForkId> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl ForkProvisioner for FakeProvisioner {
    async fn create_fork(
        &self,
        chain_id: ChainId,
        _base_rpc: Option<&Url>,
    ) -> Result<ProvisionedFork, ProvisionError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ProvisionError::Service {
                status: 503,
                message: "no capacity".to_owned(),
            });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = ForkId::from(format!("fork-{chain_id}-{n}"));
        self.created.lock().unwrap().push(id.clone());
        Ok(ProvisionedFork {
            id: id.clone(),
            rpc_url: format!("http://{id}.invalid/rpc").parse().expect("static url"),
            block_height: 19_000_000 + n,
        })
    }

    async fn delete_fork(&self, id: &ForkId) -> Result<(), ProvisionError> {
        self.deleted.lock().unwrap().push(id.clone());
        Ok(())
    }
}

/// [`ForkRpc`] fake answering from scripted per-method responses.
///
/// Unscripted methods get defaults that make a recording flow work: a
/// transaction hash for sends and a successful receipt for receipt lookups.
#[derive(Debug, Default)]
pub struct ScriptedForkRpc {
    responses: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, RpcError>>,
    one_shot_failures: Mutex<HashMap<String, RpcError>>,
    stalls: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<(Url, String, Value)>>,
}

impl ScriptedForkRpc {
    /// A fake with only the default behavior.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the response for a method.
    pub fn respond_with(&self, method: &str, response: Value) {
        self.responses.lock().unwrap().insert(method.to_owned(), response);
    }

    /// Scripts a JSON-RPC error for a method.
    pub fn fail_with(&self, method: &str, error: RpcError) {
        self.failures.lock().unwrap().insert(method.to_owned(), error);
    }

    /// Scripts a JSON-RPC error for the next call to a method only.
    pub fn fail_once_with(&self, method: &str, error: RpcError) {
        self.one_shot_failures.lock().unwrap().insert(method.to_owned(), error);
    }

    /// Makes the next call to a method sleep before settling, so a test can
    /// interleave other calls while it is in flight.
    pub fn stall_next(&self, method: &str, delay: Duration) {
        self.stalls.lock().unwrap().insert(method.to_owned(), delay);
    }

    /// Every proxied call, in order: endpoint, method, params.
    pub fn calls(&self) -> Vec<(Url, String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    fn default_response(method: &str) -> Value {
        match method {
            "eth_sendTransaction" | "eth_sendRawTransaction" => {
                json!(format!("0x{:064x}", rand::random::<u64>()))
            }
            "eth_getTransactionReceipt" => json!({ "status": "0x1", "gasUsed": "0x5208" }),
            "eth_chainId" => json!("0x1"),
            _ => Value::Null,
        }
    }
}

#[async_trait]
impl ForkRpc for ScriptedForkRpc {
    async fn raw_request(
        &self,
        endpoint: &Url,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        self.calls.lock().unwrap().push((endpoint.clone(), method.to_owned(), params));
        let one_shot = self.one_shot_failures.lock().unwrap().remove(method);
        let stall = self.stalls.lock().unwrap().remove(method);
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = one_shot {
            return Err(error);
        }
        if let Some(error) = self.failures.lock().unwrap().get(method) {
            return Err(error.clone());
        }
        let scripted = self.responses.lock().unwrap().get(method).cloned();
        Ok(scripted.unwrap_or_else(|| Self::default_response(method)))
    }
}
