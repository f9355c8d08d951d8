//! Client for the external fork-provisioning service.
//!
//! The service creates and deletes remote forked networks: given a chain id
//! and an optional source RPC it answers with the fork's own RPC endpoint.
//! The crate consumes it through the [`ForkProvisioner`] capability so tests
//! can substitute an in-memory fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::{ChainId, ForkId, WindowId};

/// A provisioned remote fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedFork {
    /// Service-assigned fork id, used to release the resource.
    pub id: ForkId,
    /// The fork's JSON-RPC endpoint.
    pub rpc_url: Url,
    /// Height of the baseline chain state the fork was created at.
    pub block_height: u64,
}

/// Errors from fork provisioning.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The HTTP request to the provisioning service failed.
    #[error("provisioning transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The provisioning service refused the operation.
    #[error("provisioning service error (status {status}): {message}")]
    Service {
        /// HTTP status code.
        status: u16,
        /// Response body, as far as it was readable.
        message: String,
    },
    /// The service answered with a body this crate cannot decode.
    #[error("malformed provisioning response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
    /// No session exists for the window an operation targeted.
    #[error("no recording session for window {0}")]
    NoSession(WindowId),
    /// The configured endpoint cannot carry the service's path segments.
    #[error("provisioner endpoint '{0}' cannot be a base URL")]
    InvalidEndpoint(Url),
}

/// Capability interface over the fork-provisioning service.
#[async_trait]
#[auto_impl::auto_impl(&, Arc)]
pub trait ForkProvisioner: Send + Sync {
    /// Provisions a fork of `chain_id` at the chain's current height, or at
    /// the state served by `base_rpc` when given.
    async fn create_fork(
        &self,
        chain_id: ChainId,
        base_rpc: Option<&Url>,
    ) -> Result<ProvisionedFork, ProvisionError>;

    /// Releases a fork. Releasing an already-gone fork is a no-op.
    async fn delete_fork(&self, id: &ForkId) -> Result<(), ProvisionError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateForkBody<'a> {
    chain_id: ChainId,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_rpc_url: Option<&'a Url>,
}

/// [`ForkProvisioner`] backed by the provisioning service's REST API.
#[derive(Debug, Clone)]
pub struct HttpForkProvisioner {
    endpoint: Url,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpForkProvisioner {
    /// Creates a client for the service at `endpoint`.
    pub fn new(endpoint: Url, api_key: Option<String>) -> Self {
        Self { endpoint, api_key, client: reqwest::Client::new() }
    }

    fn forks_url(&self, suffix: Option<&str>) -> Result<Url, ProvisionError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| ProvisionError::InvalidEndpoint(self.endpoint.clone()))?;
            segments.pop_if_empty().push("forks");
            if let Some(suffix) = suffix {
                segments.push(suffix);
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-Api-Key", key),
            None => request,
        }
    }
}

#[async_trait]
impl ForkProvisioner for HttpForkProvisioner {
    async fn create_fork(
        &self,
        chain_id: ChainId,
        base_rpc: Option<&Url>,
    ) -> Result<ProvisionedFork, ProvisionError> {
        debug!(chain_id, ?base_rpc, "requesting fork creation");
        let body = CreateForkBody { chain_id, base_rpc_url: base_rpc };
        let response = self
            .authorize(self.client.post(self.forks_url(None)?))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Service { status: status.as_u16(), message });
        }

        let body = response.text().await?;
        let fork: ProvisionedFork = serde_json::from_str(&body)?;
        info!(fork = %fork.id, rpc = %fork.rpc_url, block = fork.block_height, "fork provisioned");
        Ok(fork)
    }

    async fn delete_fork(&self, id: &ForkId) -> Result<(), ProvisionError> {
        debug!(fork = %id, "releasing fork");
        let response =
            self.authorize(self.client.delete(self.forks_url(Some(&id.0))?)).send().await?;

        let status = response.status();
        // A fork the service no longer knows is already released.
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(ProvisionError::Service { status: status.as_u16(), message })
    }
}
