//! Record a scripted sequence of provider calls against a fresh fork.
//!
//! The script is a JSON array of `{ "method": ..., "params": [...] }` calls,
//! exactly what a page would submit through the provider bridge. The command
//! starts a session, routes every call, prints the resulting ledger as JSON,
//! and releases the fork.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use forkrec::{
    BusEndpoint, CallOutcome, HttpForkProvisioner, HttpForkRpc, Message, MemoryStore, RpcCall,
    SessionRouter, WindowId,
};
use tracing::{info, warn};
use url::Url;

use crate::Error;

/// Record a scripted sequence of provider calls against a fresh fork
#[derive(Parser, Debug)]
pub struct Cmd {
    /// JSON file with the provider calls to route
    #[arg(value_name = "SCRIPT")]
    pub script: PathBuf,

    /// Base URL of the fork-provisioning service
    #[arg(long = "provisioner", env = "FORKREC_PROVISIONER_URL")]
    pub provisioner: Url,

    /// API key for the provisioning service
    #[arg(long = "api-key", env = "FORKREC_API_KEY")]
    pub api_key: Option<String>,

    /// Chain to fork
    #[arg(long = "chain-id", default_value_t = 1)]
    pub chain_id: u64,

    /// Baseline RPC to fork from instead of the chain default
    #[arg(long = "base-rpc")]
    pub base_rpc: Option<Url>,

    /// Window id to record under
    #[arg(long = "window", default_value_t = 1)]
    pub window: u64,
}

impl Cmd {
    /// Execute the record command
    pub async fn run(&self) -> Result<(), Error> {
        let raw = std::fs::read_to_string(&self.script)?;
        let calls: Vec<RpcCall> = serde_json::from_str(&raw)
            .map_err(|e| Error::Script(format!("{}: {e}", self.script.display())))?;
        info!(calls = calls.len(), "loaded call script");

        let (driver, trusted) = BusEndpoint::pair();
        let router = Arc::new(SessionRouter::new(
            HttpForkProvisioner::new(self.provisioner.clone(), self.api_key.clone()),
            HttpForkRpc::new(),
            MemoryStore::new(),
            trusted,
        ));

        // Surface lifecycle broadcasts at -vvv.
        let mut lifecycle = driver.subscribe_many(&[
            forkrec::MessageKind::ForkStarted,
            forkrec::MessageKind::ForkFailed,
        ]);
        tokio::spawn(async move {
            while let Some(envelope) = lifecycle.recv().await {
                match envelope.message {
                    Message::ForkStarted { fork_rpc_url, .. } => {
                        info!(%fork_rpc_url, "fork provisioned");
                    }
                    Message::ForkFailed { reason, .. } => warn!(reason, "fork failed"),
                    _ => {}
                }
            }
        });

        let window = WindowId(self.window);
        router.start_session(window, self.chain_id, self.base_rpc.clone()).await?;

        let result = self.route_calls(&router, window, calls).await;

        // Always release the fork, even when a call failed.
        if let Err(error) = router.stop_session(window).await {
            warn!(%error, "failed to release fork session");
        }
        result
    }

    async fn route_calls(
        &self,
        router: &SessionRouter<HttpForkProvisioner, HttpForkRpc, MemoryStore>,
        window: WindowId,
        calls: Vec<RpcCall>,
    ) -> Result<(), Error> {
        for call in calls {
            let method = call.method.clone();
            match router.handle_call(window, call).await? {
                CallOutcome::Response(result) => info!(method, %result, "call answered"),
                CallOutcome::Passthrough(_) => warn!(method, "call passed through"),
            }
        }

        let records = router
            .with_ledger(window, |ledger| serde_json::to_value(ledger.records()))
            .await
            .transpose()
            .map_err(|e| Error::Script(format!("ledger encoding failed: {e}")))?
            .unwrap_or_default();
        println!("{}", serde_json::to_string_pretty(&records).unwrap_or_default());
        Ok(())
    }
}
