//! The wallet-provider facade exposed to the dApp page.
//!
//! The bridge looks like an EIP-1193 provider: `request({ method, params })`
//! plus `accountsChanged` / `chainChanged` / `disconnect` events. Every call
//! is wrapped into a routed request over the page channel and settles
//! exactly once. Failures are surfaced as JSON-RPC shaped errors, so to the
//! page a torn-down session is indistinguishable from a real wallet
//! disconnect.

use std::{sync::Mutex, time::Duration};

use alloy_primitives::Address;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::{
    BusEndpoint, BusError, ChainId, Envelope, Message, MessageKind, ProviderInfo, ProviderOutcome,
    RpcCall, RpcError, WindowId, DEFAULT_REQUEST_TIMEOUT,
};

/// Typed provider events a page may listen to.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// The set of exposed accounts changed.
    AccountsChanged(Vec<Address>),
    /// The provider now simulates a different chain.
    ChainChanged(ChainId),
    /// The provider became unable to serve requests.
    Disconnect(RpcError),
}

/// The EIP-1193-shaped provider bridge running in the page context.
#[derive(Debug)]
pub struct ForkProvider {
    bus: BusEndpoint,
    window_id: WindowId,
    timeout: Duration,
    info: ProviderInfo,
    events: broadcast::Sender<ProviderEvent>,
    /// Taken by [`run_events`]; subscribed at construction so broadcasts
    /// sent before the event loop is polled are queued, not lost.
    ///
    /// [`run_events`]: Self::run_events
    lifecycle: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl ForkProvider {
    /// Creates a bridge for `window_id` speaking over the page channel.
    pub fn new(bus: BusEndpoint, window_id: WindowId) -> Self {
        let (events, _) = broadcast::channel(16);
        let lifecycle = Mutex::new(Some(bus.subscribe_many(&[
            MessageKind::ForkStarted,
            MessageKind::ForkStopped,
            MessageKind::ForkFailed,
        ])));
        Self {
            bus,
            window_id,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            info: ProviderInfo {
                uuid: format!("{:032x}", rand::random::<u128>()),
                name: "Forkrec".to_owned(),
                rdns: "io.forkrec".to_owned(),
            },
            events,
            lifecycle,
        }
    }

    /// Overrides the per-call timeout budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The identity advertised to pages.
    pub fn info(&self) -> &ProviderInfo {
        &self.info
    }

    /// Submits a provider call and settles exactly once with the routed
    /// result. Timeouts and a closed channel surface as error 4900: the
    /// page sees a standard wallet disconnect.
    pub async fn request(&self, call: RpcCall) -> Result<Value, RpcError> {
        trace!(method = call.method, "routing provider call");
        let message = Message::RequestProviderCall { window_id: self.window_id, call };
        match self.bus.request(message, self.timeout).await {
            Ok(Message::ProviderCallResult { outcome }) => match outcome {
                ProviderOutcome::Ok { result } => Ok(result),
                ProviderOutcome::Error { error } => Err(error),
                // The router has no session for this window. Without a
                // recording session this provider is not connected.
                ProviderOutcome::Passthrough => Err(RpcError::disconnected()),
            },
            Ok(other) => Err(RpcError::internal(format!(
                "unexpected response kind {} to provider call",
                other.kind()
            ))),
            Err(BusError::Timeout { .. } | BusError::Closed) => Err(RpcError::disconnected()),
        }
    }

    /// Broadcasts this provider's identity so the page can select it among
    /// other installed wallets. Idempotent; re-emit whenever the page asks
    /// providers to announce themselves.
    pub fn announce(&self) {
        debug!(uuid = self.info.uuid, "announcing provider");
        self.bus.send(Message::AnnounceProvider { info: self.info.clone() });
    }

    /// Subscribes to the provider's typed event stream.
    pub fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    /// Notifies listeners that the exposed account set changed. Driven by
    /// the surrounding product when the avatar route changes.
    pub fn notify_accounts_changed(&self, accounts: Vec<Address>) {
        let _ = self.events.send(ProviderEvent::AccountsChanged(accounts));
    }

    /// Translates fork lifecycle broadcasts into provider events until the
    /// page channel closes. Run this on its own task; a second call finds
    /// the subscription already taken and returns immediately.
    pub async fn run_events(&self) {
        let inbox = self.lifecycle.lock().unwrap().take();
        let Some(mut inbox) = inbox else { return };
        while let Some(envelope) = inbox.recv().await {
            let event = match envelope.message {
                Message::ForkStarted { chain_id, .. } => ProviderEvent::ChainChanged(chain_id),
                Message::ForkStopped { .. } => {
                    ProviderEvent::Disconnect(RpcError::disconnected())
                }
                Message::ForkFailed { reason, .. } => {
                    ProviderEvent::Disconnect(RpcError::internal(reason))
                }
                // subscribe_many only yields the three kinds above
                _ => continue,
            };
            // No receivers just means the page is not listening right now.
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn request_settles_once_with_routed_result() {
        let (page, extension) = BusEndpoint::pair();
        let provider = ForkProvider::new(page, WindowId(1));

        let mut inbox = extension.subscribe(MessageKind::RequestProviderCall);
        tokio::spawn(async move {
            let envelope = inbox.recv().await.unwrap();
            extension.reply(
                envelope.correlation_id,
                Message::ProviderCallResult {
                    outcome: ProviderOutcome::Ok { result: serde_json::json!("0x1") },
                },
            );
        });

        let result =
            provider.request(RpcCall::new("eth_chainId", serde_json::json!([]))).await.unwrap();
        assert_eq!(result, serde_json::json!("0x1"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_surfaces_as_disconnect_error() {
        let (page, extension) = BusEndpoint::pair();
        // Silent peer: subscribed but never replies.
        let _inbox = extension.subscribe(MessageKind::RequestProviderCall);
        let provider =
            ForkProvider::new(page, WindowId(1)).with_timeout(Duration::from_millis(20));

        let err = provider
            .request(RpcCall::new("eth_accounts", serde_json::json!([])))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error_codes::DISCONNECTED);
    }

    #[tokio::test]
    async fn passthrough_reads_as_disconnected() {
        let (page, extension) = BusEndpoint::pair();
        let provider = ForkProvider::new(page, WindowId(1));

        let mut inbox = extension.subscribe(MessageKind::RequestProviderCall);
        tokio::spawn(async move {
            let envelope = inbox.recv().await.unwrap();
            extension.reply(
                envelope.correlation_id,
                Message::ProviderCallResult { outcome: ProviderOutcome::Passthrough },
            );
        });

        let err = provider
            .request(RpcCall::new("eth_accounts", serde_json::json!([])))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error_codes::DISCONNECTED);
    }

    #[tokio::test]
    async fn announce_is_re_emittable() {
        let (page, extension) = BusEndpoint::pair();
        let provider = ForkProvider::new(page, WindowId(1));
        let mut inbox = extension.subscribe(MessageKind::AnnounceProvider);

        provider.announce();
        provider.announce();

        let first = inbox.recv().await.unwrap();
        let second = inbox.recv().await.unwrap();
        assert_eq!(first.message, second.message);
    }

    #[tokio::test]
    async fn lifecycle_broadcasts_become_typed_events() {
        let (page, extension) = BusEndpoint::pair();
        let provider = Arc::new(ForkProvider::new(page, WindowId(3)));
        let mut events = provider.events();

        // Broadcasts land before the event loop is ever polled; the
        // subscription made at construction queues them.
        extension.send(Message::ForkStarted {
            window_id: WindowId(3),
            chain_id: 10,
            fork_rpc_url: "http://fork.local/rpc".parse().unwrap(),
        });
        extension.send(Message::ForkStopped { window_id: WindowId(3) });

        let runner = Arc::clone(&provider);
        tokio::spawn(async move { runner.run_events().await });

        assert_eq!(events.recv().await.unwrap(), ProviderEvent::ChainChanged(10));
        assert!(matches!(events.recv().await.unwrap(), ProviderEvent::Disconnect(_)));
    }
}
