//! The privileged coordinator that routes provider calls to fork sessions.
//!
//! The router owns the fork sessions and transaction ledgers for every
//! window; other contexts only observe its lifecycle broadcasts. Per
//! intercepted call it resolves the window's session, records state-changing
//! calls in the ledger, and answers against the fork's RPC endpoint. A call
//! for a window without a usable fork is refused — a recorded transaction
//! must never leak to a live network.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    is_state_changing, BusEndpoint, ChainId, Envelope, ForkProvisioner, ForkRpc,
    ForkSessionManager, LedgerError, Message, MessageKind, ProvisionError, ProviderOutcome,
    RecordId, RouteId, RpcCall, RpcError, Store, StoreError, StoreExt, TransactionLedger,
    TransactionPayload, WindowId, LAST_USED_ROUTE_KEY, ROUTES_COLLECTION,
};

/// How the router settled an intercepted call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Answered from the fork session.
    Response(Value),
    /// No active session for the window; the call goes to the page's own
    /// wallet unmodified.
    Passthrough(RpcCall),
}

/// Errors from session-lifecycle and ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Fork provisioning or release failed.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// A ledger invariant was violated.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Ledger persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The operation targeted a window without an active session.
    #[error("no recording session for window {0}")]
    NoSession(WindowId),
}

/// The window whose session lifecycle a message mutates, if any.
fn lifecycle_window(message: &Message) -> Option<WindowId> {
    match message {
        Message::ForkStart { window_id, .. }
        | Message::ForkUpdate { window_id, .. }
        | Message::ForkStop { window_id } => Some(*window_id),
        _ => None,
    }
}

/// The message kinds the router consumes from the trusted channel.
pub const ROUTER_KINDS: &[MessageKind] = &[
    MessageKind::RequestProviderCall,
    MessageKind::ForkStart,
    MessageKind::ForkUpdate,
    MessageKind::ForkStop,
    MessageKind::SaveRoute,
    MessageKind::DeleteRoute,
    MessageKind::Ping,
];

/// Routes provider calls and lifecycle commands for every window.
pub struct SessionRouter<P, C, S> {
    forks: AsyncMutex<ForkSessionManager<P>>,
    ledgers: AsyncMutex<HashMap<WindowId, TransactionLedger>>,
    /// Serializes session-lifecycle mutations per window: a stop always
    /// fully resolves before a queued start for the same window runs.
    window_locks: Mutex<HashMap<WindowId, Arc<AsyncMutex<()>>>>,
    rpc: C,
    store: S,
    bus: BusEndpoint,
    /// Taken by [`run`]; subscribed at construction so envelopes sent before
    /// the dispatch loop is polled are queued, not lost.
    ///
    /// [`run`]: Self::run
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl<P, C, S> std::fmt::Debug for SessionRouter<P, C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRouter").finish_non_exhaustive()
    }
}

impl<P, C, S> SessionRouter<P, C, S>
where
    P: ForkProvisioner,
    C: ForkRpc,
    S: Store,
{
    /// Creates a router that provisions forks with `provisioner`, proxies
    /// calls with `rpc`, persists ledgers in `store`, and talks to the rest
    /// of the system over `bus`.
    pub fn new(provisioner: P, rpc: C, store: S, bus: BusEndpoint) -> Self {
        let inbox = Mutex::new(Some(bus.subscribe_many(ROUTER_KINDS)));
        Self {
            forks: AsyncMutex::new(ForkSessionManager::new(provisioner)),
            ledgers: AsyncMutex::new(HashMap::new()),
            window_locks: Mutex::new(HashMap::new()),
            rpc,
            store,
            bus,
            inbox,
        }
    }

    fn window_lock(&self, window_id: WindowId) -> Arc<AsyncMutex<()>> {
        // Entries are tiny and windows few; the map is never pruned so a
        // queued lifecycle message can always find its lock.
        Arc::clone(self.window_locks.lock().unwrap().entry(window_id).or_default())
    }

    /// Starts (or replaces) the recording session for a window and
    /// broadcasts `ForkStarted` on success or `ForkFailed` on provisioning
    /// failure.
    pub async fn start_session(
        &self,
        window_id: WindowId,
        chain_id: ChainId,
        base_rpc: Option<Url>,
    ) -> Result<(), RouterError> {
        let lock = self.window_lock(window_id);
        let _guard = lock.lock().await;

        let started = {
            let mut forks = self.forks.lock().await;
            forks
                .start(window_id, chain_id, base_rpc.as_ref())
                .await
                .map(|session| session.fork_rpc_url().cloned())
        };

        match started {
            Ok(Some(fork_rpc_url)) => {
                // A replaced session's ledger belongs to the old session.
                self.ledgers.lock().await.insert(window_id, TransactionLedger::new());
                TransactionLedger::discard_persisted(&self.store, window_id);
                self.bus.send(Message::ForkStarted { window_id, chain_id, fork_rpc_url });
                Ok(())
            }
            Ok(None) => unreachable!("start returns a provisioned session or an error"),
            Err(error) => {
                self.bus.send(Message::ForkFailed { window_id, reason: error.to_string() });
                Err(error.into())
            }
        }
    }

    /// Swaps the session's fork RPC without discarding ledger state. Pending
    /// records stay pending; they are not replayed against the new fork.
    pub async fn update_session(
        &self,
        window_id: WindowId,
        base_rpc: Url,
    ) -> Result<(), RouterError> {
        let lock = self.window_lock(window_id);
        let _guard = lock.lock().await;

        let updated = {
            let mut forks = self.forks.lock().await;
            forks
                .update(window_id, &base_rpc)
                .await
                .map(|session| (session.chain_id, session.fork_rpc_url().cloned()))
        };

        match updated {
            Ok((chain_id, Some(fork_rpc_url))) => {
                self.bus.send(Message::ForkStarted { window_id, chain_id, fork_rpc_url });
                Ok(())
            }
            Ok((_, None)) => unreachable!("update returns a provisioned session or an error"),
            Err(error) => {
                self.bus.send(Message::ForkFailed { window_id, reason: error.to_string() });
                Err(error.into())
            }
        }
    }

    /// Stops the session for a window, releases its fork, and drops its
    /// ledger. A window without a session is a no-op.
    pub async fn stop_session(&self, window_id: WindowId) -> Result<(), RouterError> {
        let lock = self.window_lock(window_id);
        let _guard = lock.lock().await;

        let existed = {
            let mut forks = self.forks.lock().await;
            let existed = forks.session(window_id).is_some();
            forks.stop(window_id).await?;
            existed
        };

        self.ledgers.lock().await.remove(&window_id);
        TransactionLedger::discard_persisted(&self.store, window_id);
        if existed {
            self.bus.send(Message::ForkStopped { window_id });
        }
        Ok(())
    }

    /// Routes one provider call for a window.
    ///
    /// No session: the call passes through unmodified for the page's own
    /// wallet. Session without a fork (provisioning in flight or failed):
    /// refused with `-32002`, never forwarded to a live network.
    pub async fn handle_call(
        &self,
        window_id: WindowId,
        call: RpcCall,
    ) -> Result<CallOutcome, RpcError> {
        let endpoint = {
            let forks = self.forks.lock().await;
            match forks.session(window_id) {
                None => {
                    debug!(%window_id, method = call.method, "no session, passing call through");
                    return Ok(CallOutcome::Passthrough(call));
                }
                Some(session) => match session.fork_rpc_url() {
                    Some(url) => url.clone(),
                    None => {
                        return Err(RpcError::resource_unavailable(
                            "fork is not available for this session",
                        ))
                    }
                },
            }
        };

        if is_state_changing(&call.method) {
            self.execute_transaction(window_id, &endpoint, call).await.map(CallOutcome::Response)
        } else {
            self.rpc
                .raw_request(&endpoint, &call.method, call.params)
                .await
                .map(CallOutcome::Response)
        }
    }

    /// Records a state-changing call as `Pending`, executes it on the fork,
    /// and confirms it from the fork's receipt. A call the fork rejected is
    /// removed again: it never executed anywhere.
    async fn execute_transaction(
        &self,
        window_id: WindowId,
        endpoint: &Url,
        call: RpcCall,
    ) -> Result<Value, RpcError> {
        let payload = TransactionPayload::from_call(&call)?;

        let record_id = {
            let mut ledgers = self.ledgers.lock().await;
            let ledger = ledgers.entry(window_id).or_default();
            let record_id = ledger.append_pending(payload, None);
            self.persist_ledger(ledger, window_id);
            record_id
        };

        match self.rpc.raw_request(endpoint, &call.method, call.params.clone()).await {
            Ok(tx_hash) => {
                // Forks mine immediately; one receipt fetch confirms. A
                // missing receipt leaves the record pending for a later
                // explicit confirm.
                let receipt = self
                    .rpc
                    .raw_request(endpoint, "eth_getTransactionReceipt", json!([tx_hash]))
                    .await
                    .ok()
                    .filter(|receipt| !receipt.is_null());

                let mut ledgers = self.ledgers.lock().await;
                if let Some(ledger) = ledgers.get_mut(&window_id) {
                    if let Some(receipt) = receipt {
                        if let Err(error) = ledger.confirm(&record_id, receipt) {
                            warn!(%window_id, record = %record_id, %error, "confirm failed");
                        }
                    }
                    self.persist_ledger(ledger, window_id);
                }
                info!(%window_id, record = %record_id, "transaction recorded on fork");
                Ok(tx_hash)
            }
            Err(error) => {
                // Only the rejected record is removed; calls recorded while
                // this one was in flight are unrelated and stay.
                let mut ledgers = self.ledgers.lock().await;
                if let Some(ledger) = ledgers.get_mut(&window_id) {
                    if ledger.discard(&record_id).is_some() {
                        self.persist_ledger(ledger, window_id);
                    }
                }
                Err(error)
            }
        }
    }

    /// Confirms a pending record with a receipt delivered out of band.
    pub async fn confirm_transaction(
        &self,
        window_id: WindowId,
        record_id: &RecordId,
        receipt: Value,
    ) -> Result<(), RouterError> {
        let mut ledgers = self.ledgers.lock().await;
        let ledger = ledgers.get_mut(&window_id).ok_or(RouterError::NoSession(window_id))?;
        ledger.confirm(record_id, receipt)?;
        ledger.persist(&self.store, window_id)?;
        Ok(())
    }

    /// Attaches contract metadata to a recorded transaction. Supplied by the
    /// directory collaborator once the callee is resolved; stored verbatim.
    pub async fn annotate_record(
        &self,
        window_id: WindowId,
        record_id: &RecordId,
        contract_info: Value,
    ) -> Result<(), RouterError> {
        let mut ledgers = self.ledgers.lock().await;
        let ledger = ledgers.get_mut(&window_id).ok_or(RouterError::NoSession(window_id))?;
        let record = ledger
            .record_mut(record_id)
            .ok_or_else(|| RouterError::Ledger(LedgerError::UnknownRecord(record_id.clone())))?;
        record.contract_info = Some(contract_info);
        ledger.persist(&self.store, window_id)?;
        Ok(())
    }

    /// Rolls the window's ledger back to strictly before `record_id`. An
    /// emptied ledger tears the session down: no remaining records means no
    /// reason to keep simulated state alive.
    pub async fn rollback(
        &self,
        window_id: WindowId,
        record_id: &RecordId,
    ) -> Result<(), RouterError> {
        let emptied = {
            let mut ledgers = self.ledgers.lock().await;
            let ledger = ledgers.get_mut(&window_id).ok_or(RouterError::NoSession(window_id))?;
            ledger.rollback_to(record_id)?;
            ledger.persist(&self.store, window_id)?;
            ledger.is_empty()
        };
        if emptied {
            self.stop_session(window_id).await?;
        }
        Ok(())
    }

    /// Clears the whole ledger and releases the fork session.
    pub async fn clear_transactions(&self, window_id: WindowId) -> Result<(), RouterError> {
        {
            let mut ledgers = self.ledgers.lock().await;
            let ledger = ledgers.get_mut(&window_id).ok_or(RouterError::NoSession(window_id))?;
            ledger.clear();
            ledger.persist(&self.store, window_id)?;
        }
        self.stop_session(window_id).await
    }

    /// Runs `inspect` over the window's ledger, if one exists.
    pub async fn with_ledger<R>(
        &self,
        window_id: WindowId,
        inspect: impl FnOnce(&mut TransactionLedger) -> R,
    ) -> Option<R> {
        self.ledgers.lock().await.get_mut(&window_id).map(inspect)
    }

    /// Whether a window currently has a provisioned session.
    pub async fn is_recording(&self, window_id: WindowId) -> bool {
        self.forks.lock().await.session(window_id).is_some_and(|s| s.is_provisioned())
    }

    fn persist_ledger(&self, ledger: &TransactionLedger, window_id: WindowId) {
        // Persistence is best effort per mutation; the in-memory ledger
        // remains authoritative for the live session.
        if let Err(error) = ledger.persist(&self.store, window_id) {
            warn!(%window_id, %error, "ledger persistence failed");
        }
    }

    fn save_route(&self, route_id: &RouteId, data: Value) {
        if let Err(error) = self.store.set(&route_id.0, &data, Some(ROUTES_COLLECTION)) {
            warn!(route = %route_id, %error, "route save failed");
            return;
        }
        if let Err(error) = self.store.set(LAST_USED_ROUTE_KEY, route_id, None) {
            warn!(route = %route_id, %error, "last-used-route update failed");
        }
    }

    fn delete_route(&self, route_id: &RouteId) {
        self.store.remove(&route_id.0, Some(ROUTES_COLLECTION));
        match self.store.get::<RouteId>(LAST_USED_ROUTE_KEY, None) {
            Ok(Some(last)) if &last == route_id => self.store.remove(LAST_USED_ROUTE_KEY, None),
            Ok(_) => {}
            Err(error) => warn!(%error, "last-used-route pointer is malformed, clearing"),
        }
    }

    /// Consumes envelopes from the trusted channel until it closes. Provider
    /// calls and probes each run on their own task so a slow call never
    /// blocks other traffic. Lifecycle messages are queued per window and
    /// processed in arrival order: the last command sent is the last one
    /// applied, so a stop sent after a start always ends the session.
    pub async fn run(self: Arc<Self>)
    where
        P: 'static,
        C: 'static,
        S: 'static,
    {
        let inbox = self.inbox.lock().unwrap().take();
        let Some(mut inbox) = inbox else { return };
        let mut lifecycle: HashMap<WindowId, mpsc::UnboundedSender<Envelope>> = HashMap::new();
        while let Some(envelope) = inbox.recv().await {
            match lifecycle_window(&envelope.message) {
                Some(window_id) => {
                    let queue = lifecycle.entry(window_id).or_insert_with(|| {
                        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
                        let router = Arc::clone(&self);
                        tokio::spawn(async move {
                            while let Some(envelope) = rx.recv().await {
                                router.dispatch(envelope).await;
                            }
                        });
                        tx
                    });
                    // The worker holds the receiver for as long as we hold
                    // the sender; a failed send means it panicked.
                    let _ = queue.send(envelope);
                }
                None => {
                    let router = Arc::clone(&self);
                    tokio::spawn(async move { router.dispatch(envelope).await });
                }
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        let Envelope { correlation_id, message } = envelope;
        match message {
            Message::RequestProviderCall { window_id, call } => {
                let outcome = match self.handle_call(window_id, call).await {
                    Ok(CallOutcome::Response(result)) => ProviderOutcome::Ok { result },
                    Ok(CallOutcome::Passthrough(_)) => ProviderOutcome::Passthrough,
                    Err(error) => ProviderOutcome::Error { error },
                };
                self.bus.reply(correlation_id, Message::ProviderCallResult { outcome });
            }
            Message::ForkStart { window_id, chain_id, rpc_url } => {
                if let Err(error) = self.start_session(window_id, chain_id, rpc_url).await {
                    warn!(%window_id, %error, "session start failed");
                }
            }
            Message::ForkUpdate { window_id, rpc_url } => {
                if let Err(error) = self.update_session(window_id, rpc_url).await {
                    warn!(%window_id, %error, "session update failed");
                }
            }
            Message::ForkStop { window_id } => {
                if let Err(error) = self.stop_session(window_id).await {
                    warn!(%window_id, %error, "session stop failed");
                }
            }
            Message::SaveRoute { route_id, data } => self.save_route(&route_id, data),
            Message::DeleteRoute { route_id } => self.delete_route(&route_id),
            Message::Ping { signed_in } => {
                debug!(signed_in, "liveness probe");
                self.bus.reply(correlation_id, Message::Pong);
            }
            // Kinds the router emits but never consumes. Listed so adding a
            // kind forces a review here.
            Message::ProviderCallResult { .. }
            | Message::ForkStarted { .. }
            | Message::ForkStopped { .. }
            | Message::ForkFailed { .. }
            | Message::Pong
            | Message::AnnounceProvider { .. } => {}
        }
    }
}
