//! The dispatch primitive connecting isolated execution contexts.
//!
//! A [`BusEndpoint`] is one half of a bidirectional channel pair. Contexts
//! never share memory; everything crosses the boundary as an [`Envelope`].
//! Delivery from a single sender is in send order. A correlated `request`
//! registers a oneshot waiter under a fresh [`CorrelationId`] and settles
//! exactly once: with the matching response, or with [`BusError::Timeout`]
//! when the budget elapses. Envelopes nobody listens for are dropped
//! silently, which is what keeps old contexts compatible with newer kinds.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::{CorrelationId, Envelope, Message, MessageKind};

/// Default budget for correlated requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors produced by the bus itself. Domain errors travel inside messages.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// No response envelope arrived within the budget.
    #[error("request {correlation_id} timed out after {timeout:?}")]
    Timeout {
        /// The correlation id nobody answered.
        correlation_id: CorrelationId,
        /// The elapsed budget.
        timeout: Duration,
    },
    /// The peer context is gone.
    #[error("bus peer disconnected")]
    Closed,
}

struct Shared {
    /// Waiters keyed by the correlation id they expect to be echoed.
    pending: Mutex<HashMap<CorrelationId, oneshot::Sender<Message>>>,
    /// Per-kind broadcast listeners.
    listeners: Mutex<HashMap<MessageKind, Vec<mpsc::UnboundedSender<Envelope>>>>,
    /// Listeners that observe every inbound envelope not claimed by a waiter.
    catch_all: Mutex<Vec<mpsc::UnboundedSender<Envelope>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            catch_all: Mutex::new(Vec::new()),
        }
    }

    /// Routes one inbound envelope: correlated waiters first, then kind
    /// listeners and catch-all observers. Undeliverable envelopes are a
    /// no-op.
    fn dispatch(&self, envelope: Envelope) {
        if let Some(waiter) = self.pending.lock().unwrap().remove(&envelope.correlation_id) {
            // The waiter may have been abandoned after a timeout; a failed
            // send is the caller ignoring the eventual settle.
            let _ = waiter.send(envelope.message);
            return;
        }

        let kind = envelope.message.kind();
        let mut delivered = false;

        if let Some(subscribers) = self.listeners.lock().unwrap().get_mut(&kind) {
            subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());
            delivered = !subscribers.is_empty();
        }
        {
            let mut observers = self.catch_all.lock().unwrap();
            observers.retain(|tx| tx.send(envelope.clone()).is_ok());
            delivered |= !observers.is_empty();
        }

        if !delivered {
            trace!(%kind, correlation_id = %envelope.correlation_id, "dropping envelope, no listener");
        }
    }
}

/// One side of a connected endpoint pair.
///
/// Cloning an endpoint shares the underlying channel and waiter table, so a
/// context can hand copies to its components.
#[derive(Clone)]
pub struct BusEndpoint {
    outbound: mpsc::UnboundedSender<Envelope>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for BusEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusEndpoint").finish_non_exhaustive()
    }
}

impl BusEndpoint {
    /// Creates a connected endpoint pair. Each side runs a pump task that
    /// dispatches inbound envelopes; dropping both clones of an endpoint
    /// closes its side.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Self { outbound: b_tx, shared: Arc::new(Shared::new()) };
        let b = Self { outbound: a_tx, shared: Arc::new(Shared::new()) };
        Self::spawn_pump(a_rx, Arc::clone(&a.shared));
        Self::spawn_pump(b_rx, Arc::clone(&b.shared));
        (a, b)
    }

    fn spawn_pump(mut rx: mpsc::UnboundedReceiver<Envelope>, shared: Arc<Shared>) {
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                shared.dispatch(envelope);
            }
        });
    }

    /// Fire-and-forget send. A fresh correlation id is attached; nothing
    /// waits on it.
    pub fn send(&self, message: Message) {
        self.forward(Envelope { correlation_id: CorrelationId::random(), message });
    }

    /// Transmits an envelope verbatim, preserving its correlation id. Used
    /// by relays that ferry envelopes between channels and by [`reply`].
    ///
    /// [`reply`]: Self::reply
    pub fn forward(&self, envelope: Envelope) {
        let kind = envelope.message.kind();
        if self.outbound.send(envelope).is_err() {
            trace!(%kind, "bus peer closed, envelope discarded");
        }
    }

    /// Answers a correlated request by echoing its correlation id.
    pub fn reply(&self, correlation_id: CorrelationId, message: Message) {
        self.forward(Envelope { correlation_id, message });
    }

    /// Sends a message and waits for the response envelope carrying the same
    /// correlation id. Settles exactly once: the response, or
    /// [`BusError::Timeout`] once `timeout` elapses. A late response to a
    /// timed-out request is discarded.
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<Message, BusError> {
        let correlation_id = CorrelationId::random();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(correlation_id, tx);

        let kind = message.kind();
        trace!(%kind, %correlation_id, "sending correlated request");
        let envelope = Envelope { correlation_id, message };
        if self.outbound.send(envelope).is_err() {
            self.shared.pending.lock().unwrap().remove(&correlation_id);
            return Err(BusError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            // The pump dropped the waiter without answering: peer gone.
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&correlation_id);
                warn!(%kind, %correlation_id, ?timeout, "correlated request timed out");
                Err(BusError::Timeout { correlation_id, timeout })
            }
        }
    }

    /// Registers a listener for one message kind and returns its stream of
    /// envelopes.
    pub fn subscribe(&self, kind: MessageKind) -> mpsc::UnboundedReceiver<Envelope> {
        self.subscribe_many(&[kind])
    }

    /// Registers one listener for several kinds, delivering all of them into
    /// a single stream.
    pub fn subscribe_many(&self, kinds: &[MessageKind]) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.shared.listeners.lock().unwrap();
        for kind in kinds {
            listeners.entry(*kind).or_default().push(tx.clone());
        }
        rx
    }

    /// Registers an observer for every inbound envelope not claimed by a
    /// correlated waiter. Relays use this to inspect traffic before deciding
    /// whether it may cross the trust boundary.
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.catch_all.lock().unwrap().push(tx);
        rx
    }
}
