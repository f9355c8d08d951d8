//! The trust boundary between the page channel and the extension channel.
//!
//! The relay runs in the content context: unprivileged enough to touch the
//! page, connected enough to reach the extension. It ferries envelopes in
//! both directions but only for allow-listed kinds — an arbitrary page
//! message must never reach the privileged channel. Attachment to a document
//! is marker-guarded so re-initialised content contexts (extension reloads,
//! competing installs) inject exactly once.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{BusEndpoint, Envelope, MessageKind};

/// Marker written into a document on first attach.
pub const INJECTION_MARKER: &str = "__forkrec_relay_attached__";

/// Kinds a page is allowed to send toward the extension.
pub const PAGE_TO_EXTENSION: &[MessageKind] =
    &[MessageKind::RequestProviderCall, MessageKind::Ping];

/// Kinds the extension is allowed to send toward the page.
pub const EXTENSION_TO_PAGE: &[MessageKind] = &[
    MessageKind::ProviderCallResult,
    MessageKind::ForkStarted,
    MessageKind::ForkStopped,
    MessageKind::ForkFailed,
    MessageKind::Pong,
];

/// Per-document marker set, standing in for DOM state the content context
/// can probe before injecting.
#[derive(Debug, Default)]
pub struct DocumentContext {
    markers: HashSet<String>,
}

impl DocumentContext {
    /// A fresh document with no markers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the marker was written into this document.
    pub fn has_marker(&self, marker: &str) -> bool {
        self.markers.contains(marker)
    }

    /// Writes a marker. Idempotent.
    pub fn set_marker(&mut self, marker: &str) {
        self.markers.insert(marker.to_owned());
    }
}

/// Ferries allow-listed envelopes between the page and extension channels.
#[derive(Debug)]
pub struct Relay {
    page: BusEndpoint,
    extension: BusEndpoint,
    from_page: mpsc::UnboundedReceiver<Envelope>,
    from_extension: mpsc::UnboundedReceiver<Envelope>,
}

impl Relay {
    /// Attaches a relay to `document`, once. A second attach to the same
    /// document finds the marker and returns `None`: the no-op keeps
    /// re-initialised content contexts from double-injecting.
    ///
    /// Both channel subscriptions are registered here, so envelopes sent
    /// between attach and the first poll of [`run`] are queued, not lost.
    ///
    /// [`run`]: Self::run
    pub fn attach(
        document: &mut DocumentContext,
        page: BusEndpoint,
        extension: BusEndpoint,
    ) -> Option<Self> {
        if document.has_marker(INJECTION_MARKER) {
            debug!("relay already attached to document, skipping injection");
            return None;
        }
        document.set_marker(INJECTION_MARKER);
        let from_page = page.subscribe_all();
        let from_extension = extension.subscribe_all();
        Some(Self { page, extension, from_page, from_extension })
    }

    /// Forwards envelopes in both directions until either channel closes.
    /// Disallowed kinds are dropped and logged, never forwarded.
    pub async fn run(self) {
        let Self { page, extension, mut from_page, mut from_extension } = self;
        loop {
            tokio::select! {
                envelope = from_page.recv() => {
                    let Some(envelope) = envelope else { break };
                    forward(&extension, envelope, PAGE_TO_EXTENSION, "page");
                }
                envelope = from_extension.recv() => {
                    let Some(envelope) = envelope else { break };
                    forward(&page, envelope, EXTENSION_TO_PAGE, "extension");
                }
            }
        }
    }
}

/// Applies the allow-list before letting an envelope cross the boundary.
fn forward(target: &BusEndpoint, envelope: Envelope, allowed: &[MessageKind], origin: &str) {
    let kind = envelope.message.kind();
    if allowed.contains(&kind) {
        target.forward(envelope);
    } else {
        warn!(%kind, origin, "dropping disallowed message at trust boundary");
    }
}
