//! Typed, versioned message contracts exchanged between execution contexts.
//!
//! Every cross-context interaction in the crate is an [`Envelope`] carrying a
//! [`Message`]. The message set is closed and tagged by `kind`, so every
//! dispatcher matches exhaustively and adding a kind forces a compile-time
//! review of all handlers. Unknown kinds received off the wire are dropped by
//! the bus, never an error, to stay forward compatible.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ChainId, CorrelationId, RouteId, RpcCall, RpcError, WindowId};

/// An immutable message plus the correlation id that pairs requests with
/// responses. Fire-and-forget kinds carry a fresh id that nothing waits on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Pairs a request with exactly one response envelope.
    #[serde(rename = "correlationId")]
    pub correlation_id: CorrelationId,
    /// The typed payload.
    #[serde(flatten)]
    pub message: Message,
}

/// The closed set of message kinds, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Message {
    /// A page-originated provider call to be routed to the active session.
    RequestProviderCall {
        /// Window whose session should answer the call.
        window_id: WindowId,
        /// The JSON-RPC call.
        call: RpcCall,
    },
    /// The correlated answer to a [`Message::RequestProviderCall`].
    ProviderCallResult {
        /// How the call settled.
        outcome: ProviderOutcome,
    },
    /// Start (or replace) the recording session for a window.
    ForkStart {
        /// Target window.
        window_id: WindowId,
        /// Chain to fork.
        chain_id: ChainId,
        /// Optional baseline RPC to fork from instead of the chain default.
        rpc_url: Option<url::Url>,
    },
    /// Swap the fork's underlying RPC without discarding ledger state.
    ForkUpdate {
        /// Target window.
        window_id: WindowId,
        /// New baseline RPC.
        rpc_url: url::Url,
    },
    /// Stop the recording session for a window and release its fork.
    ForkStop {
        /// Target window.
        window_id: WindowId,
    },
    /// Lifecycle broadcast: a fork is provisioned and accepting calls.
    ForkStarted {
        /// Window the fork belongs to.
        window_id: WindowId,
        /// Chain the fork simulates.
        chain_id: ChainId,
        /// The fork's RPC endpoint.
        fork_rpc_url: url::Url,
    },
    /// Lifecycle broadcast: the session for a window ended.
    ForkStopped {
        /// Window whose session ended.
        window_id: WindowId,
    },
    /// Session-level error broadcast: fork provisioning or update failed.
    ForkFailed {
        /// Window whose session is left without a usable fork.
        window_id: WindowId,
        /// Failure description for the recording UI.
        reason: String,
    },
    /// Persist a route definition. The payload is opaque to the core.
    SaveRoute {
        /// Route being saved.
        route_id: RouteId,
        /// Route data, forwarded verbatim.
        data: Value,
    },
    /// Delete a persisted route.
    DeleteRoute {
        /// Route being removed.
        route_id: RouteId,
    },
    /// Liveness and identity probe.
    Ping {
        /// Whether the probing context has an authenticated user.
        signed_in: bool,
    },
    /// Answer to a [`Message::Ping`].
    Pong,
    /// Provider-discovery broadcast, in the manner of EIP-6963.
    AnnounceProvider {
        /// Identity of the announcing provider.
        info: ProviderInfo,
    },
}

/// How a routed provider call settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ProviderOutcome {
    /// The call succeeded with a result value.
    Ok {
        /// The JSON-RPC result.
        result: Value,
    },
    /// The call failed with a JSON-RPC shaped error.
    Error {
        /// The error object.
        error: RpcError,
    },
    /// No session is active for the window; the caller should hand the call
    /// to the page's own wallet unmodified.
    Passthrough,
}

/// Identity advertised by the provider bridge so pages can select it among
/// other installed wallets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    /// Stable unique id for this provider instance.
    pub uuid: String,
    /// Human-readable wallet name.
    pub name: String,
    /// Reverse-DNS identifier.
    pub rdns: String,
}

/// Discriminant of a [`Message`], used for listener registration and relay
/// allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum MessageKind {
    /// See [`Message::RequestProviderCall`].
    RequestProviderCall,
    /// See [`Message::ProviderCallResult`].
    ProviderCallResult,
    /// See [`Message::ForkStart`].
    ForkStart,
    /// See [`Message::ForkUpdate`].
    ForkUpdate,
    /// See [`Message::ForkStop`].
    ForkStop,
    /// See [`Message::ForkStarted`].
    ForkStarted,
    /// See [`Message::ForkStopped`].
    ForkStopped,
    /// See [`Message::ForkFailed`].
    ForkFailed,
    /// See [`Message::SaveRoute`].
    SaveRoute,
    /// See [`Message::DeleteRoute`].
    DeleteRoute,
    /// See [`Message::Ping`].
    Ping,
    /// See [`Message::Pong`].
    Pong,
    /// See [`Message::AnnounceProvider`].
    AnnounceProvider,
}

impl Message {
    /// Returns the kind discriminant of this message.
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::RequestProviderCall { .. } => MessageKind::RequestProviderCall,
            Self::ProviderCallResult { .. } => MessageKind::ProviderCallResult,
            Self::ForkStart { .. } => MessageKind::ForkStart,
            Self::ForkUpdate { .. } => MessageKind::ForkUpdate,
            Self::ForkStop { .. } => MessageKind::ForkStop,
            Self::ForkStarted { .. } => MessageKind::ForkStarted,
            Self::ForkStopped { .. } => MessageKind::ForkStopped,
            Self::ForkFailed { .. } => MessageKind::ForkFailed,
            Self::SaveRoute { .. } => MessageKind::SaveRoute,
            Self::DeleteRoute { .. } => MessageKind::DeleteRoute,
            Self::Ping { .. } => MessageKind::Ping,
            Self::Pong => MessageKind::Pong,
            Self::AnnounceProvider { .. } => MessageKind::AnnounceProvider,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_tag_round_trips() {
        let msg = Message::Ping { signed_in: true };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "PING");
        assert_eq!(value["signedIn"], json!(true));
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn envelope_flattens_message() {
        let env = Envelope {
            correlation_id: CorrelationId::random(),
            message: Message::ForkStop { window_id: WindowId(7) },
        };
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["kind"], "FORK_STOP");
        assert_eq!(value["windowId"], json!(7));
        assert!(value["correlationId"].is_string());
        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn unknown_kind_fails_decode_but_not_dispatch() {
        // Decoding an unknown kind is a serde error at the edge; the bus
        // treats undeliverable kinds as a no-op (covered in bus tests).
        let raw = json!({ "kind": "SOMETHING_NEW", "correlationId": 1 });
        assert!(serde_json::from_value::<Envelope>(raw).is_err());
    }
}
