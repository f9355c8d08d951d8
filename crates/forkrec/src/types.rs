//! Identifier newtypes shared across the crate.
//!
//! Every identifier that crosses a context boundary is an explicit newtype so
//! a window id can never be confused with a fork id, and so the wire format
//! stays stable under serde.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Re-exported chain id type from alloy.
pub use alloy_primitives::ChainId;

/// Identifies a browser window. At most one recording session is active per
/// window.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WindowId(pub u64);

/// Identifier of a provisioned fork, assigned by the fork-provisioning
/// service. Opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForkId(pub String);

impl From<&str> for ForkId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Identifier of a recorded transaction within a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    /// Generates a fresh random record id.
    pub fn random() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Reference to a route (chain + avatar address) managed by the surrounding
/// product. The core stores and forwards it, never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(pub String);

impl From<&str> for RouteId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Opaque token pairing a request envelope with its eventual response
/// envelope. Generated by the initiator, echoed verbatim by exactly one
/// response. On the wire it is a 32-digit hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(u128);

impl CorrelationId {
    /// Generates a fresh random correlation id.
    pub fn random() -> Self {
        Self(rand::random::<u128>())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Serialize for CorrelationId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CorrelationId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        u128::from_str_radix(&raw, 16)
            .map(Self)
            .map_err(|_| serde::de::Error::custom("correlation id is not a hex token"))
    }
}
