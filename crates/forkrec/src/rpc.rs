//! The JSON-RPC surface exposed to pages and proxied to fork endpoints.
//!
//! The shapes here follow EIP-1193: a wallet provider receives
//! `request({ method, params })` calls and answers with either a bare result
//! or a `{ code, message }` error object. Routed and simulated calls must be
//! indistinguishable from a real wallet, so the standard error codes are
//! reproduced exactly.

use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes defined by EIP-1193 and JSON-RPC 2.0 that this crate emits.
pub mod error_codes {
    /// The user rejected the request.
    pub const USER_REJECTED: i64 = 4001;
    /// The provider does not support the requested method.
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    /// The provider is disconnected from all chains.
    pub const DISCONNECTED: i64 = 4900;
    /// The provider is not connected to the requested chain.
    pub const CHAIN_DISCONNECTED: i64 = 4901;
    /// Requested resource is not available (JSON-RPC 2.0 reserved range).
    pub const RESOURCE_UNAVAILABLE: i64 = -32002;
    /// Internal JSON-RPC error.
    pub const INTERNAL: i64 = -32603;
}

/// A provider call as submitted by a page: method name plus positional
/// parameters. Missing params deserialize as an empty array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCall {
    /// JSON-RPC method name, e.g. `eth_sendTransaction`.
    pub method: String,
    /// Positional parameters. Defaults to `[]` when absent.
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Array(Vec::new())
}

impl RpcCall {
    /// Builds a call from a method name and parameters.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { method: method.into(), params }
    }
}

/// A JSON-RPC shaped error object, surfaced to pages exactly like a real
/// wallet error so dApp error handling cannot tell routed calls apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    /// Numeric error code (EIP-1193 or JSON-RPC 2.0).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Builds an error with the given code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    /// The user rejected the request (code 4001).
    pub fn user_rejected() -> Self {
        Self::new(error_codes::USER_REJECTED, "user rejected the request")
    }

    /// The method is not supported by this provider (code 4200).
    pub fn unsupported_method(method: &str) -> Self {
        Self::new(error_codes::UNSUPPORTED_METHOD, format!("method not supported: {method}"))
    }

    /// The provider is disconnected (code 4900).
    pub fn disconnected() -> Self {
        Self::new(error_codes::DISCONNECTED, "provider is disconnected")
    }

    /// A required resource is not available (code -32002).
    pub fn resource_unavailable(message: impl Into<String>) -> Self {
        Self::new(error_codes::RESOURCE_UNAVAILABLE, message)
    }

    /// Internal error (code -32603).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL, message)
    }
}

/// Returns `true` for methods that change chain state when executed.
///
/// State-changing calls are recorded in the transaction ledger before being
/// answered from the fork; everything else is proxied as a read.
pub fn is_state_changing(method: &str) -> bool {
    matches!(method, "eth_sendTransaction" | "eth_sendRawTransaction")
}

/// The transaction fields recorded for a state-changing call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPayload {
    /// Sender account, when supplied by the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    /// Target account. `None` for contract creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    /// Call data.
    #[serde(default)]
    pub data: Bytes,
    /// Transferred value in wei.
    #[serde(default)]
    pub value: U256,
}

impl TransactionPayload {
    /// Extracts the transaction payload from the first parameter of a
    /// state-changing call.
    pub fn from_call(call: &RpcCall) -> Result<Self, RpcError> {
        let first = call
            .params
            .get(0)
            .ok_or_else(|| RpcError::internal("missing transaction parameter"))?;
        serde_json::from_value(first.clone())
            .map_err(|e| RpcError::internal(format!("malformed transaction parameter: {e}")))
    }
}
