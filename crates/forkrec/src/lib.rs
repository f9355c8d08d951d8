//! Record and simulate wallet transactions against an ephemeral chain fork.
//!
//! `forkrec` lets a dApp's wallet calls be transparently redirected to a
//! forked copy of chain state, so a sequence of transactions can be recorded,
//! inspected, and rolled back without ever broadcasting to a live network.
//! The crate provides the cross-context message fabric, the per-window
//! session router, the fork lifecycle manager, and the persisted transaction
//! ledger that make this work.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod types;
pub use types::*;

mod message;
pub use message::*;

mod bus;
pub use bus::*;

mod rpc;
pub use rpc::*;

mod store;
pub use store::*;

mod ledger;
pub use ledger::*;

mod fork;
pub use fork::*;

mod provision;
pub use provision::*;

mod client;
pub use client::*;

mod router;
pub use router::*;

mod bridge;
pub use bridge::*;

mod relay;
pub use relay::*;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
