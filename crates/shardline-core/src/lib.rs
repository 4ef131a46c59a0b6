//! Shardline Core - deterministic action execution over a versioned,
//! multi-shard object store
//!
//! # Architecture
//!
//! ```text
//! PackedTransaction → execute_transaction → TieredSession (every tier)
//!                              ↓
//!                      TransactionContext → worklist of action ordinals
//!                              ↓
//!                         ApplyContext → native handler / interpreter
//!                              ↓
//!              receipts, notifications, inline + deferred scheduling
//! ```
//!
//! # Guarantees
//!
//! - **Deterministic**: the same store and transaction yield the same receipts
//! - **Atomic**: a failed transaction leaves no trace in any tier
//! - **Ordered**: notifications run FIFO, inline actions depth first
//! - **Bounded**: inline depth, inline size and net usage are capped

pub mod action;
pub mod apply_context;
pub mod authority;
pub mod authorization;
pub mod codec;
pub mod config;
pub mod contract_table;
pub mod controller;
pub mod error;
pub mod executor;
pub mod name;
pub mod native;
pub mod objects;
pub mod store;
pub mod transaction;
pub mod transaction_context;
pub mod types;

#[cfg(test)]
mod testing;

pub use action::{Action, ActionReceipt, ActionTrace, PermissionLevel};
pub use apply_context::ApplyContext;
pub use config::{BuiltinProtocolFeature, Config};
pub use controller::{Controller, Interpreter, LocalController};
pub use error::{Error, Result};
pub use executor::{execute_scenario, execute_transaction, Scenario};
pub use name::Name;
pub use store::{Database, DatabaseManager, StoreError};
pub use transaction::{PackedTransaction, SignedTransaction, Transaction};
pub use transaction_context::{TransactionContext, TransactionOptions, TransactionTrace};
pub use types::Digest;
