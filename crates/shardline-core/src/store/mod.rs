//! Versioned object store
//!
//! # Architecture
//!
//! ```text
//! DatabaseManager
//!   ├── shared   Database   (accounts and permissions, visible to every shard)
//!   ├── main     Database   (main shard state, deferred transactions)
//!   └── shards   Name → Database
//!
//! Database
//!   └── Index<T> per object type
//!         rows:   ObjectId → T
//!         by_key: T::Key → ObjectId
//!         stack:  VecDeque<UndoState<T>>
//! ```
//!
//! Every mutation is recorded in the innermost undo state of its index.
//! `Session` and `TieredSession` are scope guards that undo on drop unless
//! explicitly pushed or squashed.

mod database;
mod index;
mod manager;
mod session;

pub use database::{Database, HasIndex};
pub use index::{ChainObject, Index, ObjectId, UndoState};
pub use manager::DatabaseManager;
pub use session::{Session, TieredSession};

use thiserror::Error;

use crate::name::Name;

/// Object store failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("could not insert {type_name}: unique key {key} already exists")]
    UniqueConstraint { type_name: &'static str, key: String },

    #[error("{type_name} with id {id} not found")]
    NotFound { type_name: &'static str, id: ObjectId },

    #[error("{type_name} with key {key} not found")]
    KeyNotFound { type_name: &'static str, key: String },

    #[error("cannot set revision while there is an existing undo stack")]
    RevisionWithUndoStack,

    #[error("unknown shard {0}")]
    UnknownShard(Name),

    #[error("shard {0} already exists")]
    ShardExists(Name),
}
