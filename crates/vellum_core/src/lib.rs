//! Shared foundation for the vellum transaction coordination core.
//!
//! This crate is deliberately small: the transaction/mutation/version data
//! model, the system-keyspace layout, the interval map backing the routing
//! state, the notified watermark and smoother primitives, the client-visible
//! error taxonomy, and the contracts external collaborators present.

pub mod error;
pub mod interfaces;
pub mod keys;
pub mod messages;
pub mod notified;
pub mod rangemap;
pub mod smoother;
pub mod time;
pub mod types;

pub use error::ProxyError;
pub use notified::{Notified, NotifiedVersion};
pub use rangemap::RangeMap;
pub use smoother::Smoother;
pub use types::{
    CommitStatus, CommitTransaction, Key, KeyRange, Mutation, Tag, TransactionPriority,
    TransactionTag, Version, INVALID_VERSION,
};
