//! Knowledge store of a small self-hosted wiki.
//!
//! Entries form a tree and carry free-form `(predicate, value)` attributes
//! persisted one row each in a [`ledger`]. The [`store::EntryStore`] rebuilds
//! the tree from the ledger at startup and keeps it, the ledger, the
//! [`qgram`] completion index and the [`render`] cache in step on every edit.

pub mod attribute;
pub mod completion;
pub mod config;
pub mod error;
pub mod ledger;
pub mod qgram;
pub mod reconcile;
pub mod render;
pub mod store;

pub use error::{RenderError, WikiError};
pub use store::{EntryStore, ROOT_ID};
