//! Read-only query engine over a finalized ledger dataset.
//!
//! The dataset consists of two replicated key-value stores: the tangle store
//! holding messages, metadata and milestones, and the UTXO store holding the
//! final ledger state. Both are immutable; the only write this crate ever
//! performs is rebuilding the conflicting-transactions index during startup,
//! under an exclusive handle, before serving begins.
//!
//! Applications open the dataset through [`db::Database::open`] and expose it
//! with [`api::serve`]. The transaction history of an address is assembled by
//! [`history::transaction_history`] and memoized in [`cache::HistoryCache`].

pub mod api;
pub mod cache;
pub mod config;
pub mod conflicts;
pub mod db;
pub mod errors;
pub mod history;
pub mod kvstore;
pub mod types;
pub mod utxo;

pub use config::NodeConfig;
pub use db::Database;
pub use errors::{ArchiveError, ArchiveResult};
