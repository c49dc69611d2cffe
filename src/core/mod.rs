//! Store, transactions, and the position uniqueness check.

/// Per-container position uniqueness check.
pub mod checker;
/// Error kinds for store and transaction operations.
pub mod error;
/// Helper index aliases.
pub mod indices;
/// Committed state image and snapshots.
pub mod state;
/// Shared store and commit protocol.
pub mod store;
/// Transactions and sessions.
pub mod txn;
/// Shared read operations.
pub mod view;
