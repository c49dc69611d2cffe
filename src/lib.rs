//! Transactional ordered-list store with commit-time position uniqueness.
//!
//! Members are placed in containers at integer positions. Within a committed
//! container no two members share a position, but a transaction may pass through
//! such a state, which is what makes an in-place [`swap`](core::txn::Transaction::swap)
//! possible.
//!
//! # Examples
//!
//! ```
//! use listorder::core::store::Store;
//!
//! let store = Store::new();
//! let mut txn = store.begin();
//! let outdoor = txn.create_container("outdoor").expect("container");
//! let mow = txn.create_member("mow", "Mow lawn").expect("member");
//! let dig = txn.create_member("dig", "Dig hole").expect("member");
//! txn.add_membership(outdoor, mow, 0).expect("add");
//! txn.add_membership(outdoor, dig, 1).expect("add");
//! txn.commit().expect("commit");
//!
//! store.swap("outdoor", "mow", "dig").expect("swap");
//! let names: Vec<String> = store
//!     .list_ordered("outdoor")
//!     .expect("list")
//!     .map(|e| e.member.name)
//!     .collect();
//! assert_eq!(names, ["dig", "mow"]);
//! ```
//!
//! Runtime usage with SQLite journal:
//! ```no_run
//! use listorder::{
//!     core::store::Store,
//!     persist::sqlite::SqliteCommitSink,
//!     runtime::handle::{spawn_store, RuntimeConfig},
//!     types::CheckMode,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = SqliteCommitSink::open("lists.db").expect("open sqlite");
//! let store = sink.load_store().expect("replay");
//! let handle = spawn_store(store, Some(Box::new(sink)), RuntimeConfig::default());
//! handle
//!     .transact(CheckMode::Deferred, |txn| txn.swap("indoor", "laundry", "glass"))
//!     .await
//!     .expect("swap");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Store, transactions, and constraint checking.
pub mod core;
/// Member, container, and membership records.
pub mod model;
/// Mutation op model and persistence wrapper types.
pub mod op;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Async handle with conflict retry and background journaling.
pub mod runtime;
/// Shared primitive types.
pub mod types;
