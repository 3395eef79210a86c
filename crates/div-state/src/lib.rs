//! div-state: resource storage for div.
//!
//! The managed key-value service is modelled by the [`Backend`] trait:
//! item CRUD per table, a shard-based change stream per table, and log
//! groups. [`RedbBackend`] implements it on an embedded
//! [redb](https://docs.rs/redb) database.
//!
//! # Architecture
//!
//! ```text
//! ResourceStore ── get / apply / delete / list_kinds
//!   │            └─ watch ──► snapshot, then ChangeFeed records
//!   │
//!   ├── ChangeFeed  (shard cursors, follows rotation)
//!   └── Backend     (RedbBackend: items + change records in one txn)
//!
//! LogStore ── writer() ──► LogWriter (one event per line)
//!          └─ read()   ──► deduplicated, optionally followed
//! ```
//!
//! One table exists per (namespace, kind); kind definitions live in a
//! single global table. See [`tables`] for the naming scheme.

pub mod backend;
pub mod error;
pub mod feed;
pub mod logs;
pub mod redb_backend;
pub mod store;
pub mod tables;

pub use backend::{Backend, ChangeKind, ChangeRecord, Item, LogEvent, ShardDescription, ShardRecords};
pub use error::{StateError, StateResult};
pub use feed::{ChangeFeed, FeedSubscription};
pub use logs::{LogStore, LogTail, LogWriter};
pub use redb_backend::RedbBackend;
pub use store::{ResourceStore, Watch};
