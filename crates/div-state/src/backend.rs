//! The backend contract: what div needs from a managed key-value service.
//!
//! Items are JSON documents keyed by their `name_hash_key` attribute. Every
//! mutation is also published to the table's change stream, which is split
//! into shards: a shard holds a bounded range of sequence numbers, closes
//! when full, and names its predecessor as parent.

use serde::{Deserialize, Serialize};

use crate::error::StateResult;

/// A stored document.
pub type Item = serde_json::Value;

/// Kind of mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

/// One row-level change, carrying the item as it is after the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub sequence: u64,
    pub change: ChangeKind,
    pub key: String,
    /// `None` for removals.
    pub new_image: Option<Item>,
}

/// A shard of a table's change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescription {
    pub shard_id: u64,
    /// The shard this one succeeded. It may already be trimmed.
    pub parent_shard_id: Option<u64>,
    pub first_sequence: u64,
    /// Last sequence written so far; `None` while the shard is empty.
    pub last_sequence: Option<u64>,
    pub closed: bool,
}

/// A page read from one shard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardRecords {
    pub records: Vec<ChangeRecord>,
    /// The shard is closed and this page reached its end.
    pub exhausted: bool,
}

/// One line of a log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub event_id: String,
    pub stream: String,
    pub timestamp_ms: u64,
    pub message: String,
}

/// A key-value service with per-table change streams and log groups.
///
/// Implementations must be safe to share across tasks. Errors use the
/// [`StateError`](crate::StateError) variants `MissingTable`, `Throttled`
/// and `ShardTrimmed` for the conditions callers branch on.
pub trait Backend: Send + Sync {
    // ── Tables and items ───────────────────────────────────────────

    /// Create a table and its change stream. Creating an existing table is a no-op.
    fn create_table(&self, table: &str) -> StateResult<()>;

    fn table_exists(&self, table: &str) -> StateResult<bool>;

    fn get_item(&self, table: &str, key: &str) -> StateResult<Option<Item>>;

    fn scan(&self, table: &str) -> StateResult<Vec<Item>>;

    /// Upsert an item under its `name_hash_key` attribute.
    fn put_item(&self, table: &str, item: &Item) -> StateResult<()>;

    /// Remove an item. Returns true if it existed.
    fn delete_item(&self, table: &str, key: &str) -> StateResult<bool>;

    // ── Change stream ──────────────────────────────────────────────

    /// All retained shards of the table's stream, oldest first.
    fn describe_stream(&self, table: &str) -> StateResult<Vec<ShardDescription>>;

    /// Records of `shard_id` with a sequence greater than `after` (from the
    /// start of the shard when `after` is `None`), at most `limit` of them.
    fn get_records(
        &self,
        table: &str,
        shard_id: u64,
        after: Option<u64>,
        limit: usize,
    ) -> StateResult<ShardRecords>;

    // ── Log groups ─────────────────────────────────────────────────

    /// Create the log group and stream if missing.
    fn ensure_log_stream(&self, group: &str, stream: &str) -> StateResult<()>;

    /// Append `(timestamp_ms, message)` events to a stream.
    fn put_log_events(&self, group: &str, stream: &str, events: &[(u64, String)])
    -> StateResult<()>;

    /// Events of every stream whose name starts with `stream_prefix`, at or
    /// after `start_ms`, ordered by timestamp.
    fn filter_log_events(
        &self,
        group: &str,
        stream_prefix: &str,
        start_ms: Option<u64>,
    ) -> StateResult<Vec<LogEvent>>;

    /// Delete a log group. Returns true if it existed.
    fn delete_log_group(&self, group: &str) -> StateResult<bool>;
}
