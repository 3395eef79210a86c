//! RedbBackend: an embedded [`Backend`] on a single redb database.
//!
//! Each div table is a redb table of JSON items plus a `#stream` table of
//! change records. The record is written in the same write transaction as
//! the item, so the stream never misses or reorders a committed change.
//! A registry table holds every div table's next sequence number.
//!
//! Sequence numbers are grouped into shards of `shard_capacity`; shard `n`
//! covers `[n * capacity, (n + 1) * capacity)` and is closed once the
//! stream has moved past it. When a new shard opens, shards older than
//! `retained_shards` are trimmed.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError, WriteTransaction};
use serde_json::Value;
use tracing::{debug, trace};

use crate::backend::*;
use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Registry of div tables, keyed by table name, valued by next sequence.
const REGISTRY: TableDefinition<&str, u64> = TableDefinition::new("div#tables");

/// Thread-safe backend on an embedded redb database.
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
    shard_capacity: u64,
    retained_shards: u64,
}

impl RedbBackend {
    /// Open (or create) a persistent backend at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let backend = Self::with_database(db)?;
        debug!(?path, "redb backend opened");
        Ok(backend)
    }

    /// Create an ephemeral in-memory backend (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(map_err!(Open))?;
        let backend = Self::with_database(db)?;
        debug!("in-memory redb backend opened");
        Ok(backend)
    }

    fn with_database(db: Database) -> StateResult<Self> {
        let backend = Self {
            db: Arc::new(db),
            shard_capacity: 256,
            retained_shards: 16,
        };
        let txn = backend.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(REGISTRY).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(backend)
    }

    pub fn with_shard_capacity(mut self, capacity: u64) -> Self {
        self.shard_capacity = capacity.max(1);
        self
    }

    pub fn with_retained_shards(mut self, retained: u64) -> Self {
        self.retained_shards = retained.max(1);
        self
    }

    /// Next sequence number of `table`, or `MissingTable`.
    fn next_sequence<T: ReadableTable<&'static str, u64>>(
        registry: &T,
        table: &str,
    ) -> StateResult<u64> {
        registry
            .get(table)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .ok_or_else(|| StateError::MissingTable(table.to_string()))
    }

    /// Append a change record inside `txn` and return its sequence.
    fn append_change(
        &self,
        txn: &WriteTransaction,
        table: &str,
        change: ChangeKind,
        key: &str,
        new_image: Option<Item>,
    ) -> StateResult<u64> {
        let mut registry = txn.open_table(REGISTRY).map_err(map_err!(Table))?;
        let sequence = Self::next_sequence(&registry, table)?;
        registry
            .insert(table, sequence + 1)
            .map_err(map_err!(Write))?;

        let record = ChangeRecord {
            sequence,
            change,
            key: key.to_string(),
            new_image,
        };
        let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
        let stream_name = stream_table_name(table);
        let mut records = txn.open_table(stream(&stream_name)).map_err(map_err!(Table))?;
        records
            .insert(sequence, bytes.as_slice())
            .map_err(map_err!(Write))?;

        let shard = sequence / self.shard_capacity;
        if sequence % self.shard_capacity == 0 && shard > self.retained_shards {
            let cutoff = (shard - self.retained_shards) * self.shard_capacity;
            // Collect first, then delete.
            let trimmed: Vec<u64> = records
                .range(..cutoff)
                .map_err(map_err!(Read))?
                .filter_map(|entry| entry.ok().map(|(k, _)| k.value()))
                .collect();
            for seq in &trimmed {
                records.remove(*seq).map_err(map_err!(Write))?;
            }
            debug!(%table, shard, trimmed = trimmed.len(), "trimmed change stream");
        }
        trace!(%table, sequence, ?change, %key, "change record appended");
        Ok(sequence)
    }

    /// First retained sequence of a stream, or `next` when nothing is retained.
    fn first_retained<T: ReadableTable<u64, &'static [u8]>>(
        records: &T,
        next: u64,
    ) -> StateResult<u64> {
        Ok(records
            .first()
            .map_err(map_err!(Read))?
            .map(|(k, _)| k.value())
            .unwrap_or(next))
    }
}

/// Map a table-open failure in a read transaction.
fn open_err(table: &str) -> impl FnOnce(TableError) -> StateError + '_ {
    move |e| match e {
        TableError::TableDoesNotExist(_) => StateError::MissingTable(table.to_string()),
        other => StateError::Table(other.to_string()),
    }
}

fn decode_item(bytes: &[u8]) -> StateResult<Item> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

impl Backend for RedbBackend {
    fn create_table(&self, table: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut registry = txn.open_table(REGISTRY).map_err(map_err!(Table))?;
            let exists = registry.get(table).map_err(map_err!(Read))?.is_some();
            if !exists {
                registry.insert(table, 0).map_err(map_err!(Write))?;
            }
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(items(table)).map_err(map_err!(Table))?;
            let stream_name = stream_table_name(table);
            txn.open_table(stream(&stream_name))
                .map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%table, "table created");
        Ok(())
    }

    fn table_exists(&self, table: &str) -> StateResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let registry = txn.open_table(REGISTRY).map_err(map_err!(Table))?;
        Ok(registry.get(table).map_err(map_err!(Read))?.is_some())
    }

    fn get_item(&self, table: &str, key: &str) -> StateResult<Option<Item>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(items(table)).map_err(open_err(table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode_item(guard.value())?)),
            None => Ok(None),
        }
    }

    fn scan(&self, table: &str) -> StateResult<Vec<Item>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(items(table)).map_err(open_err(table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode_item(value.value())?);
        }
        Ok(results)
    }

    fn put_item(&self, table: &str, item: &Item) -> StateResult<()> {
        let key = item
            .get(HASH_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| StateError::Write(format!("item has no \"{HASH_KEY}\" attribute")))?;
        let value = serde_json::to_vec(item).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let registry = txn.open_table(REGISTRY).map_err(map_err!(Table))?;
            Self::next_sequence(&registry, table)?;
        }
        {
            let mut t = txn.open_table(items(table)).map_err(map_err!(Table))?;
            let existed = t
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?
                .is_some();
            let change = if existed {
                ChangeKind::Modify
            } else {
                ChangeKind::Insert
            };
            self.append_change(&txn, table, change, key, Some(item.clone()))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%table, %key, "item stored");
        Ok(())
    }

    fn delete_item(&self, table: &str, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let registry = txn.open_table(REGISTRY).map_err(map_err!(Table))?;
            Self::next_sequence(&registry, table)?;
        }
        let existed;
        {
            let mut t = txn.open_table(items(table)).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
            if existed {
                self.append_change(&txn, table, ChangeKind::Remove, key, None)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%table, %key, existed, "item deleted");
        Ok(existed)
    }

    fn describe_stream(&self, table: &str) -> StateResult<Vec<ShardDescription>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let registry = txn.open_table(REGISTRY).map_err(map_err!(Table))?;
        let next = Self::next_sequence(&registry, table)?;
        let stream_name = stream_table_name(table);
        let records = txn
            .open_table(stream(&stream_name))
            .map_err(open_err(table))?;
        let first = Self::first_retained(&records, next)?;

        let cap = self.shard_capacity;
        let current = next / cap;
        let shards = (first / cap..=current)
            .map(|id| {
                let last_sequence = if id < current {
                    Some((id + 1) * cap - 1)
                } else if next > id * cap {
                    Some(next - 1)
                } else {
                    None
                };
                ShardDescription {
                    shard_id: id,
                    parent_shard_id: id.checked_sub(1),
                    first_sequence: id * cap,
                    last_sequence,
                    closed: id < current,
                }
            })
            .collect();
        Ok(shards)
    }

    fn get_records(
        &self,
        table: &str,
        shard_id: u64,
        after: Option<u64>,
        limit: usize,
    ) -> StateResult<ShardRecords> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let registry = txn.open_table(REGISTRY).map_err(map_err!(Table))?;
        let next = Self::next_sequence(&registry, table)?;
        let stream_name = stream_table_name(table);
        let records = txn
            .open_table(stream(&stream_name))
            .map_err(open_err(table))?;

        let cap = self.shard_capacity;
        let current = next / cap;
        if shard_id > current {
            return Err(StateError::Feed(format!(
                "shard {shard_id} of \"{table}\" does not exist"
            )));
        }
        if shard_id < Self::first_retained(&records, next)? / cap {
            return Err(StateError::ShardTrimmed {
                table: table.to_string(),
                shard: shard_id,
            });
        }

        let start = shard_id * cap;
        let end = start + cap;
        let lo = after.map_or(start, |a| (a + 1).max(start));
        let mut page = Vec::new();
        if lo < end {
            for entry in records.range(lo..end).map_err(map_err!(Read))? {
                if page.len() >= limit {
                    break;
                }
                let (_, value) = entry.map_err(map_err!(Read))?;
                let record: ChangeRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                page.push(record);
            }
        }
        let read_up_to = page.last().map_or(lo, |r| r.sequence + 1);
        Ok(ShardRecords {
            exhausted: shard_id < current && read_up_to >= end,
            records: page,
        })
    }

    fn ensure_log_stream(&self, group: &str, stream_name: &str) -> StateResult<()> {
        let events_name = log_events_table_name(group);
        let streams_name = log_streams_table_name(group);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            txn.open_table(log_events(&events_name))
                .map_err(map_err!(Table))?;
            let mut streams = txn
                .open_table(log_streams(&streams_name))
                .map_err(map_err!(Table))?;
            let exists = streams.get(stream_name).map_err(map_err!(Read))?.is_some();
            if !exists {
                streams.insert(stream_name, 0).map_err(map_err!(Write))?;
                debug!(%group, stream = %stream_name, "log stream created");
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_log_events(
        &self,
        group: &str,
        stream_name: &str,
        events: &[(u64, String)],
    ) -> StateResult<()> {
        let events_name = log_events_table_name(group);
        let streams_name = log_streams_table_name(group);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut streams = txn
                .open_table(log_streams(&streams_name))
                .map_err(map_err!(Table))?;
            let mut next = streams
                .get(stream_name)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .ok_or_else(|| {
                    StateError::LogsNotFound(format!(
                        "log stream \"{stream_name}\" in group \"{group}\" does not exist"
                    ))
                })?;
            let mut table = txn
                .open_table(log_events(&events_name))
                .map_err(map_err!(Table))?;
            for (timestamp_ms, message) in events {
                let event_id = format!("{stream_name}/{next:020}");
                let event = LogEvent {
                    event_id: event_id.clone(),
                    stream: stream_name.to_string(),
                    timestamp_ms: *timestamp_ms,
                    message: message.clone(),
                };
                let bytes = serde_json::to_vec(&event).map_err(map_err!(Serialize))?;
                table
                    .insert(event_id.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                next += 1;
            }
            streams.insert(stream_name, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn filter_log_events(
        &self,
        group: &str,
        stream_prefix: &str,
        start_ms: Option<u64>,
    ) -> StateResult<Vec<LogEvent>> {
        let events_name = log_events_table_name(group);
        let streams_name = log_streams_table_name(group);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let not_found = |_| StateError::LogsNotFound(format!("log group \"{group}\" does not exist"));
        let streams = txn
            .open_table(log_streams(&streams_name))
            .map_err(not_found)?;
        let mut prefixes = Vec::new();
        for entry in streams.iter().map_err(map_err!(Read))? {
            let (name, _) = entry.map_err(map_err!(Read))?;
            if name.value().starts_with(stream_prefix) {
                prefixes.push(format!("{}/", name.value()));
            }
        }
        if prefixes.is_empty() {
            return Err(StateError::LogsNotFound(format!(
                "no log stream named \"{stream_prefix}\" in group \"{group}\""
            )));
        }

        let table = txn
            .open_table(log_events(&events_name))
            .map_err(not_found)?;
        let mut events = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !prefixes.iter().any(|p| key.value().starts_with(p.as_str())) {
                continue;
            }
            let event: LogEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if start_ms.is_none_or(|start| event.timestamp_ms >= start) {
                events.push(event);
            }
        }
        events.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        Ok(events)
    }

    fn delete_log_group(&self, group: &str) -> StateResult<bool> {
        let events_name = log_events_table_name(group);
        let streams_name = log_streams_table_name(group);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = txn
            .delete_table(log_streams(&streams_name))
            .map_err(map_err!(Table))?;
        txn.delete_table(log_events(&events_name))
            .map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%group, existed, "log group deleted");
        Ok(existed)
    }
}
