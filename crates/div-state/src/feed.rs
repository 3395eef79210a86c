//! Change feed: follows a table's change stream across shard rotation.
//!
//! A subscription starts at LATEST: only changes committed after
//! [`ChangeFeed::subscribe`] returns are delivered. A child shard is not
//! read until its parent has been drained, so records arrive in commit
//! order even while the stream rotates.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::backend::{Backend, ChangeRecord, ShardDescription};
use crate::error::{StateError, StateResult};

const RECORD_BUFFER: usize = 64;
const ERROR_BUFFER: usize = 16;
const PAGE_SIZE: usize = 100;

/// Live change records of one table, plus the errors met while reading them.
pub struct FeedSubscription {
    pub records: mpsc::Receiver<ChangeRecord>,
    pub errors: mpsc::Receiver<StateError>,
}

/// Subscribes to one table's change stream.
#[derive(Clone)]
pub struct ChangeFeed {
    backend: Arc<dyn Backend>,
    table: String,
    poll_interval: Duration,
}

impl ChangeFeed {
    pub fn new(backend: Arc<dyn Backend>, table: impl Into<String>) -> Self {
        Self {
            backend,
            table: table.into(),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Capture the current end of every shard and start polling from there.
    ///
    /// The cursors are taken before this returns, so a write that completes
    /// after `subscribe` is always delivered. Polling stops when `shutdown`
    /// turns true or the record receiver is dropped.
    pub fn subscribe(&self, shutdown: watch::Receiver<bool>) -> StateResult<FeedSubscription> {
        let shards = self.backend.describe_stream(&self.table)?;
        let reader = ShardReader {
            backend: self.backend.clone(),
            table: self.table.clone(),
            cursors: Cursors::at_latest(&shards),
        };
        let (record_tx, records) = mpsc::channel(RECORD_BUFFER);
        let (error_tx, errors) = mpsc::channel(ERROR_BUFFER);

        debug!(table = %self.table, shards = shards.len(), "change feed subscribed");
        tokio::spawn(run_feed_loop(
            reader,
            self.poll_interval,
            record_tx,
            error_tx,
            shutdown,
        ));
        Ok(FeedSubscription { records, errors })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    /// Last sequence delivered from this shard.
    after: Option<u64>,
    finished: bool,
}

#[derive(Debug, Default)]
struct Cursors(BTreeMap<u64, Cursor>);

impl Cursors {
    fn at_latest(shards: &[ShardDescription]) -> Self {
        let cursors = shards
            .iter()
            .map(|s| {
                let cursor = Cursor {
                    after: s.last_sequence,
                    finished: s.closed,
                };
                (s.shard_id, cursor)
            })
            .collect();
        Self(cursors)
    }

    /// A shard may be read once its parent is untracked or finished.
    fn parent_drained(&self, shard: &ShardDescription) -> bool {
        match shard.parent_shard_id.and_then(|p| self.0.get(&p)) {
            Some(parent) => parent.finished,
            None => true,
        }
    }
}

struct ShardReader {
    backend: Arc<dyn Backend>,
    table: String,
    cursors: Cursors,
}

impl ShardReader {
    /// Read everything new from every readable shard, oldest shard first.
    fn poll(&mut self) -> (Vec<ChangeRecord>, Vec<StateError>) {
        let mut records = Vec::new();
        let mut errors = Vec::new();

        let shards = match self.backend.describe_stream(&self.table) {
            Ok(shards) => shards,
            Err(e) => {
                errors.push(e);
                return (records, errors);
            }
        };

        // Unfinished shards that are no longer listed were trimmed unread.
        let trimmed: Vec<u64> = self
            .cursors
            .0
            .iter()
            .filter(|(id, c)| !c.finished && !shards.iter().any(|s| s.shard_id == **id))
            .map(|(id, _)| *id)
            .collect();
        for shard in trimmed {
            warn!(table = %self.table, shard, "shard trimmed before it was read");
            errors.push(StateError::ShardTrimmed {
                table: self.table.clone(),
                shard,
            });
            self.finish(shard);
        }
        // Forget finished shards that are no longer retained.
        self.cursors
            .0
            .retain(|id, c| !c.finished || shards.iter().any(|s| s.shard_id == *id));
        // Shards discovered after subscribing are read from their start.
        for shard in &shards {
            self.cursors.0.entry(shard.shard_id).or_default();
        }

        for shard in &shards {
            let finished = self
                .cursors
                .0
                .get(&shard.shard_id)
                .is_none_or(|c| c.finished);
            if finished || !self.cursors.parent_drained(shard) {
                continue;
            }
            match self.drain_shard(shard.shard_id, &mut records) {
                Ok(()) => {}
                Err(StateError::ShardTrimmed { table, shard }) => {
                    warn!(%table, shard, "shard trimmed before it was read");
                    self.finish(shard);
                    errors.push(StateError::ShardTrimmed { table, shard });
                }
                Err(e) => {
                    errors.push(e);
                    break;
                }
            }
        }
        (records, errors)
    }

    fn drain_shard(&mut self, shard_id: u64, out: &mut Vec<ChangeRecord>) -> StateResult<()> {
        loop {
            let after = self.cursors.0.get(&shard_id).and_then(|c| c.after);
            let page = self
                .backend
                .get_records(&self.table, shard_id, after, PAGE_SIZE)?;
            let cursor = self.cursors.0.entry(shard_id).or_default();
            if let Some(last) = page.records.last() {
                cursor.after = Some(last.sequence);
            }
            let read = page.records.len();
            out.extend(page.records);
            if page.exhausted {
                trace!(table = %self.table, shard = shard_id, "shard drained");
                cursor.finished = true;
                return Ok(());
            }
            if read < PAGE_SIZE {
                return Ok(());
            }
        }
    }

    fn finish(&mut self, shard_id: u64) {
        self.cursors.0.entry(shard_id).or_default().finished = true;
    }
}

async fn run_feed_loop(
    mut reader: ShardReader,
    interval: Duration,
    records: mpsc::Sender<ChangeRecord>,
    errors: mpsc::Sender<StateError>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (batch, failures) = reader.poll();
        for record in batch {
            trace!(table = %reader.table, sequence = record.sequence, "change record");
            if records.send(record).await.is_err() {
                debug!(table = %reader.table, "feed receiver dropped, stopping");
                return;
            }
        }
        for e in failures {
            if let Err(mpsc::error::TrySendError::Full(e)) = errors.try_send(e) {
                warn!(table = %reader.table, error = %e, "feed error dropped, channel full");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = records.closed() => {
                debug!(table = %reader.table, "feed receiver dropped, stopping");
                return;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(table = %reader.table, "change feed shutting down");
                    return;
                }
            }
        }
    }
}
