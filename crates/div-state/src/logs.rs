//! LogStore: persistent, line-oriented log streams per resource.
//!
//! One log group per (database, namespace, kind) and one stream per
//! resource name. [`LogWriter`] turns arbitrary `io::Write` output into one
//! timestamped event per line; [`LogStore::read`] replays a stream and can
//! keep following it.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use div_core::Kind;

use crate::backend::{Backend, LogEvent};
use crate::error::{StateError, StateResult};
use crate::store::ResourceStore;
use crate::tables;

/// Event ids remembered for de-duplication before the cache is reset.
const DEDUPE_CAPACITY: usize = 1000;

/// Log groups of one (database, namespace).
#[derive(Clone)]
pub struct LogStore {
    backend: Arc<dyn Backend>,
    database: String,
    namespace: String,
    poll_interval: Duration,
    throttle_backoff: Duration,
}

/// Messages of one stream, in order; closes when the read ends.
pub struct LogTail {
    pub messages: mpsc::Receiver<String>,
    pub errors: mpsc::Receiver<StateError>,
}

impl LogStore {
    pub fn new(backend: Arc<dyn Backend>, database: &str, namespace: &str) -> Self {
        Self {
            backend,
            database: database.to_string(),
            namespace: namespace.to_string(),
            poll_interval: Duration::from_secs(1),
            throttle_backoff: Duration::from_secs(3),
        }
    }

    /// Log groups in the same database and namespace as `store`.
    pub fn for_store(store: &ResourceStore) -> Self {
        Self::new(store.backend(), store.database(), store.namespace())
    }

    /// Follow-mode polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn group_name(&self, kind: Kind) -> String {
        tables::log_group_name(&self.database, &self.namespace, kind.resource_name())
    }

    /// Open the stream of resource `name`, creating group and stream if missing.
    pub fn writer(&self, kind: Kind, name: &str) -> StateResult<LogWriter> {
        let group = self.group_name(kind);
        self.backend.ensure_log_stream(&group, name)?;
        debug!(%group, stream = %name, "log writer opened");
        Ok(LogWriter {
            backend: self.backend.clone(),
            group,
            stream: name.to_string(),
            pending: Vec::new(),
        })
    }

    /// Copy a file, or stdin when `path` is `-`, into a stream.
    pub fn write_file(&self, kind: Kind, name: &str, path: &Path) -> StateResult<u64> {
        let mut writer = self.writer(kind, name)?;
        let copied = if path == Path::new("-") {
            io::copy(&mut io::stdin().lock(), &mut writer)?
        } else {
            let mut file = std::fs::File::open(path)?;
            io::copy(&mut file, &mut writer)?
        };
        writer.flush()?;
        info!(%kind, %name, bytes = copied, "log file written");
        Ok(copied)
    }

    /// Replay the stream of resource `name`, optionally from `since` ago,
    /// and keep polling for new lines while `follow` is set.
    ///
    /// A missing group or stream fails here rather than on the channel.
    pub fn read(
        &self,
        kind: Kind,
        name: &str,
        since: Option<Duration>,
        follow: bool,
        shutdown: watch::Receiver<bool>,
    ) -> StateResult<LogTail> {
        let group = self.group_name(kind);
        let start_ms = since.map(|ago| now_ms().saturating_sub(ago.as_millis() as u64));
        let first = self.backend.filter_log_events(&group, name, start_ms)?;

        let (message_tx, messages) = mpsc::channel(256);
        let (error_tx, errors) = mpsc::channel(16);
        let follower = Follower {
            backend: self.backend.clone(),
            group,
            stream: name.to_string(),
            start_ms,
            seen: HashSet::new(),
            poll_interval: self.poll_interval,
            throttle_backoff: self.throttle_backoff,
        };
        tokio::spawn(follower.run(first, follow, message_tx, error_tx, shutdown));
        Ok(LogTail { messages, errors })
    }

    /// Delete the log group of `kind`. Returns true if it existed.
    pub fn delete(&self, kind: Kind) -> StateResult<bool> {
        let group = self.group_name(kind);
        let existed = self.backend.delete_log_group(&group)?;
        info!(%group, existed, "log group deleted");
        Ok(existed)
    }
}

/// Buffers output and emits one event per complete line.
///
/// `flush` also emits a trailing partial line. Dropping the writer flushes.
pub struct LogWriter {
    backend: Arc<dyn Backend>,
    group: String,
    stream: String,
    pending: Vec<u8>,
}

impl LogWriter {
    fn emit(&self, lines: Vec<String>) -> io::Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let ts = now_ms();
        let events: Vec<(u64, String)> = lines.into_iter().map(|l| (ts, l)).collect();
        self.backend
            .put_log_events(&self.group, &self.stream, &events)
            .map_err(io::Error::other)
    }

    fn take_line(bytes: &[u8]) -> String {
        let line = bytes.strip_suffix(b"\n").unwrap_or(bytes);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        String::from_utf8_lossy(line).into_owned()
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            lines.push(Self::take_line(&self.pending));
            self.pending = rest;
        }
        self.emit(lines)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let line = Self::take_line(&self.pending);
        self.pending.clear();
        self.emit(vec![line])
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(group = %self.group, stream = %self.stream, error = %e, "failed to flush log writer");
        }
    }
}

struct Follower {
    backend: Arc<dyn Backend>,
    group: String,
    stream: String,
    start_ms: Option<u64>,
    seen: HashSet<String>,
    poll_interval: Duration,
    throttle_backoff: Duration,
}

impl Follower {
    /// New events only, advancing the window start to the newest timestamp.
    fn fresh(&mut self, events: Vec<LogEvent>) -> Vec<String> {
        let mut out = Vec::new();
        for event in events {
            if self.seen.len() >= DEDUPE_CAPACITY {
                self.seen.clear();
            }
            if !self.seen.insert(event.event_id) {
                continue;
            }
            self.start_ms = Some(self.start_ms.map_or(event.timestamp_ms, |s| s.max(event.timestamp_ms)));
            out.push(event.message);
        }
        out
    }

    async fn run(
        mut self,
        first: Vec<LogEvent>,
        follow: bool,
        messages: mpsc::Sender<String>,
        errors: mpsc::Sender<StateError>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut batch = first;
        loop {
            for message in self.fresh(batch) {
                if messages.send(message).await.is_err() {
                    return;
                }
            }
            if !follow {
                return;
            }

            let mut delay = self.poll_interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!(group = %self.group, stream = %self.stream, "log follow stopped");
                            return;
                        }
                        continue;
                    }
                }
                match self
                    .backend
                    .filter_log_events(&self.group, &self.stream, self.start_ms)
                {
                    Ok(events) => {
                        batch = events;
                        break;
                    }
                    Err(StateError::Throttled(reason)) => {
                        warn!(group = %self.group, %reason, "log read throttled, retrying");
                        delay = self.throttle_backoff;
                    }
                    Err(e) => {
                        let _ = errors.send(e).await;
                        return;
                    }
                }
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redb_backend::RedbBackend;

    fn logs() -> LogStore {
        let backend = RedbBackend::open_in_memory().unwrap();
        LogStore::new(Arc::new(backend), "mydb", "default")
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn collect(mut tail: LogTail) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(m) = tokio::time::timeout(Duration::from_secs(5), tail.messages.recv())
            .await
            .unwrap()
        {
            out.push(m);
        }
        out
    }

    #[tokio::test]
    async fn writer_emits_one_event_per_line() {
        let logs = logs();
        {
            let mut w = logs.writer(Kind::Install, "app1-prod1-abc").unwrap();
            w.write_all(b"first\nsec").unwrap();
            w.write_all(b"ond\r\nthird").unwrap();
            // Dropping flushes the partial line.
        }

        let (_tx, shutdown) = watch::channel(false);
        let tail = logs
            .read(Kind::Install, "app1-prod1-abc", None, false, shutdown)
            .unwrap();
        assert_eq!(collect(tail).await, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn streams_are_separate() {
        let logs = logs();
        writeln!(logs.writer(Kind::Install, "a").unwrap(), "from a").unwrap();
        writeln!(logs.writer(Kind::Install, "b").unwrap(), "from b").unwrap();

        let (_tx, shutdown) = watch::channel(false);
        let tail = logs.read(Kind::Install, "b", None, false, shutdown).unwrap();
        assert_eq!(collect(tail).await, ["from b"]);
        assert_eq!(logs.group_name(Kind::Install), "div-mydb-default-install");
    }

    #[tokio::test]
    async fn missing_stream_is_logs_not_found() {
        let logs = logs();
        let (_tx, shutdown) = watch::channel(false);
        assert!(matches!(
            logs.read(Kind::Install, "nope", None, false, shutdown),
            Err(StateError::LogsNotFound(_))
        ));
    }

    async fn recv(tail: &mut LogTail) -> String {
        tokio::time::timeout(Duration::from_secs(5), tail.messages.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn follow_delivers_new_lines_once() {
        let logs = logs();
        let mut w = logs.writer(Kind::Install, "job").unwrap();
        writeln!(w, "before").unwrap();

        let (tx, shutdown) = watch::channel(false);
        let mut tail = logs
            .read(Kind::Install, "job", None, true, shutdown)
            .unwrap();
        assert_eq!(recv(&mut tail).await, "before");

        writeln!(w, "after").unwrap();
        assert_eq!(recv(&mut tail).await, "after");

        tx.send(true).unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), tail.messages.recv())
            .await
            .unwrap();
        assert!(end.is_none(), "no duplicates before the follow stops");
    }

    #[tokio::test]
    async fn since_skips_old_events() {
        let backend = Arc::new(RedbBackend::open_in_memory().unwrap());
        let logs = LogStore::new(backend.clone(), "mydb", "default");
        let group = logs.group_name(Kind::Install);
        backend.ensure_log_stream(&group, "job").unwrap();
        backend
            .put_log_events(&group, "job", &[(1_000, "ancient".into()), (now_ms(), "recent".into())])
            .unwrap();

        let (_tx, shutdown) = watch::channel(false);
        let tail = logs
            .read(Kind::Install, "job", Some(Duration::from_secs(600)), false, shutdown)
            .unwrap();
        assert_eq!(collect(tail).await, ["recent"]);
    }

    #[tokio::test]
    async fn write_file_copies_lines() {
        let logs = logs();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        std::fs::write(&path, "one\ntwo\n").unwrap();
        logs.write_file(Kind::Install, "job", &path).unwrap();

        let (_tx, shutdown) = watch::channel(false);
        let tail = logs.read(Kind::Install, "job", None, false, shutdown).unwrap();
        assert_eq!(collect(tail).await, ["one", "two"]);

        assert!(logs.delete(Kind::Install).unwrap());
        let (_tx, shutdown) = watch::channel(false);
        assert!(logs.read(Kind::Install, "job", None, false, shutdown).is_err());
    }

    #[test]
    fn dedupe_cache_resets() {
        let mut follower = Follower {
            backend: Arc::new(RedbBackend::open_in_memory().unwrap()),
            group: "g".into(),
            stream: "s".into(),
            start_ms: None,
            seen: HashSet::new(),
            poll_interval: Duration::from_secs(1),
            throttle_backoff: Duration::from_secs(1),
        };
        let events: Vec<LogEvent> = (0..DEDUPE_CAPACITY + 10)
            .map(|i| LogEvent {
                event_id: format!("s/{i:020}"),
                stream: "s".into(),
                timestamp_ms: i as u64,
                message: i.to_string(),
            })
            .collect();
        assert_eq!(follower.fresh(events.clone()).len(), events.len());
        assert!(follower.seen.len() <= DEDUPE_CAPACITY);
        // The most recent ids are still remembered.
        assert!(follower.fresh(events[events.len() - 5..].to_vec()).is_empty());
        assert_eq!(follower.start_ms, Some((DEDUPE_CAPACITY + 9) as u64));
    }
}
