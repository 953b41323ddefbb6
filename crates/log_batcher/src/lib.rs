//! Buffers a request's log lines and flushes them to a host-supplied sink in
//! batches. `AddRecord` never blocks on I/O: it appends to an
//! in-memory buffer and, if a threshold was crossed, hands the buffer off to
//! a background flush.
use std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use runtime::Runtime;

pub const DEFAULT_BYTES_BEFORE_FLUSH: usize = 100 * 1024;
pub const DEFAULT_MAX_LOG_LINE_SIZE: usize = 16 * 1024;

/// A user log record's severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// One user log record. `timestamp_millis` is millisecond-resolution, not
/// microsecond: the only wallclock this runtime exposes
/// (`runtime::UnixTimestamp`, also what `Environment`'s soft-deadline clock
/// and a Future's reported wallclock are measured in) is millisecond
/// resolution, so the record's timestamp is pinned to that same precision
/// rather than fabricating microsecond granularity the clock can't back.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp_millis: i64,
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    pub fn new(timestamp_millis: i64, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp_millis,
            level,
            message: message.into(),
        }
    }

    fn byte_len(&self) -> usize {
        self.message.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LogBatcherConfig {
    pub bytes_before_flush: usize,
    pub max_log_line_size: usize,
    /// 0 means flush-on-add (every `AddRecord` immediately triggers a
    /// flush), appropriate for short online requests. Nonzero values are for
    /// long-running backends and offline requests.
    pub max_flush_age: Duration,
}

impl LogBatcherConfig {
    pub fn online() -> Self {
        Self {
            bytes_before_flush: DEFAULT_BYTES_BEFORE_FLUSH,
            max_log_line_size: DEFAULT_MAX_LOG_LINE_SIZE,
            max_flush_age: Duration::ZERO,
        }
    }

    pub fn offline(max_flush_age: Duration) -> Self {
        Self {
            bytes_before_flush: DEFAULT_BYTES_BEFORE_FLUSH,
            max_log_line_size: DEFAULT_MAX_LOG_LINE_SIZE,
            max_flush_age,
        }
    }
}

/// Where a flushed batch ends up. The core never interprets log contents; it
/// only ever hands a batch to this trait.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn persist(&self, records: Vec<LogRecord>) -> anyhow::Result<()>;
}

struct BatcherState {
    buffer: VecDeque<LogRecord>,
    buffered_bytes: usize,
    oldest_record_at_millis: Option<i64>,
    flush_in_progress: bool,
}

pub struct LogBatcher<RT: Runtime> {
    rt: RT,
    sink: Arc<dyn LogSink>,
    config: LogBatcherConfig,
    state: Arc<Mutex<BatcherState>>,
}

impl<RT: Runtime> LogBatcher<RT> {
    pub fn new(rt: RT, sink: Arc<dyn LogSink>, config: LogBatcherConfig) -> Self {
        Self {
            rt,
            sink,
            config,
            state: Arc::new(Mutex::new(BatcherState {
                buffer: VecDeque::new(),
                buffered_bytes: 0,
                oldest_record_at_millis: None,
                flush_in_progress: false,
            })),
        }
    }

    /// Appends `record`, splitting it at a `char` boundary first if it
    /// exceeds `max_log_line_size`. Triggers a background auto-flush if the
    /// byte threshold or max age was crossed; never blocks on that flush.
    pub fn add_record(&self, record: LogRecord) {
        for piece in split_at_byte_budget(&record.message, self.config.max_log_line_size) {
            self.enqueue_one(LogRecord::new(record.timestamp_millis, record.level, piece));
        }
        self.maybe_auto_flush();
    }

    fn enqueue_one(&self, record: LogRecord) {
        let mut state = self.state.lock();
        state.buffered_bytes += record.byte_len();
        if state.oldest_record_at_millis.is_none() {
            state.oldest_record_at_millis = Some(record.timestamp_millis);
        }
        state.buffer.push_back(record);
    }

    fn should_auto_flush(&self, state: &BatcherState) -> bool {
        if state.flush_in_progress || state.buffer.is_empty() {
            return false;
        }
        if state.buffered_bytes >= self.config.bytes_before_flush {
            return true;
        }
        if self.config.max_flush_age == Duration::ZERO {
            return true;
        }
        let Some(oldest) = state.oldest_record_at_millis else {
            return false;
        };
        let now = self.rt.unix_timestamp().as_millis() as i64;
        now.saturating_sub(oldest) >= self.config.max_flush_age.as_millis() as i64
    }

    fn maybe_auto_flush(&self) {
        let should = {
            let mut state = self.state.lock();
            let should = self.should_auto_flush(&state);
            if should {
                state.flush_in_progress = true;
            }
            should
        };
        if !should {
            return;
        }
        let state = self.state.clone();
        let sink = self.sink.clone();
        self.rt.spawn("log_batcher_auto_flush", async move {
            let batch = drain(&state);
            if let Err(err) = sink.persist(batch).await {
                tracing::warn!("log batch flush failed: {err:#}");
            }
            state.lock().flush_in_progress = false;
        });
    }

    /// Blocks until the currently buffered records have been persisted.
    pub async fn flush(&self) {
        let batch = {
            let mut state = self.state.lock();
            state.flush_in_progress = true;
            drop(state);
            drain(&self.state)
        };
        if let Err(err) = self.sink.persist(batch).await {
            tracing::warn!("log batch flush failed: {err:#}");
        }
        self.state.lock().flush_in_progress = false;
    }

    pub fn buffered_bytes(&self) -> usize {
        self.state.lock().buffered_bytes
    }

    pub fn buffered_records(&self) -> usize {
        self.state.lock().buffer.len()
    }
}

fn drain(state: &Mutex<BatcherState>) -> Vec<LogRecord> {
    let mut state = state.lock();
    state.buffered_bytes = 0;
    state.oldest_record_at_millis = None;
    state.buffer.drain(..).collect()
}

/// Splits `message` into pieces no larger than `budget` bytes, breaking only
/// at `char` boundaries so multi-byte code points are never torn in half.
fn split_at_byte_budget(message: &str, budget: usize) -> Vec<String> {
    if message.len() <= budget || budget == 0 {
        return vec![message.to_string()];
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < message.len() {
        let mut end = (start + budget).min(message.len());
        while end < message.len() && !message.is_char_boundary(end) {
            end -= 1;
        }
        pieces.push(message[start..end].to_string());
        start = end;
    }
    pieces
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;

    pub struct RecordingSink {
        pub batches: Mutex<Vec<Vec<LogRecord>>>,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
            })
        }

        pub fn all_records(&self) -> Vec<LogRecord> {
            self.batches.lock().iter().flatten().cloned().collect()
        }
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        async fn persist(&self, records: Vec<LogRecord>) -> anyhow::Result<()> {
            self.batches.lock().push(records);
            Ok(())
        }
    }
}
