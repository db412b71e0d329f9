use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// One successful terminal call. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub start_time_ms: i64,
    /// Request method or logical operation, e.g. `POST`.
    pub operation: String,
    pub latency_ms: i64,
    pub response_code: u16,
    /// Endpoint family, e.g. `albums` or `review`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl CallRecord {
    pub fn new(
        start_time_ms: i64,
        operation: impl Into<String>,
        latency_ms: i64,
        response_code: u16,
        endpoint: Option<String>,
    ) -> Self {
        Self {
            start_time_ms,
            operation: operation.into(),
            latency_ms: latency_ms.max(0),
            response_code,
            endpoint,
        }
    }
}

const DEFAULT_SHARDS: usize = 16;

/// Append-only record store shared by every worker of a phase.
///
/// Producers append through a [`RecordSink`] pinned to one shard, so workers
/// only contend with the few others that share their shard. Each append
/// takes a ticket from a global sequence; reading sorts by ticket and
/// therefore returns records in arrival order.
///
/// Reads are meant for after all producers have finished. Reading while
/// appends are still running is memory safe but sees an arbitrary prefix.
pub struct RecordCollector {
    shards: Vec<Mutex<Vec<(u64, CallRecord)>>>,
    sequence: AtomicU64,
    next_shard: AtomicUsize,
}

impl RecordCollector {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            sequence: AtomicU64::new(0),
            next_shard: AtomicUsize::new(0),
        }
    }

    /// Hand out a producer handle. Shards are assigned round-robin.
    pub fn sink(self: &Arc<Self>) -> RecordSink {
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        RecordSink {
            collector: Arc::clone(self),
            shard,
        }
    }

    fn append(&self, shard: usize, record: CallRecord) {
        let ticket = self.sequence.fetch_add(1, Ordering::Relaxed);
        lock(&self.shards[shard]).push((ticket, record));
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| lock(s).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out every record in arrival order.
    pub fn records(&self) -> Vec<CallRecord> {
        let mut tagged: Vec<(u64, CallRecord)> = Vec::with_capacity(self.len());
        for shard in &self.shards {
            tagged.extend(lock(shard).iter().cloned());
        }
        tagged.sort_unstable_by_key(|(ticket, _)| *ticket);
        tagged.into_iter().map(|(_, record)| record).collect()
    }
}

impl Default for RecordCollector {
    fn default() -> Self {
        Self::new()
    }
}

// A panicking producer cannot leave a half-written Vec behind, so a poisoned
// shard is still consistent.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Producer handle onto one collector shard.
#[derive(Clone)]
pub struct RecordSink {
    collector: Arc<RecordCollector>,
    shard: usize,
}

impl RecordSink {
    pub fn record(&self, record: CallRecord) {
        self.collector.append(self.shard, record);
    }
}
