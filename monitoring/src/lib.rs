//! Strand Consensus Metrics
//!
//! Lock-free counters and gauges for the hot paths, a mutex-guarded
//! histogram for latency distributions, and a snapshot type the
//! [`prometheus`] module renders into the text exposition format.
//!
//! ```rust
//! use strand_monitoring::{prometheus, Metrics};
//!
//! let metrics = Metrics::new();
//! metrics.blocks_committed.add(1);
//! metrics.last_committed_block.set(42);
//!
//! let text = prometheus::encode(&metrics.snapshot());
//! // Serve `text` on /metrics
//! ```

pub mod prometheus;

use {
    parking_lot::Mutex,
    std::sync::atomic::{AtomicU64, Ordering},
};

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-write-wins gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram (cumulative counts, Prometheus-style).
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [u64],
    inner: Mutex<HistogramInner>,
}

#[derive(Debug)]
struct HistogramInner {
    counts: Vec<u64>,
    sum: u64,
    total: u64,
}

impl Histogram {
    pub fn new(bounds: &'static [u64]) -> Self {
        Self {
            bounds,
            inner: Mutex::new(HistogramInner {
                counts: vec![0; bounds.len()],
                sum: 0,
                total: 0,
            }),
        }
    }

    pub fn observe(&self, value: u64) {
        let mut inner = self.inner.lock();
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                inner.counts[i] += 1;
            }
        }
        inner.sum += value;
        inner.total += 1;
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let inner = self.inner.lock();
        HistogramSnapshot {
            bounds: self.bounds,
            counts: inner.counts.clone(),
            sum: inner.sum,
            total: inner.total,
        }
    }
}

/// Frozen histogram state.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub bounds: &'static [u64],
    pub counts: Vec<u64>,
    pub sum: u64,
    pub total: u64,
}

const FINALITY_BUCKETS_MS: &[u64] = &[100, 250, 500, 1_000, 2_000, 5_000, 10_000, 30_000];

/// All metrics of one consensus node.
#[derive(Debug)]
pub struct Metrics {
    /// Blocks committed by this node, catch-up included.
    pub blocks_committed: Counter,
    /// Transactions inside committed blocks.
    pub transactions_committed: Counter,
    /// Blocks that arrived through catch-up rather than live consensus.
    pub catchup_blocks: Counter,
    /// The committed tip.
    pub last_committed_block: Gauge,
    /// Envelopes parked in the deferred-message queue.
    pub deferred_messages: Gauge,
    /// Messages queued across the per-peer delayed-send FIFOs.
    pub delayed_sends: Gauge,
    /// Transactions waiting in the pending pool.
    pub pending_transactions: Gauge,
    /// Commit-to-commit latency.
    pub block_finality_ms: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            blocks_committed: Counter::default(),
            transactions_committed: Counter::default(),
            catchup_blocks: Counter::default(),
            last_committed_block: Gauge::default(),
            deferred_messages: Gauge::default(),
            delayed_sends: Gauge::default(),
            pending_transactions: Gauge::default(),
            block_finality_ms: Histogram::new(FINALITY_BUCKETS_MS),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            blocks_committed: self.blocks_committed.get(),
            transactions_committed: self.transactions_committed.get(),
            catchup_blocks: self.catchup_blocks.get(),
            last_committed_block: self.last_committed_block.get(),
            deferred_messages: self.deferred_messages.get(),
            delayed_sends: self.delayed_sends.get(),
            pending_transactions: self.pending_transactions.get(),
            block_finality_ms: self.block_finality_ms.snapshot(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub blocks_committed: u64,
    pub transactions_committed: u64,
    pub catchup_blocks: u64,
    pub last_committed_block: u64,
    pub deferred_messages: u64,
    pub delayed_sends: u64,
    pub pending_transactions: u64,
    pub block_finality_ms: HistogramSnapshot,
}
