//! # Gateway Metrics
//!
//! Provide lightweight counters and per-operation latency histograms, and
//! render them in the Prometheus text exposition format.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Use atomic counters to aggregate events cheaply.
//! 2. **Fixed Buckets**: Keep histogram buckets in a contiguous array for cache locality.
//! 3. **Never Fail The Caller**: Recording problems are counted and logged, not returned.
//! 4. **Scoped Recording**: `OperationScope` records on drop, so cancelled
//!    operations are still counted.
//!
//! ## Notes
//! - Bucket boundaries are expressed in microseconds and exported in seconds.
//! - Counters are read with `Relaxed` ordering; snapshots are eventually
//!   consistent, not atomic across fields.

use std::array;
use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

use cachegw_client::PoolStats;
use cachegw_common::{MetricsError, OperationKind, OperationRecord, Outcome};

/// Default latency bucket boundaries in microseconds.
///
/// Spans sub-millisecond local round trips up to multi-second pool waits.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 16] = [
    50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000,
    1_000_000, 2_500_000, 5_000_000,
];

const KINDS: usize = OperationKind::ALL.len();
const OUTCOMES: usize = Outcome::ALL.len();

/// Snapshot of all gateway metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Operation counts indexed by `[kind][outcome]`.
    pub requests: [[u64; OUTCOMES]; KINDS],
    /// Operations currently running.
    pub inflight: u64,
    /// Records dropped because they could not be recorded.
    pub dropped: u64,
    /// Latency histograms indexed by kind.
    pub latency: [LatencySnapshot; KINDS],
}

impl MetricsSnapshot {
    pub fn count(&self, kind: OperationKind, outcome: Outcome) -> u64 {
        self.requests[kind.index()][outcome.index()]
    }

    pub fn total(&self, kind: OperationKind) -> u64 {
        self.requests[kind.index()].iter().sum()
    }

    pub fn latency(&self, kind: OperationKind) -> &LatencySnapshot {
        &self.latency[kind.index()]
    }
}

/// Snapshot of one latency histogram.
#[derive(Debug, Clone, Default)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    /// Total number of samples.
    pub samples: u64,
    /// Sum of latencies in microseconds.
    pub sum_us: u64,
}

impl LatencySnapshot {
    /// Upper bound of the bucket holding quantile `q` (0.0..=1.0).
    ///
    /// Returns `None` when there are no samples or the quantile falls in the
    /// overflow bucket.
    pub fn quantile(&self, q: f64) -> Option<Duration> {
        let total: u64 = self.buckets.iter().sum();
        if total == 0 {
            return None;
        }
        let rank = ((q.clamp(0.0, 1.0) * total as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (idx, count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return self.bounds_us.get(idx).map(|us| Duration::from_micros(*us));
            }
        }
        None
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples == 0 {
            return None;
        }
        Some(Duration::from_micros(self.sum_us / self.samples))
    }
}

/// Thread-safe metrics aggregator for the gateway.
///
/// `Ordering::Relaxed` is sufficient because we do not require cross-field
/// ordering, only eventual consistency.
pub struct Metrics {
    requests: [[AtomicU64; OUTCOMES]; KINDS],
    inflight: AtomicU64,
    dropped: AtomicU64,
    latency: [LatencyHistogram; KINDS],
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a new metrics aggregator with the default latency buckets.
    pub fn new() -> Self {
        Self::with_latency_buckets(DEFAULT_LATENCY_BUCKETS_US.to_vec())
    }

    /// Creates a new metrics aggregator with custom latency bucket boundaries.
    ///
    /// The boundaries must be sorted ascending and represent microseconds.
    pub fn with_latency_buckets(bounds_us: Vec<u64>) -> Self {
        Metrics {
            requests: array::from_fn(|_| array::from_fn(|_| AtomicU64::new(0))),
            inflight: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            latency: array::from_fn(|_| LatencyHistogram::new(bounds_us.clone())),
        }
    }

    /// Starts timing one operation and counts it as in flight.
    ///
    /// The returned scope records exactly one `OperationRecord`: the outcome
    /// passed to `finish`, or `Outcome::Error` if it is dropped unfinished.
    pub fn begin(&self, kind: OperationKind) -> OperationScope<'_> {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        OperationScope {
            metrics: self,
            kind,
            started: Instant::now(),
            finished: false,
        }
    }

    /// Records one operation. Never fails; problems are logged and counted.
    pub fn record(&self, record: OperationRecord) {
        if let Err(err) = self.try_record(record) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(op = %record.kind, error = %err, "dropping operation record");
        }
    }

    /// Records one operation, reporting why it could not be recorded.
    pub fn try_record(&self, record: OperationRecord) -> Result<(), MetricsError> {
        let micros = u64::try_from(record.latency.as_micros())
            .map_err(|_| MetricsError::LatencyOverflow(record.latency))?;
        self.requests[record.kind.index()][record.outcome.index()]
            .fetch_add(1, Ordering::Relaxed);
        self.latency[record.kind.index()].record_micros(micros);
        Ok(())
    }

    /// Returns a snapshot of all counters and histogram buckets.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: array::from_fn(|kind| {
                array::from_fn(|outcome| self.requests[kind][outcome].load(Ordering::Relaxed))
            }),
            inflight: self.inflight.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            latency: array::from_fn(|kind| self.latency[kind].snapshot()),
        }
    }

    /// Renders gateway and pool metrics in Prometheus text format 0.0.4.
    pub fn render_prometheus(&self, pool: &PoolStats) -> String {
        let mut out = String::with_capacity(4 * 1024);
        if let Err(err) = write_exposition(&mut out, &self.snapshot(), pool) {
            warn!(error = %err, "failed to render metrics");
        }
        out
    }
}

/// Times one operation; records it when finished or dropped.
pub struct OperationScope<'a> {
    metrics: &'a Metrics,
    kind: OperationKind,
    started: Instant,
    finished: bool,
}

impl OperationScope<'_> {
    /// Records the operation with `outcome` and returns its latency.
    pub fn finish(mut self, outcome: Outcome) -> Duration {
        self.finished = true;
        self.complete(outcome)
    }

    fn complete(&self, outcome: Outcome) -> Duration {
        let latency = self.started.elapsed();
        self.metrics.inflight.fetch_sub(1, Ordering::Relaxed);
        self.metrics
            .record(OperationRecord::new(self.kind, outcome, latency));
        latency
    }
}

impl Drop for OperationScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.complete(Outcome::Error);
        }
    }
}

/// Fixed-bucket latency histogram.
///
/// Uses a linear scan to pick buckets; this is O(buckets) but the list is small
/// and stays hot in cache.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with explicit bucket boundaries (microseconds).
    ///
    /// Allocates `bounds_us.len() + 1` buckets; the last one is overflow.
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// Records a latency measurement into the histogram.
    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.record_micros(micros);
    }

    fn record_micros(&self, micros: u64) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);
        let idx = self
            .bounds_us
            .iter()
            .position(|bound| micros <= *bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of the histogram.
    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}

fn write_exposition(out: &mut String, snapshot: &MetricsSnapshot, pool: &PoolStats) -> fmt::Result {
    writeln!(out, "# HELP cachegw_requests_total Gateway operations by kind and outcome.")?;
    writeln!(out, "# TYPE cachegw_requests_total counter")?;
    for kind in OperationKind::ALL {
        for outcome in Outcome::ALL {
            writeln!(
                out,
                "cachegw_requests_total{{op=\"{kind}\",outcome=\"{outcome}\"}} {}",
                snapshot.count(kind, outcome)
            )?;
        }
    }

    writeln!(
        out,
        "# HELP cachegw_request_duration_seconds Latency from admission to backend reply."
    )?;
    writeln!(out, "# TYPE cachegw_request_duration_seconds histogram")?;
    for kind in OperationKind::ALL {
        let latency = snapshot.latency(kind);
        let mut cumulative = 0;
        for (bound, count) in latency.bounds_us.iter().zip(&latency.buckets) {
            cumulative += count;
            writeln!(
                out,
                "cachegw_request_duration_seconds_bucket{{op=\"{kind}\",le=\"{}\"}} {cumulative}",
                *bound as f64 / 1e6
            )?;
        }
        cumulative += latency.buckets.last().copied().unwrap_or(0);
        writeln!(
            out,
            "cachegw_request_duration_seconds_bucket{{op=\"{kind}\",le=\"+Inf\"}} {cumulative}"
        )?;
        writeln!(
            out,
            "cachegw_request_duration_seconds_sum{{op=\"{kind}\"}} {}",
            latency.sum_us as f64 / 1e6
        )?;
        writeln!(
            out,
            "cachegw_request_duration_seconds_count{{op=\"{kind}\"}} {cumulative}"
        )?;
    }

    gauge(out, "cachegw_inflight_requests", "Gateway operations in flight.", snapshot.inflight)?;
    counter(
        out,
        "cachegw_metrics_dropped_total",
        "Operation records that could not be recorded.",
        snapshot.dropped,
    )?;

    gauge(out, "cachegw_pool_max_connections", "Admission ceiling of the pool.", pool.max_connections)?;
    gauge(out, "cachegw_pool_outstanding", "Handles currently borrowed.", pool.outstanding)?;
    gauge(out, "cachegw_pool_idle", "Connections in the free set.", pool.idle)?;
    gauge(out, "cachegw_pool_live", "Open or opening backend connections.", pool.live)?;
    gauge(out, "cachegw_pool_waiting", "Borrowers queued for a connection.", pool.waiting)?;
    gauge(
        out,
        "cachegw_pool_saturation",
        "Outstanding handles as a fraction of the ceiling.",
        pool.saturation(),
    )?;
    counter(out, "cachegw_pool_connections_opened_total", "Backend connections opened.", pool.opened)?;
    counter(out, "cachegw_pool_connections_closed_total", "Backend connections closed.", pool.closed)?;
    counter(
        out,
        "cachegw_pool_connections_discarded_total",
        "Connections discarded after a backend fault.",
        pool.discarded,
    )?;
    counter(
        out,
        "cachegw_pool_saturated_total",
        "Borrows that had to wait for a free connection.",
        pool.saturated,
    )?;
    counter(
        out,
        "cachegw_pool_exhausted_total",
        "Borrows that timed out waiting for a connection.",
        pool.exhausted,
    )?;
    Ok(())
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl fmt::Display) -> fmt::Result {
    writeln!(out, "# HELP {name} {help}")?;
    writeln!(out, "# TYPE {name} gauge")?;
    writeln!(out, "{name} {value}")
}

fn counter(out: &mut String, name: &str, help: &str, value: impl fmt::Display) -> fmt::Result {
    writeln!(out, "# HELP {name} {help}")?;
    writeln!(out, "# TYPE {name} counter")?;
    writeln!(out, "{name} {value}")
}
