//! Counters the clients feed, and the reports the monitor derives from them.
//!
//! Reads and writes are tracked apart. In a mixed workload their latencies
//! have little to do with each other, and `TryAgain` rejections are worth
//! seeing per kind.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use crossbeam_utils::CachePadded;
use hdrhistogram::{Counter, Histogram};
use itertools::Itertools;
use serde_with::serde_as;
use vdev_disk_uring::{metrics::Metrics, ZioType};

const PERCENTILES: [f64; 5] = [50.0, 90.0, 99.0, 99.9, 99.99];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Read = 0,
    Write = 1,
}

impl Kind {
    pub(crate) fn of(io_type: ZioType) -> Self {
        match io_type {
            ZioType::Read => Kind::Read,
            ZioType::Write => Kind::Write,
            other => unreachable!("clients only issue reads and writes, got {other:?}"),
        }
    }
}

fn latency_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, 1_000_000_000, 3).unwrap()
}

struct KindCounters {
    done: AtomicU64,
    try_again: AtomicU64,
    latency_ns: Mutex<Histogram<u64>>,
}

impl KindCounters {
    fn new() -> Self {
        KindCounters {
            done: AtomicU64::new(0),
            try_again: AtomicU64::new(0),
            latency_ns: Mutex::new(latency_histogram()),
        }
    }
}

/// Written by the clients, each to its own entry, and drained by the monitor.
pub(crate) struct Recorder {
    clients: Vec<CachePadded<[KindCounters; 2]>>,
}

impl Recorder {
    pub(crate) fn new(num_clients: usize) -> Self {
        Recorder {
            clients: (0..num_clients)
                .map(|_| CachePadded::new([KindCounters::new(), KindCounters::new()]))
                .collect(),
        }
    }

    pub(crate) fn num_clients(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn record_done(&self, client: usize, kind: Kind, latency: Duration) {
        let counters = &self.clients[client][kind as usize];
        counters.done.fetch_add(1, Ordering::Relaxed);
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        counters.latency_ns.lock().unwrap().saturating_record(ns);
    }

    pub(crate) fn record_try_again(&self, client: usize, kind: Kind) {
        self.clients[client][kind as usize]
            .try_again
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Move everything recorded since the last call into `window`, and credit
    /// completed requests to `per_client_done`.
    pub(crate) fn drain_into(&self, window: &mut Window, per_client_done: &mut [u64]) {
        for (client, kinds) in self.clients.iter().enumerate() {
            for (counters, acc) in kinds.iter().zip(window.kinds.iter_mut()) {
                let done = counters.done.swap(0, Ordering::Relaxed);
                per_client_done[client] += done;
                acc.done += done;
                acc.try_again += counters.try_again.swap(0, Ordering::Relaxed);
                let mut h = counters.latency_ns.lock().unwrap();
                acc.latency_ns += &*h;
                h.clear();
            }
        }
    }
}

struct KindWindow {
    done: u64,
    try_again: u64,
    latency_ns: Histogram<u64>,
}

/// Activity over a span of time: one monitor period, or the whole run.
pub(crate) struct Window {
    started: Instant,
    ring_at_start: Metrics,
    kinds: [KindWindow; 2],
}

impl Window {
    pub(crate) fn start() -> Self {
        let kind = || KindWindow {
            done: 0,
            try_again: 0,
            latency_ns: latency_histogram(),
        };
        Window {
            started: Instant::now(),
            ring_at_start: vdev_disk_uring::metrics::global(),
            kinds: [kind(), kind()],
        }
    }

    pub(crate) fn merge(&mut self, other: &Window) {
        for (acc, kind) in self.kinds.iter_mut().zip(&other.kinds) {
            acc.done += kind.done;
            acc.try_again += kind.try_again;
            acc.latency_ns += &kind.latency_ns;
        }
    }

    pub(crate) fn report(&self, block_size: u64) -> WindowReport {
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        let kind_report = |kind: &KindWindow| {
            let settled = kind.done + kind.try_again;
            (settled > 0).then(|| {
                let h = &kind.latency_ns;
                KindReport {
                    iops: kind.done as f64 / secs,
                    bw_mibps: (kind.done * block_size) as f64 / f64::from(1 << 20) / secs,
                    try_again: kind.try_again,
                    try_again_ratio: kind.try_again as f64 / settled as f64,
                    latency_us: LatencyReport {
                        min: h.min().as_f64() / 1000.0,
                        mean: h.mean() / 1000.0,
                        max: h.max().as_f64() / 1000.0,
                        percentiles: PERCENTILES
                            .iter()
                            .map(|p| {
                                let us = h.value_at_percentile(*p).as_f64() / 1000.0;
                                (format!("p{p}"), us)
                            })
                            .collect(),
                    },
                }
            })
        };
        let now = vdev_disk_uring::metrics::global();
        WindowReport {
            elapsed,
            read: kind_report(&self.kinds[Kind::Read as usize]),
            write: kind_report(&self.kinds[Kind::Write as usize]),
            ring: RingReport {
                submitted: now.ops_submitted - self.ring_at_start.ops_submitted,
                completed: now.ops_completed - self.ring_at_start.ops_completed,
                rejected: now.submissions_rejected - self.ring_at_start.submissions_rejected,
            },
        }
    }
}

#[serde_as]
#[derive(serde::Serialize)]
pub(crate) struct WindowReport {
    #[serde_as(as = "serde_with::DurationSecondsWithFrac<f64>")]
    elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    read: Option<KindReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    write: Option<KindReport>,
    ring: RingReport,
}

#[derive(serde::Serialize)]
struct KindReport {
    iops: f64,
    bw_mibps: f64,
    try_again: u64,
    /// Share of settled requests that were rejected with `TryAgain`.
    try_again_ratio: f64,
    latency_us: LatencyReport,
}

#[derive(serde::Serialize)]
struct LatencyReport {
    min: f64,
    mean: f64,
    max: f64,
    percentiles: BTreeMap<String, f64>,
}

/// Engine counter deltas over the window, across all clients.
#[derive(serde::Serialize)]
struct RingReport {
    submitted: u64,
    completed: u64,
    rejected: u64,
}

impl std::fmt::Display for KindReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lat = &self.latency_us;
        write!(
            f,
            "iops={:.0} bw={:.2}MiB/s again={} ({:.1}%) lat_us min={:.0} mean={:.0} {} max={:.0}",
            self.iops,
            self.bw_mibps,
            self.try_again,
            self.try_again_ratio * 100.0,
            lat.min,
            lat.mean,
            PERCENTILES
                .iter()
                .map(|p| format!("p{p}={:.0}", lat.percentiles[&format!("p{p}")]))
                .join(" "),
            lat.max,
        )
    }
}

impl std::fmt::Display for WindowReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t={:.2}s", self.elapsed.as_secs_f64())?;
        if let Some(read) = &self.read {
            write!(f, " | read {read}")?;
        }
        if let Some(write) = &self.write {
            write!(f, " | write {write}")?;
        }
        write!(
            f,
            " | ring submitted={} completed={} rejected={}",
            self.ring.submitted, self.ring.completed, self.ring.rejected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_reported_separately() {
        let recorder = Recorder::new(2);
        recorder.record_done(0, Kind::Read, Duration::from_micros(100));
        recorder.record_done(1, Kind::Read, Duration::from_micros(300));
        recorder.record_try_again(1, Kind::Write);

        let mut window = Window::start();
        let mut per_client = vec![0; 2];
        recorder.drain_into(&mut window, &mut per_client);
        assert_eq!(per_client, vec![1, 1]);

        let report = window.report(4096);
        let read = report.read.as_ref().unwrap();
        assert_eq!(read.try_again, 0);
        assert!((read.latency_us.max - 300.0).abs() < 1.0, "{}", read.latency_us.max);
        let write = report.write.as_ref().unwrap();
        assert_eq!(write.try_again, 1);
        assert_eq!(write.try_again_ratio, 1.0);
        assert_eq!(write.iops, 0.0);

        // drained: a second window sees nothing
        let mut empty = Window::start();
        recorder.drain_into(&mut empty, &mut per_client);
        let report = empty.report(4096);
        assert!(report.read.is_none() && report.write.is_none());
        assert_eq!(per_client, vec![1, 1]);
    }

    #[test]
    fn merge_accumulates_periods() {
        let recorder = Recorder::new(1);
        let mut total = Window::start();
        for _ in 0..3 {
            recorder.record_done(0, Kind::Write, Duration::from_micros(50));
            let mut period = Window::start();
            recorder.drain_into(&mut period, &mut [0]);
            total.merge(&period);
        }
        let report = total.report(512);
        assert!(report.read.is_none());
        let write = report.write.as_ref().unwrap();
        assert_eq!(write.latency_us.percentiles.len(), PERCENTILES.len());
        assert_eq!(total.kinds[Kind::Write as usize].done, 3);
    }
}
