use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::registry::SessionRegistry;
use crate::transmission::{CounterSample, TransmissionController};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// Every n-th sample is followed by a cumulative summary.
pub const SUMMARY_EVERY: u64 = 5;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Throughput observed during one sampling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub tick: u64,
    pub received: u64,
    pub sent: u64,
    pub buffered: usize,
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} Received: {} KB/s   Sent: {} KB/s   BufferSize: {}",
            self.tick,
            self.received / KIB,
            self.sent / KIB,
            self.buffered
        )
    }
}

/// Cumulative totals. `bytes_*` come from the transport sessions, `measured`
/// from the collector's own running sum of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub rtt: Option<Duration>,
    pub measured: CounterSample,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stats# Received Total: {} MB   Sent Total: {} MB   RTT: {} ms",
            self.bytes_received / MIB,
            self.bytes_sent / MIB,
            self.rtt.unwrap_or_default().as_millis()
        )
    }
}

pub struct StatsCollector {
    sessions: Arc<SessionRegistry>,
    transmission: Arc<TransmissionController>,
    interval: Duration,
    tick: u64,
    totals: CounterSample,
}

impl StatsCollector {
    pub fn new(sessions: Arc<SessionRegistry>, transmission: Arc<TransmissionController>) -> Self {
        Self {
            sessions,
            transmission,
            interval: SAMPLE_INTERVAL,
            tick: 0,
            totals: CounterSample::default(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Bytes counted across every sample taken so far.
    pub fn totals(&self) -> CounterSample {
        self.totals
    }

    /// Reads and resets the byte counters.
    pub async fn sample(&mut self) -> Sample {
        let counted = self.transmission.counters().take();
        self.tick += 1;
        self.totals.sent += counted.sent;
        self.totals.received += counted.received;
        Sample {
            tick: self.tick,
            received: counted.received,
            sent: counted.sent,
            buffered: self.transmission.buffered_total().await,
        }
    }

    pub async fn summarize(&self) -> Summary {
        let mut summary = Summary {
            measured: self.totals,
            ..Summary::default()
        };
        for session in self.sessions.snapshot() {
            let stats = session.stats().await;
            summary.bytes_received += stats.bytes_received;
            summary.bytes_sent += stats.bytes_sent;
            summary.rtt = summary.rtt.max(stats.rtt);
        }
        summary
    }

    /// One sample, plus a summary on every `SUMMARY_EVERY`-th tick.
    pub async fn step(&mut self) -> (Sample, Option<Summary>) {
        let sample = self.sample().await;
        let summary = if sample.tick % SUMMARY_EVERY == 0 {
            Some(self.summarize().await)
        } else {
            None
        };
        (sample, summary)
    }

    /// Prints one line per interval until `ticks` samples were taken, or
    /// forever when `ticks` is `None`.
    pub async fn run(&mut self, ticks: Option<u64>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        let mut remaining = ticks;
        while remaining != Some(0) {
            interval.tick().await;
            let (sample, summary) = self.step().await;
            println!("{sample}");
            tracing::trace!(
                target = "stats",
                tick = sample.tick,
                sent = sample.sent,
                received = sample.received,
                buffered = sample.buffered,
                "sample"
            );
            if let Some(summary) = summary {
                println!("{summary}");
                println!();
            }
            remaining = remaining.map(|left| left - 1);
        }
    }
}
