//! Transfer progress reporting.
//!
//! A [`Progress`] counts bytes written through it and, once started, emits a
//! [`ProgressReport`] to its sink at a fixed frequency plus one final report on
//! stop. Counting is lock-free; the periodic reporter is a single tokio task.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Receives every report, periodic and final.
pub type ProgressSink = Arc<dyn Fn(&ProgressReport) + Send + Sync>;

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub label: String,
    pub current: u64,
    /// Expected size; 0 when unknown.
    pub total: u64,
    pub elapsed: Duration,
}

impl ProgressReport {
    /// Whether the transfer reached a known, non-zero expected size.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.current == self.total
    }

    /// Throughput in MiB per second since the reporter was created.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mib_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.current as f64 / 1024.0 / 1024.0 / secs
    }

    /// Completed share in percent, `None` when the total is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        (self.total > 0).then(|| self.current as f64 * 100.0 / self.total as f64)
    }
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_complete() {
            return write!(
                f,
                "Downloaded {} successfully in {:.0} seconds.",
                self.label,
                self.elapsed.as_secs_f64()
            );
        }

        write!(
            f,
            "Downloading {} {:.2} MiB/sec, {} of ",
            self.label,
            self.mib_per_sec(),
            bytes_size(self.current)
        )?;
        match self.percent() {
            Some(percent) => write!(f, "{} ({percent:.2}%)", bytes_size(self.total)),
            None => f.write_str("unknown"),
        }
    }
}

fn log_report(report: &ProgressReport) {
    tracing::info!(
        target: "cdk_http::progress",
        label = %report.label,
        current = report.current,
        total = report.total,
        "{report}"
    );
}

struct State {
    label: String,
    total: AtomicU64,
    current: AtomicU64,
    stopped: AtomicBool,
    started: Instant,
    sink: ProgressSink,
    last: Mutex<Option<ProgressReport>>,
}

impl State {
    fn snapshot(&self) -> ProgressReport {
        ProgressReport {
            label: self.label.clone(),
            current: self.current.load(Ordering::Acquire),
            total: self.total.load(Ordering::Acquire),
            elapsed: self.started.elapsed(),
        }
    }

    fn report(&self) -> ProgressReport {
        let report = self.snapshot();
        (self.sink)(&report);
        *self.last.lock() = Some(report.clone());
        report
    }
}

enum Lifecycle {
    Idle,
    Running {
        token: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Byte counter with periodic reporting.
pub struct Progress {
    state: Arc<State>,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("label", &self.state.label)
            .field("current", &self.current())
            .field("total", &self.total())
            .finish_non_exhaustive()
    }
}

impl Progress {
    /// Reporter logging through `tracing` under the `cdk_http::progress` target.
    pub fn new(label: impl Into<String>, total: u64) -> Self {
        Self::with_sink(label, total, Arc::new(log_report))
    }

    pub fn with_sink(label: impl Into<String>, total: u64, sink: ProgressSink) -> Self {
        Self {
            state: Arc::new(State {
                label: label.into(),
                total: AtomicU64::new(total),
                current: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                started: Instant::now(),
                sink,
                last: Mutex::new(None),
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn set_total(&self, total: u64) {
        self.state.total.store(total, Ordering::Release);
    }

    /// Spawn the periodic reporter. The first report fires after one period.
    ///
    /// Calling it again while running, or after [`stop`](Self::stop), does nothing.
    pub fn start(&self, frequency: Duration) {
        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return;
        }

        let token = CancellationToken::new();
        let state = Arc::clone(&self.state);
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + frequency, frequency);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        state.report();
                        break;
                    }
                    _ = ticks.tick() => {
                        state.report();
                    }
                }
            }
        });

        *lifecycle = Lifecycle::Running { token, handle };
    }

    /// Count `bytes`. Returns how many were accepted: all of them while running,
    /// none after stop.
    pub fn write(&self, bytes: &[u8]) -> usize {
        if self.state.stopped.load(Ordering::Acquire) {
            return 0;
        }
        self.state
            .current
            .fetch_add(bytes.len() as u64, Ordering::AcqRel);
        bytes.len()
    }

    /// Stop counting and emit the final report. Idempotent.
    pub async fn stop(&self) {
        self.state.stopped.store(true, Ordering::Release);
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        match previous {
            Lifecycle::Running { token, handle } => {
                token.cancel();
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "progress reporter task failed");
                }
            }
            Lifecycle::Idle => {
                self.state.report();
            }
            Lifecycle::Stopped => {}
        }
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.state.current.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.state.total.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }

    /// The most recent report handed to the sink.
    #[must_use]
    pub fn last_report(&self) -> Option<ProgressReport> {
        self.state.last.lock().clone()
    }

    /// Current state, without notifying the sink.
    #[must_use]
    pub fn report(&self) -> ProgressReport {
        self.state.snapshot()
    }
}

/// Dropping a running reporter aborts its task without a final report.
impl Drop for Progress {
    fn drop(&mut self) {
        if let Lifecycle::Running { handle, .. } = &*self.lifecycle.lock() {
            handle.abort();
        }
    }
}

impl io::Write for &Progress {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(Progress::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;
const TIB: u64 = 1 << 40;
const PIB: u64 = 1 << 50;
const EIB: u64 = 1 << 60;

/// Human-readable binary size: `512 B`, `1.50 KiB`, `3.00 GiB`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bytes_size(bytes: u64) -> String {
    let (unit, suffix) = match bytes {
        0..KIB => return format!("{bytes} B"),
        KIB..MIB => (KIB, "KiB"),
        MIB..GIB => (MIB, "MiB"),
        GIB..TIB => (GIB, "GiB"),
        TIB..PIB => (TIB, "TiB"),
        PIB..EIB => (PIB, "PiB"),
        _ => (EIB, "EiB"),
    };
    format!("{:.2} {suffix}", bytes as f64 / unit as f64)
}
