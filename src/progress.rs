//! Shared progress tracking: counters plus a heartbeat/stall monitor.
//!
//! Pipeline phases bump [`ProgressCounters`]; [`Heartbeat`] logs them on a
//! fixed interval and reports a stall when nothing moved for a while. A
//! stall is only reported, never acted on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

/// Counters shared between a running phase and its heartbeat.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    bytes: AtomicU64,
    total_bytes: AtomicU64,
    statements: AtomicU64,
    rows: AtomicU64,
    stalls: AtomicU64,
    phase: Mutex<String>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub bytes: u64,
    pub total_bytes: u64,
    pub statements: u64,
    pub rows: u64,
}

impl ProgressCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a new phase; byte counters reset, item counters keep running.
    pub fn set_phase(&self, phase: &str, total_bytes: u64) {
        if let Ok(mut p) = self.phase.lock() {
            p.clear();
            p.push_str(phase);
        }
        self.bytes.store(0, Ordering::Relaxed);
        self.total_bytes.store(total_bytes, Ordering::Relaxed);
    }

    pub fn phase(&self) -> String {
        self.phase.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn set_bytes(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn add_statements(&self, n: u64) {
        self.statements.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rows(&self, n: u64) {
        self.rows.fetch_add(n, Ordering::Relaxed);
    }

    /// Stall notices raised so far
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            statements: self.statements.load(Ordering::Relaxed),
            rows: self.rows.load(Ordering::Relaxed),
        }
    }
}

/// Background heartbeat task. Dropping it without [`Heartbeat::stop`]
/// leaves the task to end with the runtime.
pub struct Heartbeat {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn spawn(
        label: impl Into<String>,
        counters: Arc<ProgressCounters>,
        every: Duration,
        stall_after: Duration,
    ) -> Self {
        let label = label.into();
        let (tx, mut rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut last = counters.snapshot();
            let mut last_change = Instant::now();
            let mut stalled = false;

            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {}
                }

                let now = counters.snapshot();
                if now != last {
                    last = now;
                    last_change = Instant::now();
                    stalled = false;
                    info!(
                        db = %label,
                        phase = %counters.phase(),
                        bytes = now.bytes,
                        percent = percent(now.bytes, now.total_bytes),
                        statements = now.statements,
                        rows = now.rows,
                        "heartbeat"
                    );
                } else if !stalled && last_change.elapsed() >= stall_after {
                    stalled = true;
                    counters.stalls.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        db = %label,
                        phase = %counters.phase(),
                        idle_secs = last_change.elapsed().as_secs(),
                        "no progress; operation may be stalled"
                    );
                }
            }
        });

        Self {
            shutdown: Some(tx),
            handle,
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

fn percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        0
    } else {
        (done.min(total) * 100) / total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(50, 200), 25);
        assert_eq!(percent(300, 200), 100);
    }

    #[test]
    fn test_set_phase_resets_bytes_only() {
        let c = ProgressCounters::new();
        c.set_bytes(10);
        c.add_statements(3);
        c.set_phase("load", 99);
        let s = c.snapshot();
        assert_eq!(s.bytes, 0);
        assert_eq!(s.total_bytes, 99);
        assert_eq!(s.statements, 3);
        assert_eq!(c.phase(), "load");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_reported_once_until_progress_resumes() {
        let c = ProgressCounters::new();
        let hb = Heartbeat::spawn(
            "db",
            Arc::clone(&c),
            Duration::from_secs(10),
            Duration::from_secs(30),
        );

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(c.stalls(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(c.stalls(), 1);

        c.add_rows(5);
        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(c.stalls(), 2);

        hb.stop().await;
    }
}
