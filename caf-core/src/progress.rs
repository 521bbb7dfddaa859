use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(250);

/// Periodic progress reporter. Workers bump atomic counters; a ticker thread
/// logs a summary line every `interval`. Disabled instances are no-ops.
#[derive(Clone)]
pub struct Progress {
    enabled: bool,
    interval: Duration,
    stage: Arc<Mutex<String>>,
    files_done: Arc<AtomicU64>,
    files_total: Arc<AtomicU64>,
    bytes_done: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self::with_interval(enabled, Duration::from_secs(5))
    }

    pub fn with_interval(enabled: bool, interval: Duration) -> Self {
        Self {
            enabled,
            interval,
            stage: Arc::new(Mutex::new(String::new())),
            files_done: Arc::new(AtomicU64::new(0)),
            files_total: Arc::new(AtomicU64::new(0)),
            bytes_done: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_stage(&self, s: &str) {
        if self.enabled {
            if let Ok(mut stage) = self.stage.lock() {
                *stage = s.to_string();
            }
        }
    }

    /// Total is optional: a generation run bounded only by bytes has no file count.
    pub fn set_files_total(&self, n: u64) {
        self.files_total.store(n, Ordering::Relaxed);
    }

    pub fn inc_file(&self, bytes: u64) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn files_done(&self) -> u64 {
        self.files_done.load(Ordering::Relaxed)
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        self.running.store(true, Ordering::Relaxed);
        let this = self.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            let mut last = Instant::now();
            while this.running.load(Ordering::Relaxed) {
                thread::sleep(TICK);
                if !this.running.load(Ordering::Relaxed) {
                    break;
                }
                if last.elapsed() < this.interval {
                    continue;
                }
                last = Instant::now();
                this.report(t0.elapsed());
            }
        });
    }

    fn report(&self, elapsed: Duration) {
        let stage = self.stage.lock().map(|s| s.clone()).unwrap_or_default();
        let done = self.files_done();
        let total = self.files_total.load(Ordering::Relaxed);
        let bytes = self.bytes_done();
        let rate = bytes as f64 / elapsed.as_secs_f64().max(0.001) / (1 << 20) as f64;
        if total > 0 {
            let pct = done as f64 / total as f64 * 100.0;
            log::info!(
                "[{:>4}s] {} | files {}/{} ({:.0}%) | {} bytes | {:.1} MiB/s",
                elapsed.as_secs(),
                stage,
                done,
                total,
                pct,
                bytes,
                rate
            );
        } else {
            log::info!(
                "[{:>4}s] {} | files {} | {} bytes | {:.1} MiB/s",
                elapsed.as_secs(),
                stage,
                done,
                bytes,
                rate
            );
        }
    }

    pub fn stop(&self) {
        if self.enabled {
            self.running.store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_even_when_disabled() {
        let p = Progress::new(false);
        p.start();
        p.inc_file(10);
        p.inc_file(5);
        p.stop();
        assert_eq!(p.files_done(), 2);
        assert_eq!(p.bytes_done(), 15);
    }

    #[test]
    fn enabled_ticker_stops() {
        let p = Progress::with_interval(true, Duration::from_millis(1));
        p.set_stage("Testing");
        p.set_files_total(1);
        p.start();
        p.inc_file(1);
        thread::sleep(Duration::from_millis(300));
        p.stop();
        assert!(!p.running.load(Ordering::Relaxed));
    }
}
