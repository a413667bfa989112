//! Byte counters for tunnel observability
//!
//! A `Counter` accumulates transferred bytes; `PeriodCounter` also
//! recomputes a bytes-per-second rate once per period so log lines can
//! show current throughput without a background task.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, ReadBuf};

/// Cumulative byte counter.
pub trait Counter: Send + Sync {
    /// Record `bytes` more transferred.
    fn add(&self, bytes: i64);

    /// Total bytes recorded.
    fn value(&self) -> i64;

    /// Most recently computed transfer rate, bytes per second.
    fn rate_per_sec(&self) -> i64;
}

/// Counter that refreshes its rate at most once per period.
pub struct PeriodCounter {
    value: AtomicI64,
    rate_per_sec: AtomicI64,
    period: Duration,
    last: Mutex<Sample>,
}

struct Sample {
    at: Instant,
    value: i64,
}

impl PeriodCounter {
    pub fn new(period: Duration) -> Self {
        Self {
            value: AtomicI64::new(0),
            rate_per_sec: AtomicI64::new(0),
            period,
            last: Mutex::new(Sample {
                at: Instant::now(),
                value: 0,
            }),
        }
    }

    fn refresh(&self) {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let elapsed = last.at.elapsed();
        if elapsed < self.period {
            return;
        }
        let value = self.value();
        let rate = ((value - last.value) as f64 / elapsed.as_secs_f64()) as i64;
        self.rate_per_sec.store(rate, Ordering::Relaxed);
        last.at = Instant::now();
        last.value = value;
    }
}

impl Counter for PeriodCounter {
    fn add(&self, bytes: i64) {
        self.value.fetch_add(bytes, Ordering::Relaxed);
        self.refresh();
    }

    fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    fn rate_per_sec(&self) -> i64 {
        self.rate_per_sec.load(Ordering::Relaxed)
    }
}

/// Reader wrapper that counts bytes as they arrive.
pub struct CountingReader<R> {
    inner: R,
    counter: Arc<dyn Counter>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, counter: Arc<dyn Counter>) -> Self {
        Self { inner, counter }
    }

    pub fn counter(&self) -> Arc<dyn Counter> {
        Arc::clone(&self.counter)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let filled_before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - filled_before;
                if n > 0 {
                    self.counter.add(n as i64);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

const UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Format a byte count for log lines, e.g. `1 MB`.
pub fn human_bytes(bytes: u64) -> String {
    let f = bytes as f64;
    if f < 1024.0 {
        return format!("{} {}", bytes, UNITS[0]);
    }
    let exp = (f.ln() / 1024f64.ln()) as usize;
    let exp = exp.min(UNITS.len() - 1);
    let rounded = (f / 1024f64.powi(exp as i32)) as u64;
    format!("{} {}", rounded, UNITS[exp])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let c = PeriodCounter::new(Duration::from_secs(1));
        c.add(100);
        c.add(24);
        assert_eq!(c.value(), 124);
    }

    #[test]
    fn rate_refreshes_after_period() {
        let c = PeriodCounter::new(Duration::from_millis(5));
        c.add(10_000);
        std::thread::sleep(Duration::from_millis(10));
        c.add(10_000);
        assert!(c.rate_per_sec() > 0);
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2 KB");
        assert_eq!(human_bytes(1536), "1 KB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3 MB");
    }

    #[tokio::test]
    async fn counting_reader_counts() {
        use tokio::io::AsyncReadExt;

        let counter: Arc<dyn Counter> = Arc::new(PeriodCounter::new(Duration::from_secs(1)));
        let data = b"0123456789".as_slice();
        let mut reader = CountingReader::new(data, Arc::clone(&counter));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(counter.value(), 10);
    }
}
