//! Pluggable time source.
//!
//! Renewal scheduling waits on timers measured in days; tests cannot sit
//! through that on the real clock. Everything that sleeps takes an
//! `Arc<dyn Clock>` and asks it for timers, so tests swap in [`MockClock`]
//! and drive virtual time with [`MockClock::tick`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A time source that can report the current instant and create one-shot
/// timers.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// A timer that fires once after `d`. Non-positive durations fire
    /// immediately.
    fn timer(&self, d: Duration) -> Timer;
}

/// One-shot timer handle returned by [`Clock::timer`].
///
/// Dropping the handle cancels the timer.
pub struct Timer {
    rx: oneshot::Receiver<()>,
}

impl Timer {
    /// Wait for the timer to fire.
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

/// Duration from `clock.now()` until `t`. Negative when `t` is in the past.
pub fn until(clock: &dyn Clock, t: DateTime<Utc>) -> Duration {
    t - clock.now()
}

/// Wall-clock implementation backed by tokio timers.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn timer(&self, d: Duration) -> Timer {
        let (tx, rx) = oneshot::channel();
        let dur = d.to_std().unwrap_or(std::time::Duration::ZERO);
        tokio::spawn(async move {
            tokio::time::sleep(dur).await;
            let _ = tx.send(());
        });
        Timer { rx }
    }
}

/// Virtual clock for tests.
///
/// Time only moves when [`tick`](MockClock::tick) is called; any timer whose
/// deadline is then in the past fires. Each timer fires at most once.
pub struct MockClock {
    inner: Mutex<MockInner>,
}

struct MockInner {
    now: DateTime<Utc>,
    timers: Vec<PendingTimer>,
}

struct PendingTimer {
    deadline: DateTime<Utc>,
    tx: Option<oneshot::Sender<()>>,
}

impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MockInner {
                now,
                timers: Vec::new(),
            }),
        })
    }

    /// Advance virtual time by `d` and fire every due timer.
    ///
    /// # Panics
    ///
    /// Panics if `d` is negative; time cannot flow backwards.
    pub fn tick(&self, d: Duration) {
        assert!(d >= Duration::zero(), "time cannot flow backwards");
        let mut inner = self.inner.lock();
        inner.now += d;
        let now = inner.now;
        for t in &mut inner.timers {
            if t.deadline < now {
                if let Some(tx) = t.tx.take() {
                    let _ = tx.send(());
                }
            }
        }
        inner.timers.retain(|t| t.tx.is_some());
    }

    /// Number of timers that have not fired yet. Tests use this to know a
    /// task has reached its wait before advancing time.
    pub fn pending_timers(&self) -> usize {
        self.inner.lock().timers.len()
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    fn timer(&self, d: Duration) -> Timer {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if d <= Duration::zero() {
            let _ = tx.send(());
        } else {
            let deadline = inner.now + d;
            inner.timers.push(PendingTimer {
                deadline,
                tx: Some(tx),
            });
        }
        Timer { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_clock_fires_short_timer() {
        let clock = SystemClock;
        let t = clock.timer(Duration::milliseconds(5));
        t.wait().await;
    }

    #[tokio::test]
    async fn test_mock_clock_fires_due_timers() {
        let clock = MockClock::new(DateTime::<Utc>::UNIX_EPOCH);
        let t = clock.timer(Duration::hours(1));
        clock.tick(Duration::minutes(30));
        // Not due yet; a second tick past the deadline fires it.
        clock.tick(Duration::hours(1));
        t.wait().await;
        assert_eq!(
            clock.now(),
            DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(90)
        );
    }

    #[tokio::test]
    async fn test_mock_clock_fires_nonpositive_immediately() {
        let clock = MockClock::new(DateTime::<Utc>::UNIX_EPOCH);
        clock.timer(Duration::zero()).wait().await;
        clock.timer(Duration::seconds(-5)).wait().await;
    }
}
