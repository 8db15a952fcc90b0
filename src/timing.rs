//! Time sources and acquisition pacing.
//!
//! The ADC needs one full conversion period (about 90 ms) between reads. On
//! platforms with coarse scheduler granularity (Windows) sleeping alone
//! overshoots badly, so the pacer sleeps for half the interval and spins for
//! the rest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// ADC conversion period.
pub const ADC_READ_INTERVAL: Duration = Duration::from_millis(90);

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock was created.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);

    /// Whether time passes without calls to `sleep`. Busy waiting is only
    /// possible on clocks that do.
    fn advances_by_itself(&self) -> bool {
        true
    }
}

/// Wall-clock time.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual time that only moves when slept on or advanced explicitly.
///
/// Lets simulated runs of many minutes finish instantly. A busy-waiting
/// [`ReadPacer`] falls back to plain sleeps on this clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn advances_by_itself(&self) -> bool {
        false
    }
}

/// Enforces the minimum spacing between ADC reads.
#[derive(Debug, Clone)]
pub struct ReadPacer {
    interval: Duration,
    busy_wait: bool,
    last_read: Option<Duration>,
}

impl ReadPacer {
    pub fn new(interval: Duration, busy_wait: bool) -> Self {
        Self {
            interval,
            busy_wait,
            last_read: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until a read is allowed, then record the read time.
    pub fn wait(&mut self, clock: &dyn Clock) {
        if let Some(last) = self.last_read {
            let deadline = last + self.interval;
            let now = clock.now();
            if now < deadline {
                let remaining = deadline - now;
                if self.busy_wait && clock.advances_by_itself() {
                    clock.sleep(remaining.min(self.interval / 2));
                    while clock.now() < deadline {
                        std::hint::spin_loop();
                    }
                } else {
                    clock.sleep(remaining);
                }
            }
        }
        self.last_read = Some(clock.now());
    }
}

impl Default for ReadPacer {
    fn default() -> Self {
        Self::new(ADC_READ_INTERVAL, cfg!(windows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.sleep(Duration::from_millis(5));
        clock.advance(Duration::from_millis(10));
        assert_eq!(clock.now(), Duration::from_millis(15));
    }

    #[test]
    fn pacer_waits_out_the_remaining_interval() {
        let clock = ManualClock::new();
        let mut pacer = ReadPacer::new(Duration::from_millis(90), false);
        pacer.wait(&clock);
        assert_eq!(clock.now(), Duration::ZERO);

        clock.advance(Duration::from_millis(30));
        pacer.wait(&clock);
        assert_eq!(clock.now(), Duration::from_millis(90));

        // already late: no extra delay
        clock.advance(Duration::from_millis(120));
        pacer.wait(&clock);
        assert_eq!(clock.now(), Duration::from_millis(210));
    }

    #[test]
    fn busy_wait_on_virtual_time_sleeps_instead() {
        let clock = ManualClock::new();
        let mut pacer = ReadPacer::new(Duration::from_millis(90), true);
        pacer.wait(&clock);
        clock.advance(Duration::from_millis(10));
        pacer.wait(&clock);
        assert_eq!(clock.now(), Duration::from_millis(90));
        pacer.wait(&clock);
        assert_eq!(clock.now(), Duration::from_millis(180));
    }

    #[test]
    fn busy_wait_reaches_the_deadline() {
        let clock = SystemClock::default();
        let mut pacer = ReadPacer::new(Duration::from_millis(20), true);
        pacer.wait(&clock);
        let first = clock.now();
        pacer.wait(&clock);
        assert!(clock.now() - first >= Duration::from_millis(20));
    }
}
