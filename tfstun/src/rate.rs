//! Timing primitives: the paced frame clock, the receive-side rate cap and
//! the running averages behind the congestion feedback loop.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

pub const NSECS_IN_SEC: u64 = 1_000_000_000;

/// Monotonic periodic ticker with a runtime-adjustable period.
///
/// `wait` sleeps until one period past the previous anchor, then re-anchors
/// to now; a rate change takes effect on the next wait.
pub struct Periodic {
    timestamp: Mutex<Instant>,
    interval_ns: AtomicU64,
}

impl Periodic {
    pub fn new(interval_ns: u64) -> Self {
        Self {
            timestamp: Mutex::new(Instant::now()),
            interval_ns: AtomicU64::new(interval_ns),
        }
    }

    /// Atomically replace the period.
    pub fn change_period(&self, interval_ns: u64) {
        self.interval_ns.store(interval_ns, Ordering::Release);
    }

    pub fn period_ns(&self) -> u64 {
        self.interval_ns.load(Ordering::Acquire)
    }

    /// Sleep until the current period has elapsed since the last tick.
    pub fn wait(&self) {
        let interval = Duration::from_nanos(self.interval_ns.load(Ordering::Acquire));
        let mut timestamp = self.timestamp.lock().unwrap();
        let expire = *timestamp + interval;
        let now = Instant::now();
        if now < expire {
            thread::sleep(expire - now);
        }
        *timestamp = Instant::now();
    }
}

/// Paced frame clock: a `Periodic` programmed in frames per second, with
/// the current rate clamped to `[1, target]`.
///
/// The packetizer waits on it; the rate controller adjusts it from another
/// thread.
pub struct Pps {
    tick: Periodic,
    pps: AtomicU32,
    target: u32,
}

impl Pps {
    pub fn new(target: u32) -> Self {
        assert!(target >= 1);
        Self {
            tick: Periodic::new(NSECS_IN_SEC / target as u64),
            pps: AtomicU32::new(target),
            target,
        }
    }

    /// Current frames-per-second rate.
    pub fn current(&self) -> u32 {
        self.pps.load(Ordering::Acquire)
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Sleep until the next frame slot.
    pub fn wait(&self) {
        self.tick.wait();
    }

    /// Adjust the rate by `delta`, clamped to `[1, target]`. Returns the
    /// rate now in effect.
    pub fn change(&self, delta: i64) -> u32 {
        let cur = self.pps.load(Ordering::Acquire);
        let next = (cur as i64 + delta).clamp(1, self.target as i64) as u32;
        if next != cur {
            self.pps.store(next, Ordering::Release);
            self.tick.change_period(NSECS_IN_SEC / next as u64);
        }
        next
    }
}

/// Sliding-window byte-rate limiter over the last `window` packets.
///
/// Used on the receive side to simulate a congested path: a packet that
/// would push the windowed rate over the cap is reported as droppable and
/// not accounted.
pub struct RateLimit {
    rate: u64, // bytes per second
    overhead: u64,
    times: Vec<Option<Instant>>,
    sizes: Vec<u64>,
    total: u64,
    idx: usize,
    drops: u64,
}

impl RateLimit {
    /// `rate_bps` is in bits per second; `overhead` bytes are excluded from
    /// every packet before accounting.
    pub fn new(rate_bps: u64, overhead: u64, window: usize) -> Self {
        Self {
            rate: rate_bps / 8,
            overhead,
            times: vec![None; window],
            sizes: vec![0; window],
            total: 0,
            idx: 0,
            drops: 0,
        }
    }

    /// Account a packet of `n` bytes; true when it exceeds the cap and
    /// should be dropped.
    pub fn check(&mut self, mut n: u64) -> bool {
        if n > self.overhead {
            n -= self.overhead;
        }
        let i = self.idx;
        let new_total = self.total + n - self.sizes[i];
        let now = Instant::now();

        if let Some(oldest) = self.times[i] {
            let delta_ns = (now - oldest).as_nanos().max(1) as u64;
            let rate = new_total.saturating_mul(NSECS_IN_SEC) / delta_ns;
            if rate > self.rate {
                self.drops += 1;
                return true;
            }
        }

        self.total = new_total;
        self.times[i] = Some(now);
        self.sizes[i] = n;
        self.idx = (i + 1) % self.times.len();
        false
    }

    pub fn drops(&self) -> u64 {
        self.drops
    }
}

/// Running average over the last `runlen` samples.
///
/// The mean is clamped to `min` once any sample is nonzero. `add` returns
/// true each time the ring completes a full pass, which is what gates rate
/// adjustments to one per window.
pub struct RunAvg {
    values: Vec<u64>,
    index: usize,
    wrapped: bool,
    total: u64,
    average: u64,
    min: u64,
}

impl RunAvg {
    pub fn new(runlen: usize, min: u64) -> Self {
        assert!(runlen >= 1);
        Self {
            values: vec![0; runlen],
            index: 0,
            wrapped: false,
            total: 0,
            average: 0,
            min,
        }
    }

    pub fn add(&mut self, value: u64) -> bool {
        if self.wrapped {
            self.total -= self.values[self.index];
        }
        self.total += value;
        self.values[self.index] = value;
        self.index += 1;

        let denom = if self.wrapped { self.values.len() } else { self.index };
        self.average = self.total / denom as u64;
        if self.total > 0 && self.average < self.min {
            self.average = self.min;
        }

        if self.index != self.values.len() {
            return false;
        }
        self.wrapped = true;
        self.index = 0;
        true
    }

    pub fn average(&self) -> u64 {
        self.average
    }
}

/// Check-and-rearm interval timer for "at most every N" work.
pub struct IntervalTimer {
    anchor: Instant,
    period: Duration,
}

impl IntervalTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            anchor: Instant::now(),
            period,
        }
    }

    /// True when the period has elapsed; re-anchors to now when it fires.
    pub fn check(&mut self) -> bool {
        if self.anchor.elapsed() > self.period {
            self.anchor = Instant::now();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_periodic_waits_roughly_one_period() {
        let tick = Periodic::new(20_000_000); // 20ms
        tick.wait();
        let t0 = Instant::now();
        tick.wait();
        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_millis(15), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(200), "elapsed {elapsed:?}");
    }

    #[test]
    fn test_periodic_change_period() {
        let tick = Periodic::new(NSECS_IN_SEC);
        tick.change_period(1_000_000);
        assert_eq!(tick.period_ns(), 1_000_000);
        // A one-second period would make this test hang noticeably.
        let t0 = Instant::now();
        tick.wait();
        assert!(t0.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_pps_clamps_to_range() {
        let pps = Pps::new(100);
        assert_eq!(pps.current(), 100);
        assert_eq!(pps.change(50), 100); // already at target
        assert_eq!(pps.change(-40), 60);
        assert_eq!(pps.tick.period_ns(), NSECS_IN_SEC / 60);
        assert_eq!(pps.change(-1000), 1);
        assert_eq!(pps.change(2), 3);
        assert_eq!(pps.change(1000), 100);
    }

    #[test]
    fn test_runavg_window() {
        let mut avg = RunAvg::new(3, 1);
        assert!(!avg.add(3));
        assert_eq!(avg.average(), 3);
        assert!(!avg.add(6));
        // Partial window averages over the samples seen.
        assert_eq!(avg.average(), 4);
        assert!(avg.add(9));
        assert_eq!(avg.average(), 6);
        // Oldest value (3) rotates out.
        assert!(!avg.add(12));
        assert_eq!(avg.average(), 9);
        assert!(!avg.add(0));
        assert!(avg.add(0));
        assert_eq!(avg.average(), 4);
    }

    #[test]
    fn test_runavg_min_clamp() {
        let mut avg = RunAvg::new(4, 1);
        avg.add(1);
        avg.add(0);
        avg.add(0);
        avg.add(0);
        // Mean would be 0 but total is nonzero, so the minimum applies.
        assert_eq!(avg.average(), 1);
        // Once the nonzero sample rotates out, zero is reported.
        for _ in 0..4 {
            avg.add(0);
        }
        assert_eq!(avg.average(), 0);
    }

    #[test]
    fn test_ratelimit_caps_burst() {
        // 8 kbit/s = 1000 bytes/s; a burst of large packets must trip it.
        let mut rl = RateLimit::new(8_000, 0, 4);
        assert!(!rl.check(500));
        assert!(!rl.check(500));
        assert!(!rl.check(500));
        assert!(!rl.check(500));
        // Window is full of recent traffic far above 1000 B/s.
        assert!(rl.check(500));
        assert_eq!(rl.drops(), 1);
    }

    #[test]
    fn test_ratelimit_overhead_excluded() {
        let mut rl = RateLimit::new(8_000, 100, 2);
        assert!(!rl.check(100)); // n <= overhead: charged as-is
        assert_eq!(rl.sizes[0], 100);
        assert!(!rl.check(150));
        assert_eq!(rl.sizes[1], 50);
    }

    #[test]
    fn test_interval_timer() {
        let mut t = IntervalTimer::new(Duration::from_millis(10));
        assert!(!t.check());
        thread::sleep(Duration::from_millis(15));
        assert!(t.check());
        assert!(!t.check());
    }
}
