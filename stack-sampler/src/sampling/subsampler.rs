//! Rate limiting for allocation samples.
//!
//! Admits at most `target` events per fixed-length cycle. Within a cycle,
//! decisions use selection sampling against an estimate of the events still
//! to come: an event is admitted with probability `quota_left / events_left`.
//! The estimate starts from the count seen in the previous cycle and shrinks
//! with the time left and with this cycle's observed rate, so a cycle that
//! runs quieter than the last one still fills its quota instead of starving.
//!
//! With no history (first cycle, after a long gap, or a previous cycle that
//! saw no more than `target` events) the first `target` events are admitted.

use std::time::{Duration, Instant};

pub struct AllocationSubSampler {
    target: u32,
    cycle_length: Duration,
    cycle_start: Instant,
    seen_this_cycle: u32,
    sampled_this_cycle: u32,
    /// Events seen in the previous cycle; 0 after a full reset.
    seen_last_cycle: u32,
    rng: fastrand::Rng,
}

impl AllocationSubSampler {
    pub fn new(target: u32, cycle_length: Duration, now: Instant) -> Self {
        Self::with_rng(target, cycle_length, now, fastrand::Rng::new())
    }

    pub fn with_rng(target: u32, cycle_length: Duration, now: Instant, rng: fastrand::Rng) -> Self {
        Self {
            target,
            cycle_length: cycle_length.max(Duration::from_millis(1)),
            cycle_start: now,
            seen_this_cycle: 0,
            sampled_this_cycle: 0,
            seen_last_cycle: 0,
            rng,
        }
    }

    /// Decide whether the event arriving at `now` is admitted. O(1).
    pub fn should_sample_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.cycle_start) >= self.cycle_length {
            self.advance_cycle(now);
        }

        let seen_before = self.seen_this_cycle;
        self.seen_this_cycle = self.seen_this_cycle.saturating_add(1);

        if self.sampled_this_cycle >= self.target {
            return false;
        }
        let expected = self.seen_last_cycle;
        if expected <= self.target {
            self.sampled_this_cycle += 1;
            return true;
        }

        let quota_left = self.target - self.sampled_this_cycle;
        let events_left = self.estimate_events_left(now, seen_before, expected);
        if self.rng.u32(0..events_left) < quota_left {
            self.sampled_this_cycle += 1;
            true
        } else {
            false
        }
    }

    /// Events still to come in this cycle, counting the current one. The
    /// smallest of: what the last cycle's count leaves, that count scaled to
    /// the time left, and this cycle's own rate so far projected to its end.
    fn estimate_events_left(&self, now: Instant, seen_before: u32, expected: u32) -> u32 {
        let cycle = self.cycle_length.as_nanos();
        let elapsed = now.saturating_duration_since(self.cycle_start).as_nanos().min(cycle);
        let remaining = cycle - elapsed;

        let by_count = u128::from(expected.saturating_sub(seen_before));
        let by_time = div_ceil(u128::from(expected) * remaining, cycle);
        let mut estimate = by_count.min(by_time);
        if seen_before > 0 && elapsed > 0 {
            let by_rate = div_ceil(u128::from(seen_before) * remaining, elapsed);
            estimate = estimate.min(by_rate);
        }
        estimate.clamp(1, u128::from(u32::MAX)) as u32
    }

    /// Start a new cycle at `now`.
    ///
    /// The finished cycle's event count becomes the expectation for the new
    /// one, unless more than two cycle lengths passed since the last start, in
    /// which case that count is stale and the state resets fully.
    pub fn advance_cycle(&mut self, now: Instant) {
        let since_start = now.saturating_duration_since(self.cycle_start);
        self.seen_last_cycle = if since_start >= self.cycle_length * 2 {
            0
        } else {
            self.seen_this_cycle
        };
        self.seen_this_cycle = 0;
        self.sampled_this_cycle = 0;
        self.cycle_start = now;
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn sampled_this_cycle(&self) -> u32 {
        self.sampled_this_cycle
    }
}

fn div_ceil(n: u128, d: u128) -> u128 {
    n.div_ceil(d.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CYCLE: Duration = Duration::from_secs(1);

    fn sampler(target: u32, t0: Instant) -> AllocationSubSampler {
        AllocationSubSampler::with_rng(target, CYCLE, t0, fastrand::Rng::with_seed(0x5eed))
    }

    #[test]
    fn test_cycles_with_explicit_advance() {
        let t0 = Instant::now();
        let mut samp = sampler(10, t0);

        // Cycle 1: 20 events, no history, so the first 10 win.
        for _ in 0..10 {
            assert!(samp.should_sample_at(t0));
        }
        for _ in 0..10 {
            assert!(!samp.should_sample_at(t0));
        }

        // Cycle 2: 100 events against an expectation of 20.
        samp.advance_cycle(t0);
        let c2: Vec<bool> = (0..100).map(|_| samp.should_sample_at(t0)).collect();
        assert_eq!(c2.iter().filter(|&&s| s).count(), 10);
        assert!(!c2[..8].iter().all(|&s| s));

        // Cycle 3: 10 events against an expectation of 100; about one is picked.
        samp.advance_cycle(t0);
        let c3 = (0..10).filter(|_| samp.should_sample_at(t0)).count();
        assert!(c3 <= 4, "admitted {c3}");
    }

    #[test]
    fn test_time_driven_cycles() {
        let t0 = Instant::now();
        let mut samp = sampler(2, t0);
        assert!(samp.should_sample_at(t0));
        assert!(samp.should_sample_at(t0));
        assert!(!samp.should_sample_at(t0));
        assert!(!samp.should_sample_at(t0));

        // Next cycle expects 4 events for a quota of 2: a coin flip.
        let t1 = t0 + Duration::from_millis(1500);
        samp.should_sample_at(t1);

        // One event last cycle is below the quota, so the first two win again.
        let t2 = t1 + Duration::from_millis(1500);
        assert!(samp.should_sample_at(t2));
        assert!(samp.should_sample_at(t2));
        assert!(!samp.should_sample_at(t2));
        assert!(!samp.should_sample_at(t2));
    }

    #[test]
    fn test_long_gap_resets_history() {
        let t0 = Instant::now();
        let mut samp = sampler(3, t0);
        for _ in 0..1000 {
            samp.should_sample_at(t0);
        }
        let later = t0 + CYCLE * 5;
        for _ in 0..3 {
            assert!(samp.should_sample_at(later));
        }
        assert!(!samp.should_sample_at(later));
    }

    #[test]
    fn test_never_exceeds_target() {
        let t0 = Instant::now();
        let mut samp = sampler(5, t0);
        for cycle in 0..20u32 {
            let start = t0 + CYCLE * cycle;
            let arrivals = 1 + (cycle * 37) % 90;
            let mut admitted = 0;
            for i in 0..arrivals {
                let at = start + CYCLE * i / arrivals;
                if samp.should_sample_at(at) {
                    admitted += 1;
                }
            }
            assert!(admitted <= 5, "cycle {cycle}: admitted {admitted}");
        }
    }

    #[test]
    fn test_uniform_arrivals_fill_quota() {
        let t0 = Instant::now();
        let mut samp = sampler(10, t0);
        let per_cycle = 200u32;
        for cycle in 0..10u32 {
            let start = t0 + CYCLE * cycle;
            let admitted = (0..per_cycle)
                .filter(|&i| samp.should_sample_at(start + CYCLE * i / per_cycle))
                .count();
            assert_eq!(admitted, 10, "cycle {cycle}");
        }
    }

    #[test]
    fn test_quieter_cycle_catches_up_on_time() {
        let t0 = Instant::now();
        let mut samp = sampler(4, t0);
        for _ in 0..400 {
            samp.should_sample_at(t0);
        }
        // 40 events spread over the next cycle, a tenth of what was expected.
        let start = t0 + CYCLE;
        let admitted = (0..40u32)
            .filter(|&i| samp.should_sample_at(start + CYCLE * i / 40))
            .count();
        assert_eq!(admitted, 4);
    }
}
