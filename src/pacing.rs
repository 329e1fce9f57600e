//! Publication pacing for the send loop.
//!
//! Either a fixed delay per sample (`--spin`, `--sleep`) or a fixed-step
//! controller that nudges the delay up or down every sampling window until
//! the achieved rate matches `--pub-rate`.

use crate::sync::spin;
use std::time::{Duration, Instant};

/// Sleep adjustment per control step.
pub const SLEEP_STEP_NANOS: u64 = 1_000;

/// How the rate controller delays each sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingMethod {
    Spin,
    Sleep,
}

#[derive(Debug, Clone, Copy)]
struct RateControl {
    target: u64,
    method: PacingMethod,
    sample_period: u64,
    spins_per_usec: u64,
    last_check: Instant,
}

/// Per-sample delay applied by the publisher loop.
#[derive(Debug, Clone)]
pub struct Pacer {
    spin_count: u64,
    sleep_nanos: u64,
    control: Option<RateControl>,
}

impl Pacer {
    /// No delay at all.
    pub fn unpaced() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// The same spin count and sleep after every sample.
    pub fn fixed(spin_count: u64, sleep: Duration) -> Self {
        Self {
            spin_count,
            sleep_nanos: sleep.as_nanos() as u64,
            control: None,
        }
    }

    /// Converge on `target` samples per second, starting from the delay that
    /// would hold the rate with a zero-cost send. The rate is measured every
    /// `target / 100` samples (every sample below 100/s).
    pub fn rate(target: u64, method: PacingMethod, spins_per_usec: u64) -> Self {
        let target = target.max(1);
        let spins_per_usec = spins_per_usec.max(1);
        let sample_period = if target > 100 { target / 100 } else { 1 };
        let (spin_count, sleep_nanos) = match method {
            PacingMethod::Spin => (1_000_000 * spins_per_usec / target, 0),
            PacingMethod::Sleep => (0, 1_000_000_000 / target),
        };
        Self {
            spin_count,
            sleep_nanos,
            control: Some(RateControl {
                target,
                method,
                sample_period,
                spins_per_usec,
                last_check: Instant::now(),
            }),
        }
    }

    pub fn spin_count(&self) -> u64 {
        self.spin_count
    }

    pub fn sleep_nanos(&self) -> u64 {
        self.sleep_nanos
    }

    pub fn sample_period(&self) -> Option<u64> {
        self.control.map(|control| control.sample_period)
    }

    /// Restart the rate measurement window, right before the send loop.
    pub fn start(&mut self) {
        if let Some(control) = self.control.as_mut() {
            control.last_check = Instant::now();
        }
    }

    /// Apply the control step for iteration `loop_index`, then delay.
    pub fn pace(&mut self, loop_index: u64) {
        if let Some(control) = self.control.as_mut() {
            if loop_index > 0 && loop_index % control.sample_period == 0 {
                let now = Instant::now();
                let elapsed = now.duration_since(control.last_check).as_micros() as u64;
                control.last_check = now;
                let rate = if elapsed > 0 {
                    control.sample_period * 1_000_000 / elapsed
                } else {
                    control.sample_period * 1_000_000
                };
                let control = *control;
                self.adjust(&control, rate);
            }
        }
        if self.spin_count > 0 {
            spin(self.spin_count);
        }
        if self.sleep_nanos > 0 {
            std::thread::sleep(Duration::from_nanos(self.sleep_nanos));
        }
    }

    /// One fixed step toward the target given the rate just measured.
    fn adjust(&mut self, control: &RateControl, rate: u64) {
        let (value, step) = match control.method {
            PacingMethod::Spin => (&mut self.spin_count, control.spins_per_usec),
            PacingMethod::Sleep => (&mut self.sleep_nanos, SLEEP_STEP_NANOS),
        };
        if rate > control.target {
            *value += step;
        } else if rate < control.target {
            *value = value.saturating_sub(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_period_scales_with_rate() {
        assert_eq!(Pacer::rate(50, PacingMethod::Spin, 10).sample_period(), Some(1));
        assert_eq!(Pacer::rate(100, PacingMethod::Spin, 10).sample_period(), Some(1));
        assert_eq!(Pacer::rate(10_000, PacingMethod::Spin, 10).sample_period(), Some(100));
        assert_eq!(Pacer::fixed(5, Duration::ZERO).sample_period(), None);
    }

    #[test]
    fn initial_delay_matches_target() {
        let spin = Pacer::rate(1_000, PacingMethod::Spin, 7);
        assert_eq!(spin.spin_count(), 7_000);
        assert_eq!(spin.sleep_nanos(), 0);
        let sleep = Pacer::rate(1_000, PacingMethod::Sleep, 7);
        assert_eq!(sleep.sleep_nanos(), 1_000_000);
        assert_eq!(sleep.spin_count(), 0);
    }

    #[test]
    fn spin_steps_follow_measured_rate() {
        let mut pacer = Pacer::rate(1_000, PacingMethod::Spin, 7);
        let control = pacer.control.unwrap();
        let start = pacer.spin_count();
        pacer.adjust(&control, 2_000);
        pacer.adjust(&control, 2_000);
        assert_eq!(pacer.spin_count(), start + 14);
        pacer.adjust(&control, 500);
        assert_eq!(pacer.spin_count(), start + 7);
        pacer.adjust(&control, 1_000);
        assert_eq!(pacer.spin_count(), start + 7);
    }

    #[test]
    fn delay_never_goes_negative() {
        let mut pacer = Pacer::rate(1_000_000_000, PacingMethod::Sleep, 1);
        let control = pacer.control.unwrap();
        assert_eq!(pacer.sleep_nanos(), 1);
        pacer.adjust(&control, 10);
        assert_eq!(pacer.sleep_nanos(), 0);
        pacer.adjust(&control, 10);
        assert_eq!(pacer.sleep_nanos(), 0);
        pacer.adjust(&control, u64::MAX);
        assert_eq!(pacer.sleep_nanos(), SLEEP_STEP_NANOS);
    }

    #[test]
    fn fixed_pacer_has_no_controller() {
        let mut pacer = Pacer::fixed(0, Duration::from_micros(1));
        assert_eq!(pacer.sleep_nanos(), 1_000);
        pacer.pace(100);
        assert_eq!(pacer.sleep_nanos(), 1_000);
        assert_eq!(Pacer::unpaced().sample_period(), None);
    }
}
