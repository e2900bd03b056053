//! Exponential moving averages over wall-clock time.

/// Smooths a running total with an e-folding window.
///
/// Time is passed explicitly so the rate math stays deterministic under test.
#[derive(Clone, Debug)]
pub struct Smoother {
    folding_time: f64,
    time: f64,
    total: f64,
    estimate: f64,
}

impl Smoother {
    pub fn new(folding_time: f64) -> Self {
        Self {
            folding_time,
            time: 0.0,
            total: 0.0,
            estimate: 0.0,
        }
    }

    /// Forget history and pin both the total and the estimate to `value`.
    pub fn reset(&mut self, value: f64) {
        self.time = 0.0;
        self.total = value;
        self.estimate = value;
    }

    pub fn set_total(&mut self, total: f64, now: f64) {
        self.add_delta(total - self.total, now);
    }

    pub fn add_delta(&mut self, delta: f64, now: f64) {
        self.update(now);
        self.total += delta;
    }

    /// The smoothed view of the total.
    pub fn smooth_total(&mut self, now: f64) -> f64 {
        self.update(now);
        self.estimate
    }

    /// The rate at which the estimate is currently chasing the total.
    pub fn smooth_rate(&mut self, now: f64) -> f64 {
        self.update(now);
        (self.total - self.estimate) / self.folding_time
    }

    fn update(&mut self, now: f64) {
        let elapsed = now - self.time;
        if elapsed > 0.0 {
            self.estimate += (self.total - self.estimate) * (1.0 - (-elapsed / self.folding_time).exp());
            self.time = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_converges_to_total() {
        let mut s = Smoother::new(2.0);
        s.reset(0.0);
        s.set_total(100.0, 0.0);
        // After many windows the estimate is effectively the total.
        assert!((s.smooth_total(40.0) - 100.0).abs() < 1e-6);
        assert!(s.smooth_rate(40.0).abs() < 1e-6);
    }

    #[test]
    fn reset_pins_estimate() {
        let mut s = Smoother::new(2.0);
        s.reset(50.0);
        assert_eq!(s.smooth_total(0.0), 50.0);
        assert_eq!(s.smooth_rate(0.0), 0.0);
    }

    #[test]
    fn rate_reflects_unconverged_delta() {
        let mut s = Smoother::new(2.0);
        s.reset(0.0);
        s.add_delta(10.0, 1.0);
        // Immediately after the delta, the rate is delta / window.
        assert!((s.smooth_rate(1.0) - 5.0).abs() < 1e-9);
    }
}
