//! Per-priority transaction release accounting for the GRV server.

use vellum_core::Smoother;

/// Tracks how many transactions a priority class may release.
///
/// The rate keeper hands down a target rate; each starter firing computes a
/// `limit` from the smoothed difference between that rate and the rate we
/// actually released, banks unused allowance in `budget`, and admits work
/// through `can_start`.
#[derive(Debug)]
pub struct GrvTransactionRateInfo {
    pub rate: f64,
    pub limit: f64,
    pub budget: f64,
    disabled: bool,
    smooth_rate: Smoother,
    smooth_released: Smoother,
    window: f64,
    max_empty_queue_budget: f64,
    max_transactions_to_start: i64,
}

impl GrvTransactionRateInfo {
    pub fn new(
        rate: f64,
        window: f64,
        max_empty_queue_budget: f64,
        max_transactions_to_start: i64,
    ) -> Self {
        Self {
            rate,
            limit: 0.0,
            budget: 0.0,
            disabled: true,
            smooth_rate: Smoother::new(window),
            smooth_released: Smoother::new(window),
            window,
            max_empty_queue_budget,
            max_transactions_to_start,
        }
    }

    /// Recompute the window's limit from what we could have released but did
    /// not. The limit can go negative when the budget or higher priorities
    /// pushed us past our allowance.
    pub fn reset(&mut self, now: f64) {
        let release_rate = self.smooth_rate.smooth_total(now) - self.smooth_released.smooth_rate(now);
        self.limit = self.window * release_rate;
    }

    pub fn can_start(&self, already_started: i64, count: i64) -> bool {
        (already_started + count) as f64
            <= (self.limit + self.budget).min(self.max_transactions_to_start as f64)
    }

    /// Bank the unused portion of the limit, pro-rated by how much of the
    /// window elapsed. With chronically oversized batches this makes
    /// `limit + budget` climb linearly from zero to the batch size.
    pub fn update_budget(&mut self, started: i64, queue_empty: bool, elapsed: f64, now: f64) {
        self.budget =
            (self.budget + elapsed * (self.limit - started as f64) / self.window).max(0.0);
        if queue_empty {
            // Carrying a deep budget across idle periods would blunt the
            // response to workload changes.
            self.budget = self.budget.min(self.max_empty_queue_budget);
        }
        self.smooth_released.add_delta(started as f64, now);
    }

    /// Lease expiry: stop releasing anything until a new rate arrives.
    pub fn disable(&mut self) {
        self.disabled = true;
        self.rate = 0.0;
        self.smooth_rate.reset(0.0);
    }

    pub fn set_rate(&mut self, rate: f64, now: f64) {
        debug_assert!(rate.is_finite() && rate >= 0.0);
        self.rate = rate;
        if self.disabled {
            self.smooth_rate.reset(rate);
            self.disabled = false;
        } else {
            self.smooth_rate.set_total(rate, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> GrvTransactionRateInfo {
        GrvTransactionRateInfo::new(0.0, 2.0, 10.0, 100_000)
    }

    #[test]
    fn zero_elapsed_update_is_a_no_op() {
        let mut rate = info();
        rate.set_rate(100.0, 0.0);
        rate.reset(0.0);
        let before = rate.budget;
        rate.update_budget(0, true, 0.0, 0.0);
        assert_eq!(rate.budget, before);
    }

    #[test]
    fn empty_queue_caps_budget() {
        let mut rate = info();
        rate.set_rate(1_000.0, 0.0);
        for i in 1..50 {
            let now = i as f64 * 0.1;
            rate.reset(now);
            rate.update_budget(0, true, 0.1, now);
            assert!(rate.budget >= 0.0);
            assert!(rate.budget <= 10.0);
        }
    }

    #[test]
    fn budget_never_goes_negative() {
        let mut rate = info();
        rate.set_rate(10.0, 0.0);
        rate.reset(0.0);
        rate.update_budget(1_000, false, 1.0, 1.0);
        assert!(rate.budget >= 0.0);
    }

    #[test]
    fn can_start_respects_limit_plus_budget() {
        let mut rate = info();
        rate.set_rate(100.0, 0.0);
        rate.reset(1.0);
        // A freshly set rate smooths toward 100 with nothing released, so a
        // healthy chunk of the window's allowance is available.
        assert!(rate.limit > 0.0);
        assert!(rate.can_start(0, 1));
        assert!(!rate.can_start(0, 1_000_000));
    }

    #[test]
    fn disable_zeroes_the_release_rate() {
        let mut rate = info();
        rate.set_rate(100.0, 0.0);
        rate.disable();
        rate.reset(10.0);
        assert!(rate.limit <= 0.0);
        assert_eq!(rate.rate, 0.0);
    }
}
