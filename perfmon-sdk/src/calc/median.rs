//! Bounded-memory approximate median.

use std::collections::BTreeMap;

use perfmon_types::{MedianResult, OverflowFlag};

/// Default cap on the number of distinct buckets kept.
pub const DEFAULT_MAX_ELEMENTS: usize = 1000;

/// Default bucket width in milliseconds.
pub const DEFAULT_FACTOR: f64 = 10.0;

/// Median calculator over a bounded sorted frequency table.
///
/// Every value is rounded to the nearest multiple of `factor` and counted in
/// its bucket. When more than `max_elements` distinct buckets exist, the
/// bucket furthest from the running median is moved into an overflow counter
/// on its side. Values that later land in an overflowed region are counted
/// there directly, so every overflowed value stays on the correct side of
/// every kept value. If the median rank falls into an overflow region the
/// result is the nearest kept value flagged [`OverflowFlag::High`] (true
/// median is at least the estimate) or [`OverflowFlag::Low`] (at most).
#[derive(Debug, Clone, PartialEq)]
pub struct MedianCalculator {
    max_elements: usize,
    factor: f64,
    buckets: BTreeMap<i64, u64>,
    kept: u64,
    overflow_low: u64,
    overflow_high: u64,
}

enum Rank {
    Below,
    Kept(f64),
    Above,
}

impl MedianCalculator {
    /// Create a calculator. `max_elements` is clamped to at least 1 and a
    /// non-positive or non-finite `factor` falls back to 1.
    pub fn new(max_elements: usize, factor: f64) -> Self {
        let factor = if factor.is_finite() && factor > 0.0 {
            factor
        } else {
            1.0
        };
        Self {
            max_elements: max_elements.max(1),
            factor,
            buckets: BTreeMap::new(),
            kept: 0,
            overflow_low: 0,
            overflow_high: 0,
        }
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Number of values seen, including overflowed ones.
    pub fn sample_count(&self) -> u64 {
        self.overflow_low + self.kept + self.overflow_high
    }

    /// True if any value has been moved out of the kept buckets.
    pub fn has_overflowed(&self) -> bool {
        self.overflow_low > 0 || self.overflow_high > 0
    }

    /// Whether `other` was configured the same way, ignoring samples.
    pub fn same_definition(&self, other: &MedianCalculator) -> bool {
        self.max_elements == other.max_elements && self.factor == other.factor
    }

    /// A copy with the same configuration and no samples.
    pub fn fresh(&self) -> Self {
        Self::new(self.max_elements, self.factor)
    }

    pub fn reset(&mut self) {
        self.buckets.clear();
        self.kept = 0;
        self.overflow_low = 0;
        self.overflow_high = 0;
    }

    /// Count one value, in milliseconds.
    pub fn put_value(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let key = (value / self.factor).round() as i64;

        if self.overflow_high > 0 && self.max_key().is_some_and(|max| key > max) {
            self.overflow_high += 1;
            return;
        }
        if self.overflow_low > 0 && self.min_key().is_some_and(|min| key < min) {
            self.overflow_low += 1;
            return;
        }

        *self.buckets.entry(key).or_insert(0) += 1;
        self.kept += 1;

        while self.buckets.len() > self.max_elements {
            self.evict();
        }
    }

    /// Evict the bucket on the side away from the median.
    fn evict(&mut self) {
        let total = self.sample_count();
        let median_rank = (total - 1) / 2;
        let rank_in_kept = median_rank.saturating_sub(self.overflow_low);

        if rank_in_kept < self.kept / 2 {
            if let Some((_, count)) = self.buckets.pop_last() {
                self.kept -= count;
                self.overflow_high += count;
            }
        } else if let Some((_, count)) = self.buckets.pop_first() {
            self.kept -= count;
            self.overflow_low += count;
        }
    }

    fn max_key(&self) -> Option<i64> {
        self.buckets.last_key_value().map(|(k, _)| *k)
    }

    fn min_key(&self) -> Option<i64> {
        self.buckets.first_key_value().map(|(k, _)| *k)
    }

    fn value_of(&self, key: i64) -> f64 {
        key as f64 * self.factor
    }

    /// Locate the value with the given 0-based rank among all samples.
    fn rank(&self, rank: u64) -> Rank {
        if rank < self.overflow_low {
            return Rank::Below;
        }
        let mut remaining = rank - self.overflow_low;
        if remaining >= self.kept {
            return Rank::Above;
        }
        for (key, count) in &self.buckets {
            if remaining < *count {
                return Rank::Kept(self.value_of(*key));
            }
            remaining -= count;
        }
        Rank::Above
    }

    fn high_estimate(&self) -> MedianResult {
        match self.max_key() {
            Some(k) => MedianResult::estimate(self.value_of(k), OverflowFlag::High),
            None => MedianResult::not_available(),
        }
    }

    fn low_estimate(&self) -> MedianResult {
        match self.min_key() {
            Some(k) => MedianResult::estimate(self.value_of(k), OverflowFlag::Low),
            None => MedianResult::not_available(),
        }
    }

    /// The median of all values seen, `NA` when there are none.
    pub fn get_median(&self) -> MedianResult {
        let total = self.sample_count();
        if total == 0 {
            return MedianResult::not_available();
        }

        if total % 2 == 1 {
            return match self.rank(total / 2) {
                Rank::Kept(v) => MedianResult::exact(v),
                Rank::Above => self.high_estimate(),
                Rank::Below => self.low_estimate(),
            };
        }

        match (self.rank(total / 2 - 1), self.rank(total / 2)) {
            (Rank::Kept(a), Rank::Kept(b)) => MedianResult::exact((a + b) / 2.0),
            (Rank::Kept(a), Rank::Above) => MedianResult::estimate(a, OverflowFlag::High),
            (Rank::Below, Rank::Kept(b)) => MedianResult::estimate(b, OverflowFlag::Low),
            (_, Rank::Above) => self.high_estimate(),
            (Rank::Below, _) | (Rank::Above, _) | (Rank::Kept(_), Rank::Below) => {
                self.low_estimate()
            }
        }
    }
}

impl Default for MedianCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ELEMENTS, DEFAULT_FACTOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn true_median(values: &[f64]) -> f64 {
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = sorted.len();
        if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        }
    }

    #[test]
    fn empty_is_not_available() {
        let calc = MedianCalculator::default();
        assert_eq!(calc.get_median(), MedianResult::not_available());
        assert_eq!(calc.get_median().to_string(), "NA");
    }

    #[test]
    fn exact_median_odd_and_even() {
        let mut calc = MedianCalculator::new(100, 1.0);
        for v in [5.0, 1.0, 3.0] {
            calc.put_value(v);
        }
        assert_eq!(calc.get_median(), MedianResult::exact(3.0));

        calc.put_value(7.0);
        assert_eq!(calc.get_median(), MedianResult::exact(4.0));
    }

    #[test]
    fn values_are_rounded_to_factor() {
        let mut calc = MedianCalculator::new(100, 10.0);
        calc.put_value(14.0);
        calc.put_value(16.0);
        calc.put_value(26.0);
        assert_eq!(calc.get_median(), MedianResult::exact(20.0));
    }

    #[test]
    fn skewed_high_values_yield_high_estimate() {
        let mut calc = MedianCalculator::new(2, 1.0);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0] {
            calc.put_value(v);
        }
        let result = calc.get_median();
        assert!(calc.has_overflowed());
        assert_eq!(calc.sample_count(), 7);
        let m = result.median.unwrap();
        match result.overflow {
            Some(OverflowFlag::High) => assert!(m <= 4.0),
            Some(OverflowFlag::Low) => assert!(m >= 4.0),
            None => assert_eq!(m, 4.0),
        }
    }

    #[test]
    fn estimate_is_bounded_by_true_median() {
        for seed in 0..50u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let max_elements = rng.gen_range(1..20);
            let mut calc = MedianCalculator::new(max_elements, 1.0);
            let mut values = Vec::new();

            for _ in 0..rng.gen_range(1..400) {
                // Integer values keep rounding exact
                let v = rng.gen_range(0..200) as f64;
                values.push(v);
                calc.put_value(v);
            }

            let truth = true_median(&values);
            let result = calc.get_median();
            let estimate = result.median.unwrap();
            match result.overflow {
                Some(OverflowFlag::High) => assert!(
                    estimate <= truth,
                    "seed {seed}: {estimate} > true median {truth}"
                ),
                Some(OverflowFlag::Low) => assert!(
                    estimate >= truth,
                    "seed {seed}: {estimate} < true median {truth}"
                ),
                None => assert_eq!(estimate, truth, "seed {seed}"),
            }
        }
    }

    #[test]
    fn clone_is_independent() {
        let mut original = MedianCalculator::new(10, 1.0);
        original.put_value(1.0);
        let mut copy = original.clone();
        copy.put_value(100.0);
        copy.put_value(100.0);

        assert_eq!(original.sample_count(), 1);
        assert_eq!(original.get_median(), MedianResult::exact(1.0));
        assert_eq!(copy.get_median(), MedianResult::exact(100.0));
    }

    #[test]
    fn reset_and_fresh_clear_samples() {
        let mut calc = MedianCalculator::new(3, 2.0);
        calc.put_value(4.0);
        let fresh = calc.fresh();
        assert_eq!(fresh.sample_count(), 0);
        assert!(fresh.same_definition(&calc));

        calc.reset();
        assert_eq!(calc.get_median(), MedianResult::not_available());
    }

    #[test]
    fn invalid_settings_are_clamped() {
        let calc = MedianCalculator::new(0, -5.0);
        assert_eq!(calc.max_elements(), 1);
        assert_eq!(calc.factor(), 1.0);
    }
}
