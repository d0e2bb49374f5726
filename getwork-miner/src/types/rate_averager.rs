//! Sliding-window average of reported execution rates.
//!
//! Each completed range produces one instantaneous rate sample. Single
//! samples are noisy (a range that straddles a new-work switch, a scheduler
//! hiccup), so reporting uses the mean of the most recent few.

use std::collections::VecDeque;

use super::HashRate;

/// Averages the most recent `capacity` rate samples.
#[derive(Debug, Clone)]
pub struct RateAverager {
    capacity: usize,
    samples: VecDeque<u64>,
}

impl RateAverager {
    /// Create an averager over at most `capacity` samples (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Record a sample and return the updated average.
    pub fn record(&mut self, rate: HashRate) -> HashRate {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rate.0);
        self.average()
    }

    /// Mean of the retained samples; zero before the first sample.
    pub fn average(&self) -> HashRate {
        if self.samples.is_empty() {
            return HashRate(0);
        }
        let total: u128 = self.samples.iter().map(|&s| s as u128).sum();
        HashRate((total / self.samples.len() as u128) as u64)
    }
}

impl Default for RateAverager {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_over_window() {
        let mut avg = RateAverager::new(3);
        assert_eq!(avg.average(), HashRate(0));
        assert_eq!(avg.record(HashRate(30)), HashRate(30));
        assert_eq!(avg.record(HashRate(60)), HashRate(45));
        assert_eq!(avg.record(HashRate(90)), HashRate(60));
        // Oldest sample (30) drops out.
        assert_eq!(avg.record(HashRate(120)), HashRate(90));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut avg = RateAverager::new(0);
        avg.record(HashRate(5));
        assert_eq!(avg.record(HashRate(7)), HashRate(7));
    }
}
