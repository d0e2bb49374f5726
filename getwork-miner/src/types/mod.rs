//! Core types for getwork-miner.
//!
//! Small value types shared by the prefetch queue, the work queue and the
//! daemon's reporting.

mod hash_rate;
mod rate_averager;

pub use hash_rate::HashRate;
pub use rate_averager::RateAverager;
