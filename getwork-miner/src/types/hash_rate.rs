//! Hashrate measurement type.

use std::time::Duration;

/// Hashrate measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HashRate(pub u64); // hashes per second

impl HashRate {
    /// Instantaneous rate for `hashes` completed in `elapsed`.
    ///
    /// Returns `None` for a zero or negative-length interval, which carries
    /// no rate information.
    pub fn from_execution(hashes: u64, elapsed: Duration) -> Option<Self> {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(Self((hashes as f64 / secs) as u64))
    }

    /// Get value as kilohashes per second
    pub fn as_kilohashes(&self) -> f64 {
        self.0 as f64 / 1_000.0
    }

    /// Get value as megahashes per second
    pub fn as_megahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Get value as gigahashes per second
    pub fn as_gigahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Format as human-readable string with appropriate units
    pub fn to_human_readable(&self) -> String {
        if self.0 >= 1_000_000_000 {
            format!("{:.2} GH/s", self.as_gigahashes())
        } else if self.0 >= 1_000_000 {
            format!("{:.2} MH/s", self.as_megahashes())
        } else if self.0 >= 1_000 {
            format!("{:.2} kH/s", self.as_kilohashes())
        } else {
            format!("{} H/s", self.0)
        }
    }
}

impl std::fmt::Display for HashRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_human_readable())
    }
}
