// SPDX-License-Identifier: MIT

pub mod constants;
pub mod macros;
pub mod rolling_filter;

pub use rolling_filter::RollingFilter;

/// Protocol versions at which wire features became available.
///
/// A peer advertising a version below one of these thresholds simply does
/// not speak the corresponding message.
pub mod version {
    /// The protocol version we speak.
    pub const PROTOCOL_VERSION: u32 = 70015;

    /// Oldest protocol version we are willing to talk to.
    pub const MIN_VERSION: u32 = 70001;

    /// `getheaders` support.
    pub const HEADERS_VERSION: u32 = 31800;

    /// BIP31: pongs and ping nonces.
    pub const PONG_VERSION: u32 = 60000;

    /// BIP37: bloom filtering and the `mempool` message.
    pub const BLOOM_VERSION: u32 = 70011;

    /// BIP130: `sendheaders`.
    pub const SENDHEADERS_VERSION: u32 = 70012;

    /// BIP133: `feefilter`.
    pub const FEEFILTER_VERSION: u32 = 70013;

    /// BIP152: compact blocks.
    pub const COMPACT_VERSION: u32 = 70014;

    /// BIP152: witness compact blocks (version 2).
    pub const COMPACT_WITNESS_VERSION: u32 = 70015;
}

#[derive(Debug, Clone)]
/// A simple fraction struct that allows adding numbers to the numerator and denominator
///
/// If we want to compute a rolling-average, we would naively hold all elements in a list
/// and compute the average from it. This is not efficient, as it requires O(n) memory and
/// O(n) time to compute the average. Instead, we can use a fraction to compute the average
/// in O(1) time and O(1) memory, by keeping track of the sum of all elements and the count.
pub struct FractionAvg {
    numerator: u64,
    denominator: u64,
}

impl FractionAvg {
    /// Creates a new fraction with the given numerator and denominator
    pub fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Adds a number to the numerator and increments the denominator
    pub fn add(&mut self, other: u64) {
        self.numerator += other;
        self.denominator += 1;
    }

    /// Returns the average of the fraction
    pub fn value(&self) -> f64 {
        if self.denominator == 0 {
            return 0.0;
        }

        self.numerator as f64 / self.denominator as f64
    }
}

#[cfg(test)]
mod test {
    use super::FractionAvg;

    #[test]
    fn test_fraction_avg() {
        let mut avg = FractionAvg::new(0, 0);
        assert_eq!(avg.value(), 0.0);

        avg.add(2);
        avg.add(4);
        assert_eq!(avg.value(), 3.0);
    }
}
