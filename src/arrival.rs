//! Randomized inter-request wait times for the file-requesting client.
//!
//! Request arrivals are modeled as a renewal process with exponentially
//! distributed waits (rate `lambda`), discretized over whole-second buckets
//! `0..max_wait`. The exponential CDF is precomputed per bucket and
//! normalized so the table spans exactly [0, 1]; sampling is
//! inverse-transform: draw uniform in [0, 1), return the smallest bucket
//! whose cumulative value exceeds the draw.

use rand::Rng;

/// Precomputed, normalized CDF table. Immutable after construction and
/// shared read-only by every connection sampling from it.
#[derive(Debug)]
pub struct ArrivalProcess {
    cdf: Vec<f64>,
}

impl ArrivalProcess {
    /// Build the table for rate `lambda` over buckets `0..max_wait`.
    ///
    /// Bucket 0 is pinned at probability 0 so a sample is always at least
    /// one time unit. Panics on a non-positive rate or fewer than two
    /// buckets, both of which are configuration errors caught at startup.
    pub fn new(lambda: f64, max_wait: usize) -> Self {
        assert!(lambda > 0.0, "arrival rate must be positive");
        assert!(max_wait >= 2, "need at least two wait buckets");

        let mut cdf = vec![0.0; max_wait];
        for (i, slot) in cdf.iter_mut().enumerate().skip(1) {
            *slot = 1.0 - (-lambda * i as f64).exp();
        }
        // The raw table tops out below 1.0 when max_wait truncates the
        // distribution; normalize by the last entry so draws in [0, 1)
        // always land inside the table.
        let last = cdf[max_wait - 1];
        for slot in cdf.iter_mut().skip(1) {
            *slot /= last;
        }
        ArrivalProcess { cdf }
    }

    /// Number of buckets in the table.
    pub fn buckets(&self) -> usize {
        self.cdf.len()
    }

    /// Map one uniform draw in [0, 1) to a wait in whole time units: the
    /// smallest bucket index whose cumulative value exceeds the draw.
    /// Deterministic given the same draw and table.
    pub fn sample_at(&self, draw: f64) -> u64 {
        self.cdf.partition_point(|&c| c <= draw) as u64
    }

    /// Draw a wait time from the distribution.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> u64 {
        self.sample_at(rng.gen::<f64>())
    }
}
