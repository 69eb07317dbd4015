//! Centroid digest for online percentile estimation.
//!
//! Memory is bounded by the centroid cap regardless of how many values are
//! recorded. Invariants:
//! - centroids are sorted by mean
//! - the sum of centroid counts equals `count()`
//! - at most `1.5 × max_centroids` centroids exist at any time

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CENTROIDS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub mean: f64,
    pub count: u64,
}

impl Centroid {
    fn merge(&mut self, mean: f64, count: u64) {
        let total = self.count + count;
        self.mean = (self.mean * self.count as f64 + mean * count as f64) / total as f64;
        self.count = total;
    }
}

#[derive(Debug, Clone)]
pub struct CentroidDigest {
    centroids: Vec<Centroid>,
    max_centroids: usize,
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
}

impl Default for CentroidDigest {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CENTROIDS)
    }
}

impl CentroidDigest {
    /// `max_centroids` below 2 is raised to 2.
    pub fn new(max_centroids: usize) -> Self {
        let max_centroids = max_centroids.max(2);
        Self {
            centroids: Vec::with_capacity(max_centroids + max_centroids / 2 + 1),
            max_centroids,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
        }
    }

    /// Record one observation. Non-finite values are ignored.
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }

        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let len = self.centroids.len();
        let pos = self.centroids.partition_point(|c| c.mean < value);
        let singleton = Centroid {
            mean: value,
            count: 1,
        };

        // Values beyond either end always get their own centroid so the
        // tails stay sharp; compression bounds the growth.
        if len < self.max_centroids || pos == 0 || pos == len {
            self.centroids.insert(pos, singleton);
        } else {
            let nearest = if value - self.centroids[pos - 1].mean
                <= self.centroids[pos].mean - value
            {
                pos - 1
            } else {
                pos
            };
            self.centroids[nearest].merge(value, 1);
        }

        if self.centroids.len() > self.max_centroids * 3 / 2 {
            self.compress();
        }
    }

    /// Merge adjacent pairs until the centroid count is back at the cap.
    ///
    /// The pair with the smallest combined count goes first; ties prefer the
    /// closest means.
    pub fn compress(&mut self) {
        while self.centroids.len() > self.max_centroids {
            let mut best = 0;
            let mut best_key = (u64::MAX, f64::INFINITY);
            for (i, pair) in self.centroids.windows(2).enumerate() {
                let key = (pair[0].count + pair[1].count, pair[1].mean - pair[0].mean);
                if key.0 < best_key.0 || (key.0 == best_key.0 && key.1 < best_key.1) {
                    best = i;
                    best_key = key;
                }
            }
            let absorbed = self.centroids.remove(best + 1);
            self.centroids[best].merge(absorbed.mean, absorbed.count);
        }
    }

    /// Estimate the value at quantile `q` (0.0..=1.0).
    ///
    /// Each centroid is anchored at the middle of its cumulative count; the
    /// estimate interpolates linearly between neighbouring anchors, with
    /// `min` at rank 0 and `max` at rank `count()`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        if q == 0.0 {
            return Some(self.min);
        }
        if q == 1.0 {
            return Some(self.max);
        }

        let target = q * self.count as f64;
        let mut prev = (0.0, self.min);
        let mut cumulative = 0.0;

        for centroid in &self.centroids {
            let anchor = (cumulative + centroid.count as f64 / 2.0, centroid.mean);
            if target < anchor.0 {
                return Some(interpolate(prev, anchor, target));
            }
            cumulative += centroid.count as f64;
            prev = anchor;
        }

        Some(interpolate(prev, (self.count as f64, self.max), target))
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn centroids(&self) -> &[Centroid] {
        &self.centroids
    }

    pub fn max_centroids(&self) -> usize {
        self.max_centroids
    }
}

fn interpolate((x0, y0): (f64, f64), (x1, y1): (f64, f64), x: f64) -> f64 {
    if x1 <= x0 {
        return y1;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn exact(sorted: &[f64], q: f64) -> f64 {
        let rank = (q * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }

    fn assert_close(estimate: f64, expected: f64, tolerance: f64) {
        let err = (estimate - expected).abs() / expected.abs();
        assert!(
            err <= tolerance,
            "estimate {estimate} vs exact {expected} (relative error {err})"
        );
    }

    #[test]
    fn test_empty_digest() {
        let digest = CentroidDigest::default();
        assert_eq!(digest.quantile(0.5), None);
        assert_eq!(digest.min(), None);
        assert_eq!(digest.mean(), None);
    }

    #[test]
    fn test_single_value() {
        let mut digest = CentroidDigest::default();
        digest.add(42.0);
        assert_eq!(digest.quantile(0.01), Some(42.0));
        assert_eq!(digest.quantile(0.5), Some(42.0));
        assert_eq!(digest.quantile(0.99), Some(42.0));
    }

    #[test]
    fn test_uniform_percentiles_within_five_percent() {
        let mut values: Vec<f64> = (1..=1000).map(f64::from).collect();
        values.shuffle(&mut StdRng::seed_from_u64(42));

        let mut digest = CentroidDigest::default();
        for v in &values {
            digest.add(*v);
        }

        let mut sorted = values.clone();
        sorted.sort_by(f64::total_cmp);

        for q in [0.5, 0.95, 0.99] {
            assert_close(digest.quantile(q).unwrap(), exact(&sorted, q), 0.05);
        }
        assert_eq!(digest.min(), Some(1.0));
        assert_eq!(digest.max(), Some(1000.0));
        assert_close(digest.mean().unwrap(), 500.5, 1e-9);
    }

    #[test]
    fn test_counts_are_conserved_and_sorted() {
        let mut values: Vec<f64> = (0..5000).map(|i| f64::from(i % 997) * 1.5).collect();
        values.shuffle(&mut StdRng::seed_from_u64(3));

        let mut digest = CentroidDigest::new(50);
        for v in values {
            digest.add(v);
        }

        let total: u64 = digest.centroids().iter().map(|c| c.count).sum();
        assert_eq!(total, digest.count());
        assert!(digest
            .centroids()
            .windows(2)
            .all(|pair| pair[0].mean <= pair[1].mean));
    }

    #[test]
    fn test_memory_is_bounded() {
        let mut digest = CentroidDigest::default();
        // Monotonic input keeps landing past the last centroid.
        for i in 0..100_000 {
            digest.add(f64::from(i));
            assert!(digest.centroids().len() <= DEFAULT_MAX_CENTROIDS * 3 / 2);
        }
        assert_eq!(digest.count(), 100_000);
    }

    #[test]
    fn test_compress_reaches_cap() {
        let mut digest = CentroidDigest::new(10);
        for i in 0..14 {
            digest.add(f64::from(i));
        }
        assert_eq!(digest.centroids().len(), 14);

        digest.compress();
        assert_eq!(digest.centroids().len(), 10);
        assert_eq!(digest.centroids().iter().map(|c| c.count).sum::<u64>(), 14);
    }

    #[test]
    fn test_non_finite_values_ignored() {
        let mut digest = CentroidDigest::default();
        digest.add(f64::NAN);
        digest.add(f64::INFINITY);
        digest.add(3.0);
        assert_eq!(digest.count(), 1);
    }
}
