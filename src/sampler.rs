//! Demonstration sampling without replacement

use rand::Rng;

use crate::error::{MetaIclError, Result};

/// Draws k distinct demonstration indices from a pool, excluding the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemonstrationSampler {
    pub k: usize,
}

impl DemonstrationSampler {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    /// Sample `k` distinct indices from `[0, pool_size) \ {exclude}`.
    ///
    /// Every k-subset of the eligible indices is equally likely, and the
    /// returned order is itself uniformly random (the first index becomes the
    /// first-in-sequence demonstration).
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        pool_size: usize,
        exclude: usize,
    ) -> Result<Vec<usize>> {
        let eligible = if exclude < pool_size {
            pool_size - 1
        } else {
            pool_size
        };
        if eligible < self.k {
            return Err(MetaIclError::InsufficientPool {
                pool_size,
                k: self.k,
            });
        }

        // Sample over the compacted range and shift past the excluded slot.
        Ok(rand::seq::index::sample(rng, eligible, self.k)
            .into_iter()
            .map(|i| if i >= exclude { i + 1 } else { i })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn test_sample_excludes_query() {
        let sampler = DemonstrationSampler::new(3);
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..1000 {
            let draw = sampler.sample(&mut rng, 10, 5).unwrap();
            assert_eq!(draw.len(), 3);
            assert!(!draw.contains(&5));
            assert!(draw.iter().all(|&i| i < 10));
            let unique: HashSet<_> = draw.iter().collect();
            assert_eq!(unique.len(), 3);
        }
    }

    #[test]
    fn test_sample_is_roughly_uniform() {
        let sampler = DemonstrationSampler::new(3);
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts = [0usize; 10];
        let draws = 30_000;
        for _ in 0..draws {
            for i in sampler.sample(&mut rng, 10, 5).unwrap() {
                counts[i] += 1;
            }
        }
        assert_eq!(counts[5], 0);
        // 9 eligible indices share 3 * draws hits
        let expected = (3 * draws) as f64 / 9.0;
        for (i, &c) in counts.iter().enumerate() {
            if i != 5 {
                let deviation = (c as f64 - expected).abs() / expected;
                assert!(deviation < 0.05, "index {i}: {c} vs {expected}");
            }
        }
    }

    #[test]
    fn test_sample_whole_pool() {
        let sampler = DemonstrationSampler::new(4);
        let mut rng = StdRng::seed_from_u64(1);
        let mut draw = sampler.sample(&mut rng, 5, 0).unwrap();
        draw.sort_unstable();
        assert_eq!(draw, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_insufficient_pool() {
        let sampler = DemonstrationSampler::new(4);
        let mut rng = StdRng::seed_from_u64(1);
        let err = sampler.sample(&mut rng, 4, 2).unwrap_err();
        assert!(matches!(err, MetaIclError::InsufficientPool { pool_size: 4, k: 4 }));
    }

    #[test]
    fn test_sample_deterministic_for_seed() {
        let sampler = DemonstrationSampler::new(5);
        let a = sampler.sample(&mut StdRng::seed_from_u64(42), 100, 3).unwrap();
        let b = sampler.sample(&mut StdRng::seed_from_u64(42), 100, 3).unwrap();
        assert_eq!(a, b);
    }
}
