use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// A process-local seeded pseudo-random source.
///
/// Every probe in the candidate-testing driver reseeds its own `Prng` so that
/// a solve with a given top-level seed is bit-reproducible regardless of how
/// many probes ran before it.
#[derive(Clone, Debug)]
pub struct Prng {
    seed: u64,
    rng: ChaCha8Rng,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        Prng {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Reset the stream to the state produced by the original seed.
    pub fn reseed(&mut self, seed: u64) {
        self.seed = seed;
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Draw a uniform sample in `[0, 1)`.
    pub fn random(&mut self) -> f64 {
        self.rng.random::<f64>()
    }

    /// Draw a uniform integer in `[0, bound)`. Used by RANSAC sampling.
    pub fn random_index(&mut self, bound: usize) -> usize {
        self.rng.random_range(0..bound)
    }

    /// Sample `k` distinct indices from `0..n` without replacement (partial
    /// Fisher-Yates). Used for RANSAC minimal-set sampling.
    pub fn sample_without_replacement(&mut self, n: usize, k: usize) -> Vec<usize> {
        let mut pool: Vec<usize> = (0..n).collect();
        let k = k.min(n);
        let mut out = Vec::with_capacity(k);
        for i in 0..k {
            let j = i + self.random_index(n - i);
            pool.swap(i, j);
            out.push(pool[i]);
        }
        out
    }
}

impl Default for Prng {
    fn default() -> Self {
        Prng::new(42)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reseeding_reproduces_stream() {
        let mut a = Prng::new(42);
        let seq_a: Vec<f64> = (0..8).map(|_| a.random()).collect();
        let mut b = Prng::new(1234);
        let _: Vec<f64> = (0..8).map(|_| b.random()).collect();
        b.reseed(42);
        let seq_b: Vec<f64> = (0..8).map(|_| b.random()).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn samples_are_in_unit_range_and_distinct_indices() {
        let mut rng = Prng::new(7);
        for _ in 0..1000 {
            let v = rng.random();
            assert!((0.0..1.0).contains(&v));
        }
        let idx = rng.sample_without_replacement(10, 4);
        assert_eq!(idx.len(), 4);
        let mut sorted = idx.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 4);
    }
}
