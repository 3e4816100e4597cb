use serde::{Deserialize, Serialize};

/// Small deterministic RNG driving every simulator decision.
///
/// A 64-bit LCG: reproducible across platforms and cheap to clone, so a
/// seed fully determines a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    /// Next pseudo-random `u64`.
    pub const fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        // The low bits of an LCG cycle quickly; mix the high half down.
        self.state ^ (self.state >> 33)
    }

    /// Next value in `[0, upper_exclusive)`, `0` for an empty range.
    pub const fn next_bounded(&mut self, upper_exclusive: u64) -> u64 {
        if upper_exclusive == 0 {
            return 0;
        }
        self.next_u64() % upper_exclusive
    }

    /// Uniform index into a collection of `len` elements.
    pub fn next_index(&mut self, len: usize) -> usize {
        let bound = u64::try_from(len).unwrap_or(u64::MAX);
        usize::try_from(self.next_bounded(bound)).unwrap_or(0)
    }

    /// Bernoulli trial with an integer percentage.
    pub const fn hit_rate_percent(&mut self, percent: u8) -> bool {
        if percent == 0 {
            return false;
        }
        if percent >= 100 {
            return true;
        }
        self.next_bounded(100) < percent as u64
    }

    /// Fisher-Yates shuffle of a copy of `items`.
    #[must_use]
    pub fn shuffled<T: Clone>(&mut self, items: &[T]) -> Vec<T> {
        let mut out = items.to_vec();
        for i in (1..out.len()).rev() {
            let j = self.next_index(i + 1);
            out.swap(i, j);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = DeterministicRng::new(7);
        let mut b = DeterministicRng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn bounded_stays_in_range() {
        let mut rng = DeterministicRng::new(1);
        assert_eq!(rng.next_bounded(0), 0);
        for _ in 0..1000 {
            assert!(rng.next_bounded(5) < 5);
            assert!(rng.next_index(3) < 3);
        }
    }

    #[test]
    fn rate_extremes() {
        let mut rng = DeterministicRng::new(3);
        assert!((0..100).all(|_| !rng.hit_rate_percent(0)));
        assert!((0..100).all(|_| rng.hit_rate_percent(100)));
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = DeterministicRng::new(11);
        let items: Vec<u32> = (0..20).collect();
        let mut shuffled = rng.shuffled(&items);
        assert_ne!(shuffled, items);
        shuffled.sort_unstable();
        assert_eq!(shuffled, items);
    }
}
