//! Splittable pseudo-random keys.
//!
//! A [`Key`] is never consumed in place. It either derives child keys with
//! [`Key::split`] or hands out a fresh random stream with [`Key::rng`]. Both
//! operations are pure functions of the key, so any computation that only
//! draws randomness through keys is reproducible from its top-level seed.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

const DRAW_DOMAIN: u64 = 0;
const SPLIT_DOMAIN: u64 = 1;

/// An opaque, copyable seed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    seed: u64,
    stream: u64,
}

impl Key {
    pub fn new(seed: u64) -> Self {
        Key { seed, stream: 0 }
    }

    fn chacha(&self, domain: u64) -> ChaCha8Rng {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&self.seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.stream.to_le_bytes());
        bytes[16..24].copy_from_slice(&domain.to_le_bytes());
        ChaCha8Rng::from_seed(bytes)
    }

    /// Derive `num` independent child keys.
    ///
    /// The first `k` children of `split(n)` do not depend on `n`.
    pub fn split(&self, num: usize) -> Vec<Key> {
        let mut rng = self.chacha(SPLIT_DOMAIN);
        (0..num)
            .map(|_| Key {
                seed: rng.next_u64(),
                stream: rng.next_u64(),
            })
            .collect()
    }

    pub fn split_array<const N: usize>(&self) -> [Key; N] {
        let mut rng = self.chacha(SPLIT_DOMAIN);
        std::array::from_fn(|_| Key {
            seed: rng.next_u64(),
            stream: rng.next_u64(),
        })
    }

    /// The random stream owned by this key.
    pub fn rng(&self) -> ChaCha8Rng {
        self.chacha(DRAW_DOMAIN)
    }
}

impl From<u64> for Key {
    fn from(seed: u64) -> Self {
        Key::new(seed)
    }
}
