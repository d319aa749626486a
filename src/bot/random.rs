// src/bot/random.rs - Injectable randomness for features that roll dice

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Source of randomness passed explicitly into features
pub trait RandomSource: Send + Sync {
    /// Uniform float in [0, 1)
    fn float64(&self) -> f64;

    /// `true` with probability `weight` (clamped to [0, 1])
    fn bool(&self, weight: f64) -> bool {
        self.float64() < weight.clamp(0.0, 1.0)
    }

    /// Uniform index in `0..len`; `len` must be non-zero
    fn pick_index(&self, len: usize) -> usize;
}

/// Pick one element uniformly, `None` for an empty slice
pub fn pick<'a, T>(random: &dyn RandomSource, items: &'a [T]) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    items.get(random.pick_index(items.len()).min(items.len() - 1))
}

/// OS-seeded generator used in production
pub struct ThreadRandom {
    rng: Mutex<StdRng>,
}

impl ThreadRandom {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Reproducible generator for simulations
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }
}

impl Default for ThreadRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for ThreadRandom {
    fn float64(&self) -> f64 {
        self.with_rng(|rng| rng.random::<f64>())
    }

    fn bool(&self, weight: f64) -> bool {
        let weight = weight.clamp(0.0, 1.0);
        self.with_rng(|rng| rng.random_bool(weight))
    }

    fn pick_index(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        self.with_rng(|rng| rng.random_range(0..len))
    }
}
