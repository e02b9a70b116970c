use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::Location;

/// Maximum per-axis jitter applied on each step, in degrees.
pub const WALK_JITTER_DEG: f64 = 0.0002;

/// Default starting point of the simulated courier.
pub const DEFAULT_ORIGIN: Location = Location::new(12.9716, 77.5946);

/// Slowly drifting courier coordinate shared by the socket and HTTP channels.
///
/// Coordinates are not clamped; a long run may drift arbitrarily far.
#[derive(Debug)]
pub struct CourierWalk<R = StdRng> {
    current: Location,
    rng: R,
}

impl CourierWalk<StdRng> {
    /// Creates a walk seeded from OS entropy.
    #[must_use]
    pub fn from_entropy(origin: Location) -> Self {
        Self::with_rng(origin, StdRng::from_os_rng())
    }
}

impl<R: Rng> CourierWalk<R> {
    #[must_use]
    pub const fn with_rng(origin: Location, rng: R) -> Self {
        Self {
            current: origin,
            rng,
        }
    }

    #[must_use]
    pub const fn current(&self) -> Location {
        self.current
    }

    /// Jitters the coordinate by `(random() - 0.5) * 0.0002` per axis and returns it.
    pub fn step(&mut self) -> Location {
        self.current.lat += (self.rng.random::<f64>() - 0.5) * WALK_JITTER_DEG;
        self.current.lng += (self.rng.random::<f64>() - 0.5) * WALK_JITTER_DEG;
        self.current
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::{CourierWalk, DEFAULT_ORIGIN, WALK_JITTER_DEG};

    #[test]
    fn step_moves_at_most_half_jitter_per_axis() {
        let mut walk = CourierWalk::with_rng(DEFAULT_ORIGIN, StdRng::seed_from_u64(7));
        let mut previous = walk.current();

        for _ in 0..1_000 {
            let next = walk.step();
            assert!((next.lat - previous.lat).abs() <= WALK_JITTER_DEG / 2.0);
            assert!((next.lng - previous.lng).abs() <= WALK_JITTER_DEG / 2.0);
            previous = next;
        }
    }

    #[test]
    fn seeded_walks_are_reproducible() {
        let mut left = CourierWalk::with_rng(DEFAULT_ORIGIN, StdRng::seed_from_u64(42));
        let mut right = CourierWalk::with_rng(DEFAULT_ORIGIN, StdRng::seed_from_u64(42));

        for _ in 0..32 {
            assert_eq!(left.step(), right.step());
        }
    }

    #[test]
    fn step_mutates_shared_state_in_place() {
        let mut walk = CourierWalk::with_rng(DEFAULT_ORIGIN, StdRng::seed_from_u64(3));
        let stepped = walk.step();

        assert_eq!(walk.current(), stepped);
        assert_ne!(stepped, DEFAULT_ORIGIN);
    }
}
