//! Jittered poll intervals.
//!
//! Thousands of consumers configured with the same nominal interval must not
//! poll the broker in lockstep. Each instance derives its own offset from a
//! generator seeded with the SHA-256 of its identity, so:
//!
//! - no RNG state is shared between instances
//! - the same identity always gets the same interval (reproducible in tests)
//! - different identities are decorrelated
//!
//! The offset is drawn once and stays fixed for the instance's lifetime.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Smallest accepted jitter spread (fraction of the nominal interval).
pub const MIN_SPREAD: f64 = 0.2;

/// Largest accepted jitter spread (fraction of the nominal interval).
pub const MAX_SPREAD: f64 = 0.5;

/// Default spread, matching the ±50% offset consumers have always used.
pub const DEFAULT_SPREAD: f64 = 0.5;

/// Shortest interval ever returned; timers reject a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Compute the poll interval for the instance named `identity`.
///
/// The result lies in `[nominal * (1 - spread), nominal * (1 + spread)]`.
/// `spread` is clamped into [`MIN_SPREAD`, `MAX_SPREAD`].
pub fn jittered_interval(nominal: Duration, spread: f64, identity: &str) -> Duration {
    let spread = spread.clamp(MIN_SPREAD, MAX_SPREAD);
    let mut rng = seeded_rng(identity);
    let offset: f64 = rng.gen_range(-spread..=spread);

    nominal.mul_f64(1.0 + offset).max(MIN_INTERVAL)
}

fn seeded_rng(identity: &str) -> StdRng {
    let seed: [u8; 32] = Sha256::digest(identity.as_bytes()).into();
    StdRng::from_seed(seed)
}
