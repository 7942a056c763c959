//! Module that draws the waiting time between two critical section requests of a peer.

use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::time::Duration;

/// Longest pause [`Poisson::next_delay`] returns, whatever the rate.
pub const MAX_DELAY: Duration = Duration::from_secs(3600);

/// Poisson arrival process: inter-arrival times are exponentially distributed.
pub struct Poisson<R: Rng + ?Sized> {
    rng: Box<R>,
    rate: f64,
}

impl Poisson<SmallRng> {
    pub fn new(rate: f64, seed: u64) -> Self {
        Self {
            rng: Box::new(SmallRng::seed_from_u64(seed)),
            rate,
        }
    }
}

impl<R: Rng + ?Sized> Poisson<R> {
    /// Function that returns the time, in seconds, until the next event.
    pub fn time_for_next_event(&mut self) -> f64 {
        -(1.0f64 - self.rng.random::<f64>()).ln() / self.rate
    }

    /// Function that returns the pause before the next event, capped at [`MAX_DELAY`].
    pub fn next_delay(&mut self) -> Duration {
        Duration::try_from_secs_f64(self.time_for_next_event())
            .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
    }
}
