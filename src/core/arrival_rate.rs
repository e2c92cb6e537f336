use std::sync::Mutex;
use std::time::Instant;

/// Half-life for the decayed rate estimate. Chosen per spec §4.1 ("exponential
/// moving average with half-life ~30 s").
const HALF_LIFE_SECS: f64 = 30.0;

#[derive(Debug)]
struct State {
    rate: f64,
    last_update: Instant,
}

/// A windowed estimate of events/second, maintained per metric and per
/// backend (spec §4.1). `arrived()` is safe under concurrent callers and
/// `rate()` always returns a finite, non-negative value.
///
/// The estimator decays the stored rate by `exp(-lambda * dt)` on every read
/// or write and adds `lambda` per arrival, the same refill-then-consume shape
/// the teacher's token-bucket limiter uses, run in reverse: instead of
/// draining tokens to gate traffic, it accumulates them to describe traffic.
#[derive(Debug)]
pub struct ArrivalRate {
    state: Mutex<State>,
}

impl ArrivalRate {
    pub fn new() -> Self {
        ArrivalRate {
            state: Mutex::new(State { rate: 0.0, last_update: Instant::now() }),
        }
    }

    fn lambda() -> f64 {
        std::f64::consts::LN_2 / HALF_LIFE_SECS
    }

    pub fn arrived(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let dt = now.duration_since(state.last_update).as_secs_f64().max(0.0);
        let decay = (-Self::lambda() * dt).exp();
        state.rate = state.rate * decay + Self::lambda();
        state.last_update = now;
    }

    pub fn rate(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let dt = now.duration_since(state.last_update).as_secs_f64().max(0.0);
        let decay = (-Self::lambda() * dt).exp();
        let decayed = (state.rate * decay).max(0.0);
        // Persist the decay so successive rate() calls without an
        // intervening arrived() don't keep decaying from a stale timestamp.
        state.rate = decayed;
        state.last_update = now;
        decayed
    }
}

impl Default for ArrivalRate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_at_zero() {
        let rate = ArrivalRate::new();
        assert_eq!(rate.rate(), 0.0);
    }

    #[test]
    fn rises_with_arrivals_and_never_goes_negative() {
        let rate = ArrivalRate::new();
        for _ in 0..50 {
            rate.arrived();
        }
        let observed = rate.rate();
        assert!(observed > 0.0);
        assert!(observed.is_finite());
    }

    #[test]
    fn concurrent_arrivals_are_not_lost() {
        // P7: concurrent arrived() calls must all register. We can't observe
        // the exact count from rate() directly (it's a decayed estimate, not
        // a counter), so this exercises the lock discipline under contention
        // and checks the estimator stays finite and non-negative.
        let rate = Arc::new(ArrivalRate::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let rate = rate.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    rate.arrived();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let observed = rate.rate();
        assert!(observed.is_finite());
        assert!(observed >= 0.0);
    }
}
