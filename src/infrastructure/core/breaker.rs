use crate::domain::errors::BrokerError;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Trip state for the broker polling paths. After `failure_threshold`
/// consecutive failures the breaker rejects calls for `cooldown`; the first
/// call after the cooldown is the probe that decides whether it reseals.
///
/// Order submission does NOT go through the breaker: a submit that must not
/// happen is decided by the risk engine, not by transport health.
pub struct PollBreaker {
    name: &'static str,
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

struct BreakerState {
    consecutive_failures: u32,
    tripped_at: Option<Instant>,
}

impl PollBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            cooldown,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                tripped_at: None,
            }),
        }
    }

    /// Gate a call. Returns `BrokerError::Unavailable` while tripped.
    pub fn check(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if let Some(tripped_at) = state.tripped_at {
            if tripped_at.elapsed() < self.cooldown {
                return Err(BrokerError::Unavailable {
                    reason: format!("{} breaker open", self.name),
                });
            }
            // Cooldown over: allow one probe through.
            info!("PollBreaker [{}]: cooldown elapsed, probing", self.name);
            state.tripped_at = None;
            state.consecutive_failures = self.failure_threshold.saturating_sub(1);
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_failures = 0;
        state.tripped_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold && state.tripped_at.is_none() {
            warn!(
                "PollBreaker [{}]: tripped after {} consecutive failures, cooling down {:?}",
                self.name, state.consecutive_failures, self.cooldown
            );
            state.tripped_at = Some(Instant::now());
        }
    }

    pub fn is_tripped(&self) -> bool {
        let state = self.state.lock().expect("breaker lock poisoned");
        match state.tripped_at {
            Some(t) => t.elapsed() < self.cooldown,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold_and_cools_down() {
        let breaker = PollBreaker::new("quotes", 3, Duration::from_millis(50));

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert!(breaker.is_tripped());
        assert!(breaker.check().is_err());

        std::thread::sleep(Duration::from_millis(60));
        // Probe is allowed through after cooldown.
        assert!(breaker.check().is_ok());

        // A probe failure re-trips immediately.
        breaker.record_failure();
        assert!(breaker.check().is_err());
    }

    #[test]
    fn success_reseals() {
        let breaker = PollBreaker::new("account", 2, Duration::from_millis(10));
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.check().is_ok());
        breaker.record_success();
        assert!(!breaker.is_tripped());
        assert!(breaker.check().is_ok());
    }
}
