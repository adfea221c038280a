use tracing::trace;

use crate::types::{ConnectionState, ConnectionStatus, Transition};

/// Counts probe outcomes and decides when the circuit trips or recovers.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: ConnectionState,
    trip_threshold: u32,
}

impl CircuitBreaker {
    /// A threshold of zero behaves like one.
    pub fn new(initial: ConnectionState, trip_threshold: u32) -> Self {
        Self {
            state: initial,
            trip_threshold: trip_threshold.max(1),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn trip_threshold(&self) -> u32 {
        self.trip_threshold
    }

    /// Records one probe outcome.
    ///
    /// Returns the transition to notify about, if any: `Recovered` for the
    /// first success after the circuit left `Closed`, `Tripped` when
    /// failures reach the threshold while the circuit is not already open.
    pub fn record(&mut self, success: bool) -> Option<Transition> {
        let prev = self.state.status;
        let transition = if success {
            self.state.attempts = 0;
            if prev == ConnectionStatus::Closed {
                None
            } else {
                self.state.status = ConnectionStatus::Closed;
                Some(Transition::Recovered)
            }
        } else {
            self.state.attempts = self.state.attempts.saturating_add(1);
            if self.state.attempts >= self.trip_threshold && prev != ConnectionStatus::Open {
                self.state.status = ConnectionStatus::Open;
                Some(Transition::Tripped)
            } else {
                if prev == ConnectionStatus::Closed {
                    self.state.status = ConnectionStatus::HalfClosed;
                }
                None
            }
        };
        trace!(
            success,
            %prev,
            next = %self.state.status,
            attempts = self.state.attempts,
            "circuit updated"
        );
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(ConnectionState::default(), threshold)
    }

    #[test]
    fn failures_half_close_then_trip() {
        let mut breaker = closed(3);
        let mut seen = vec![breaker.state().status];
        let mut transitions = Vec::new();
        for _ in 0..3 {
            transitions.extend(breaker.record(false));
            seen.push(breaker.state().status);
        }
        assert_eq!(
            seen,
            [
                ConnectionStatus::Closed,
                ConnectionStatus::HalfClosed,
                ConnectionStatus::HalfClosed,
                ConnectionStatus::Open,
            ]
        );
        assert_eq!(transitions, [Transition::Tripped]);
        assert_eq!(breaker.state().attempts, 3);
    }

    #[test]
    fn further_failures_do_not_trip_again() {
        let mut breaker = closed(1);
        assert_eq!(breaker.record(false), Some(Transition::Tripped));
        assert_eq!(breaker.record(false), None);
        assert_eq!(breaker.record(false), None);
        assert_eq!(breaker.state().status, ConnectionStatus::Open);
    }

    #[test]
    fn one_success_recovers_open_circuit() {
        let mut breaker = closed(2);
        breaker.record(false);
        breaker.record(false);
        assert_eq!(breaker.state().status, ConnectionStatus::Open);

        assert_eq!(breaker.record(true), Some(Transition::Recovered));
        assert_eq!(breaker.state(), ConnectionState::new(ConnectionStatus::Closed));
        assert_eq!(breaker.record(true), None);
    }

    #[test]
    fn success_from_half_closed_recovers() {
        let mut breaker = closed(5);
        breaker.record(false);
        assert_eq!(breaker.state().status, ConnectionStatus::HalfClosed);
        assert_eq!(breaker.record(true), Some(Transition::Recovered));
        assert_eq!(breaker.state().attempts, 0);
    }

    #[test]
    fn success_while_closed_is_silent() {
        let mut breaker = closed(3);
        for _ in 0..5 {
            assert_eq!(breaker.record(true), None);
        }
    }

    #[test]
    fn open_start_recovers_on_first_success() {
        let mut breaker = CircuitBreaker::new(ConnectionState::new(ConnectionStatus::Open), 3);
        assert_eq!(breaker.record(true), Some(Transition::Recovered));
    }

    #[test]
    fn zero_threshold_acts_as_one() {
        let mut breaker = closed(0);
        assert_eq!(breaker.trip_threshold(), 1);
        assert_eq!(breaker.record(false), Some(Transition::Tripped));
    }
}
