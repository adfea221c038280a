//! Periodic connection checker.
//!
//! One tokio task per checker probes the target on a fixed schedule and
//! feeds the outcome to a [`CircuitBreaker`]. Callbacks run inline on that
//! task, only when the circuit trips or recovers.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::probe::ConnectionTester;
use crate::types::{CheckerConfig, ConnectionState, Transition};

/// Callback invoked with the probed target on a circuit transition.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Shortest probe period accepted; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Probes a target periodically and tracks its circuit state.
pub struct PeriodicConnectionChecker<T> {
    config: CheckerConfig,
    breaker: Arc<Mutex<CircuitBreaker>>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
    _target: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + Sync + 'static> PeriodicConnectionChecker<T> {
    pub fn new(initial: ConnectionState, config: CheckerConfig) -> Self {
        let breaker = CircuitBreaker::new(initial, config.trip_threshold);
        Self {
            config,
            breaker: Arc::new(Mutex::new(breaker)),
            running: None,
            _target: std::marker::PhantomData,
        }
    }

    /// Current circuit state.
    pub fn state(&self) -> ConnectionState {
        self.breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Starts probing `target`, replacing any loop started earlier.
    ///
    /// The circuit state carries over from the previous loop.
    pub fn initialize(
        &mut self,
        target: T,
        tester: Arc<dyn ConnectionTester<T>>,
        on_success: Option<Callback<T>>,
        on_failure: Option<Callback<T>>,
    ) {
        self.dispose();

        let cancel = CancellationToken::new();
        let probe_loop = ProbeLoop {
            target,
            tester,
            on_success,
            on_failure,
            breaker: self.breaker.clone(),
        };
        let handle = tokio::spawn(probe_loop.run(self.config.clone(), cancel.clone()));
        self.running = Some((cancel, handle));
        debug!(
            period = ?self.config.period,
            initial_delay = ?self.config.initial_delay,
            "connection checker started"
        );
    }

    /// Stops the probe loop. Idempotent.
    pub fn dispose(&mut self) {
        if let Some((cancel, _handle)) = self.running.take() {
            cancel.cancel();
            debug!("connection checker stopped");
        }
    }
}

impl<T> Drop for PeriodicConnectionChecker<T> {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.running.take() {
            cancel.cancel();
        }
    }
}

struct ProbeLoop<T> {
    target: T,
    tester: Arc<dyn ConnectionTester<T>>,
    on_success: Option<Callback<T>>,
    on_failure: Option<Callback<T>>,
    breaker: Arc<Mutex<CircuitBreaker>>,
}

impl<T: Send + Sync + 'static> ProbeLoop<T> {
    async fn run(self, config: CheckerConfig, cancel: CancellationToken) {
        let start = Instant::now() + config.initial_delay;
        let mut interval = tokio::time::interval_at(start, config.period.max(MIN_PERIOD));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let success = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                success = self.probe() => success,
            };

            let transition = self
                .breaker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(success);

            match transition {
                Some(Transition::Recovered) => {
                    info!("connection recovered");
                    self.notify(self.on_success.as_ref(), "on_success");
                }
                Some(Transition::Tripped) => {
                    warn!("connection circuit tripped");
                    self.notify(self.on_failure.as_ref(), "on_failure");
                }
                None => {}
            }
        }
    }

    /// Runs one probe; errors and panics count as failure.
    async fn probe(&self) -> bool {
        // Call inside the future so a panic before the first await is caught too.
        let outcome = AssertUnwindSafe(async { self.tester.test_connection(&self.target).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(reachable)) => reachable,
            Ok(Err(e)) => {
                warn!(error = %e, "connection probe failed");
                false
            }
            Err(panic) => {
                error!(panic = %panic_message(panic.as_ref()), "connection probe panicked");
                false
            }
        }
    }

    fn notify(&self, callback: Option<&Callback<T>>, name: &'static str) {
        let Some(callback) = callback else {
            return;
        };
        let target = &self.target;
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(target))) {
            error!(
                callback = name,
                panic = %panic_message(panic.as_ref()),
                "connection callback panicked"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
