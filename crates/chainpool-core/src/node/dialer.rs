use rand::Rng;
use std::{
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};
use thiserror::Error;

use crate::transport::{Transport, TransportError};

/// Jittered exponential backoff, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the capped delay used as the jitter window, centred on the delay.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based): `base * 2^attempt`, capped at `max`,
    /// then spread over `delay ± delay * jitter / 2`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        let capped = base_ms.saturating_mul(1u64 << attempt.min(20)).min(max_ms);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let jitter_range = (capped as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        let jitter_offset =
            if jitter_range > 0 { rand::rng().random_range(0..jitter_range) } else { 0 };

        Duration::from_millis(capped.saturating_sub(jitter_range / 2) + jitter_offset)
    }
}

/// Why a dial attempt did not produce a connection.
#[derive(Error, Debug)]
pub enum DialError {
    /// Another dial for the same node is still running.
    #[error("dial already in flight")]
    InFlight,

    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Establishes a node's connection, one attempt at a time.
///
/// Holds the single-flight guard and the consecutive failure count that feeds the backoff.
/// The dialer never touches node state; [`Node::dial`](super::Node::dial) applies the
/// outcome.
pub struct Dialer {
    policy: BackoffPolicy,
    timeout: Duration,
    in_flight: AtomicBool,
    failed_attempts: AtomicU32,
}

/// Clears the in-flight flag when the attempt finishes, including on cancellation.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Dialer {
    #[must_use]
    pub fn new(policy: BackoffPolicy, timeout: Duration) -> Self {
        Self {
            policy,
            timeout,
            in_flight: AtomicBool::new(false),
            failed_attempts: AtomicU32::new(0),
        }
    }

    /// Runs one dial attempt bounded by the dial timeout.
    ///
    /// # Errors
    ///
    /// - [`DialError::InFlight`] if another attempt is running
    /// - [`DialError::Timeout`] if the transport did not answer in time
    /// - [`DialError::Transport`] if the transport refused
    pub async fn attempt(&self, transport: &dyn Transport) -> Result<(), DialError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DialError::InFlight);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let result = match tokio::time::timeout(self.timeout, transport.dial()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DialError::Transport(e)),
            Err(_) => Err(DialError::Timeout(self.timeout)),
        };

        match result {
            Ok(()) => self.failed_attempts.store(0, Ordering::Relaxed),
            Err(_) => {
                self.failed_attempts.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Backoff to wait before the next attempt, based on consecutive failures so far.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let failures = self.failed_attempts.load(Ordering::Relaxed);
        self.policy.delay(failures.saturating_sub(1))
    }

    #[must_use]
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}
