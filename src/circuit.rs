//! Circuit breaker for calls to external dependencies.
//!
//! One breaker instance guards one logical upstream (for example "the external
//! database") and is shared across every concurrent reconciliation touching that
//! upstream. While the breaker is Open, calls fail immediately with
//! [`Error::CircuitOpen`] instead of accumulating timeouts against a known-bad
//! dependency; after a cool-down a single probe call is let through to test
//! recovery.
//!
//! State transitions are guarded by one mutex over the whole state record, so a
//! failure count can never be read-then-written racily by two reconciliations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::{Error, Result};

/// Observable breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; failures are counted
    Closed,
    /// Calls are short-circuited; a recovery timer is running
    Open,
    /// A bounded number of probe calls are allowed through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Tunables for a single breaker
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before tripping to Open
    pub max_failures: u32,
    /// How long Open lasts before allowing a probe
    pub open_timeout: Duration,
    /// Probe budget while HalfOpen
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
}

/// A single circuit breaker guarding one logical upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker for the named upstream
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_in_flight: 0,
                opened_at: None,
            }),
        }
    }

    /// Create a breaker with default tunables
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Name of the upstream this breaker guards
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, after applying any due Open -> HalfOpen timeout transition
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.apply_timeout(&mut inner);
        inner.state
    }

    /// Run `operation` through the breaker.
    ///
    /// While Open this returns [`Error::CircuitOpen`] without invoking the
    /// operation; while HalfOpen, probes beyond the budget return
    /// [`Error::TooManyRequests`]. When Closed the breaker is transparent:
    /// the operation's error propagates unchanged (and is counted).
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.acquire()?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A panic while holding this lock is a bug in the breaker itself;
        // recover the guard rather than poisoning every future call.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open -> HalfOpen once the cool-down has elapsed. Caller holds the lock.
    fn apply_timeout(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.open_timeout)
                .unwrap_or(true);
            if elapsed {
                info!(breaker = %self.name, "circuit breaker half-open, allowing probe");
                inner.state = CircuitState::HalfOpen;
                inner.half_open_in_flight = 0;
            }
        }
    }

    fn acquire(&self) -> Result<()> {
        let mut inner = self.lock();
        self.apply_timeout(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(Error::CircuitOpen(self.name.clone())),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_requests {
                    Err(Error::TooManyRequests(self.name.clone()))
                } else {
                    inner.half_open_in_flight += 1;
                    Ok(())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "probe succeeded, closing circuit");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.half_open_in_flight = 0;
                inner.opened_at = None;
            }
            // A success observed while Open means the call was in flight when
            // the breaker tripped; the trip stands.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.max_failures {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, opening circuit"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_in_flight = 0;
            }
            CircuitState::Open => {}
        }
    }
}

/// Registry handing out one shared breaker per logical upstream.
///
/// Reconcilers of the same dependency must share a breaker, otherwise each
/// worker would need to observe the failure threshold independently before
/// anything trips.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the breaker for `name`, creating it with `config` on first use
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_failures: 3,
            open_timeout: Duration::from_millis(0),
            half_open_max_requests: 1,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Err::<(), _>(Error::provider("upstream down")) })
            .await
            .map(|_| ())
    }

    /// Story: a healthy upstream keeps the breaker closed and transparent
    #[tokio::test]
    async fn story_closed_breaker_is_transparent() {
        let cb = CircuitBreaker::with_defaults("db");
        let out = cb.execute(|| async { Ok(7) }).await;
        assert_eq!(out.ok(), Some(7));
        assert_eq!(cb.state(), CircuitState::Closed);

        // Inner errors propagate unchanged while Closed
        let err = fail(&cb).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    /// Story: hitting the failure threshold trips the breaker, after which
    /// calls fail fast without invoking the wrapped operation
    #[tokio::test]
    async fn story_threshold_opens_and_short_circuits() {
        let cb = CircuitBreaker::new(
            "db",
            CircuitBreakerConfig {
                max_failures: 3,
                open_timeout: Duration::from_secs(300),
                half_open_max_requests: 1,
            },
        );

        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // The operation body must not run while Open
        let invoked = AtomicU32::new(0);
        let err = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen(_)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    /// Story: after the cool-down a single probe is allowed; success closes
    /// the circuit again
    #[tokio::test]
    async fn story_probe_success_closes_circuit() {
        let cb = CircuitBreaker::new("db", fast_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        // Zero timeout: next acquire moves Open -> HalfOpen immediately
        let out = cb.execute(|| async { Ok("recovered") }).await;
        assert_eq!(out.ok(), Some("recovered"));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    /// Story: a failed probe reopens the circuit
    #[tokio::test]
    async fn story_probe_failure_reopens_circuit() {
        let cb = CircuitBreaker::new("db", fast_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        let err = fail(&cb).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        // Zero timeout means state() reports HalfOpen again, but the failure
        // counter restarted: one more probe failure keeps it from closing.
        let err = fail(&cb).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert_ne!(cb.state(), CircuitState::Closed);
    }

    /// Story: the half-open probe budget rejects surplus callers with a
    /// distinguished error
    #[tokio::test]
    async fn story_half_open_budget_is_enforced() {
        let cb = CircuitBreaker::new(
            "db",
            CircuitBreakerConfig {
                max_failures: 1,
                open_timeout: Duration::from_millis(0),
                half_open_max_requests: 1,
            },
        );
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Take the probe slot without completing the call
        cb.acquire().expect("first probe admitted");
        let err = cb.acquire().unwrap_err();
        assert!(matches!(err, Error::TooManyRequests(_)));
    }

    /// Story: the registry hands every caller the same breaker per upstream
    #[test]
    fn story_registry_shares_breakers() {
        let registry = BreakerRegistry::new();
        let a = registry.get_or_create("external-database", CircuitBreakerConfig::default());
        let b = registry.get_or_create("external-database", CircuitBreakerConfig::default());
        let other = registry.get_or_create("mariadb", CircuitBreakerConfig::default());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
