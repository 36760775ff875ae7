//! Circuit-breaker decoration for database providers
//!
//! Wraps any [`DatabaseProvider`] so every capability call runs through a
//! shared [`CircuitBreaker`]. When the upstream database keeps failing, the
//! breaker trips and reconciliations fail fast with a circuit rejection
//! instead of stacking timeouts against a dead dependency.

use std::sync::Arc;

use async_trait::async_trait;

use super::{DatabaseCredentials, DatabaseInfo, DatabaseProvider};
use crate::circuit::CircuitBreaker;
use crate::crd::Site;
use crate::Result;

/// A provider whose calls are guarded by a circuit breaker
pub struct CircuitBreakerProvider {
    inner: Arc<dyn DatabaseProvider>,
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerProvider {
    /// Guard `inner` with `breaker`. The breaker should come from the shared
    /// registry so concurrent reconciliations observe one failure count.
    pub fn new(inner: Arc<dyn DatabaseProvider>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl DatabaseProvider for CircuitBreakerProvider {
    async fn ensure_database(&self, site: &Site) -> Result<DatabaseInfo> {
        self.breaker
            .execute(|| self.inner.ensure_database(site))
            .await
    }

    async fn is_ready(&self, site: &Site) -> Result<bool> {
        self.breaker.execute(|| self.inner.is_ready(site)).await
    }

    async fn get_credentials(&self, site: &Site) -> Result<DatabaseCredentials> {
        self.breaker
            .execute(|| self.inner.get_credentials(site))
            .await
    }

    async fn cleanup(&self, site: &Site) -> Result<()> {
        self.breaker.execute(|| self.inner.cleanup(site)).await
    }
}
