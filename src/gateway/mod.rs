pub mod cache;
pub mod pool;
pub mod rate_limiter;
pub mod session;

pub use cache::{CacheKey, CacheStats, TtlCache};
pub use pool::{
    ConnectionError, ConnectionPool, ConnectionState, ConnectionWrapper, PoolStats,
    PooledConnection,
};
pub use rate_limiter::{RateLimitError, RateLimiter};
pub use session::{Session, SessionManager};

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Authenticator, ConnectionFactory, Credentials, Invoker};
use crate::config::Settings;
use crate::errors::GatewayError;

// -----------------------------------------------------------------------------
// ----- Gateway ---------------------------------------------------------------

/// One backend's worth of pooled connections, sessions, rate limiting, and
/// read caching. Built once at start-up and shared by reference.
pub struct Gateway<F: ConnectionFactory> {
    pool: Arc<ConnectionPool<F>>,
    limiter: RateLimiter,
    block_on_limit: bool,
    sessions: Arc<SessionManager>,
    cache: Arc<TtlCache<Value>>,
    min_idle: usize,
    shutdown: CancellationToken,
    cache_sweeper: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayStats {
    pub pool: PoolStats,
    pub cache: CacheStats,
    pub sessions: usize,
    /// `None` when rate limiting is off.
    pub rate_limit_tokens: Option<f64>,
}

impl<F: ConnectionFactory> std::fmt::Debug for Gateway<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("pool", &self.pool)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// ----- Gateway: Static -------------------------------------------------------

impl<F: ConnectionFactory> Gateway<F> {
    /// Builds every component and starts the background tasks. Must be called
    /// from within a Tokio runtime.
    pub fn new(settings: &Settings, factory: F, authenticator: Arc<dyn Authenticator>) -> Self {
        let pool = ConnectionPool::new(factory, settings.pool.clone());

        let sessions = Arc::new(SessionManager::new(authenticator, &settings.session));
        sessions.start_sweeper();

        let cache = Arc::new(TtlCache::from_config(&settings.cache));
        let shutdown = CancellationToken::new();
        let cache_sweeper = settings
            .cache
            .sweep_interval
            .filter(|period| !period.is_zero())
            .map(|period| {
                tokio::spawn(run_cache_sweeper(
                    Arc::downgrade(&cache),
                    shutdown.clone(),
                    period,
                ))
            });

        let limiter = RateLimiter::from_config(&settings.rate_limit);
        info!(
            backend = %pool.backend(),
            rate_limited = limiter.is_enabled(),
            cache_capacity = settings.cache.max_entries,
            "gateway ready"
        );

        Self {
            pool,
            limiter,
            block_on_limit: settings.rate_limit.block,
            sessions,
            cache,
            min_idle: settings.pool.min_idle,
            shutdown,
            cache_sweeper: Mutex::new(cache_sweeper),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Gateway: Public -------------------------------------------------------

impl<F: ConnectionFactory> Gateway<F> {
    pub fn pool(&self) -> &Arc<ConnectionPool<F>> {
        &self.pool
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn cache(&self) -> &TtlCache<Value> {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Opens connections up to the configured `min_idle`.
    pub async fn warm(&self) -> usize {
        if self.min_idle == 0 {
            return 0;
        }
        self.pool.warm(self.min_idle).await
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<Session, GatewayError> {
        self.sessions.create_session(credentials).await
    }

    pub fn logout(&self, session_id: &str) -> bool {
        self.sessions.destroy_session(session_id)
    }

    /// Runs `operation` for the session's principal.
    ///
    /// Read-only calls go through the cache when their arguments normalize to
    /// a key. Entries are per principal, and a cache hit never touches the
    /// pool. Transport failures mark the leased connection unhealthy so it is
    /// not reused.
    pub async fn call<A, I>(
        &self,
        session_id: &str,
        operation: &str,
        args: &A,
        read_only: bool,
        invoker: &I,
    ) -> Result<Value, GatewayError>
    where
        A: Serialize + ?Sized + Sync,
        I: Invoker<F::Connection, A> + ?Sized,
    {
        self.admit().await?;
        let session = self.sessions.require_session(session_id)?;

        let key = if read_only {
            CacheKey::for_call(session.principal_id, operation, args)
        } else {
            None
        };

        match key {
            Some(key) => {
                self.cache
                    .get_or_compute(&key, self.cache.default_ttl(), || {
                        self.invoke(session.principal_id, operation, args, invoker)
                    })
                    .await
            }
            None => {
                if read_only {
                    debug!(operation, "arguments not cacheable, calling backend directly");
                }
                self.invoke(session.principal_id, operation, args, invoker)
                    .await
            }
        }
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            pool: self.pool.stats(),
            cache: self.cache.stats(),
            sessions: self.sessions.active_count(),
            rate_limit_tokens: self.limiter.available_tokens(),
        }
    }

    /// Stops background work and closes the pool. Leased connections are
    /// closed as they come back.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handle = self.cache_sweeper.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("cache sweeper ended abnormally: {err}");
            }
        }

        self.sessions.shutdown().await;
        self.pool.close().await;

        info!(backend = %self.pool.backend(), "gateway stopped");
    }
}

// -----------------------------------------------------------------------------
// ----- Gateway: Private ------------------------------------------------------

impl<F: ConnectionFactory> Gateway<F> {
    async fn admit(&self) -> Result<(), RateLimitError> {
        if !self.block_on_limit {
            return self.limiter.try_acquire();
        }

        let deadline = Instant::now() + self.pool.config().acquire_timeout;
        self.limiter.acquire_until(deadline).await
    }

    async fn invoke<A, I>(
        &self,
        principal_id: i64,
        operation: &str,
        args: &A,
        invoker: &I,
    ) -> Result<Value, GatewayError>
    where
        A: ?Sized + Sync,
        I: Invoker<F::Connection, A> + ?Sized,
    {
        let mut lease = self.pool.acquire().await?;

        let result = invoker
            .invoke(lease.connection(), principal_id, operation, args)
            .await;

        if let Err(err) = &result {
            if err.is_transport() {
                warn!(
                    backend = %self.pool.backend(),
                    id = lease.id(),
                    operation,
                    "discarding connection after transport error: {err}"
                );
                lease.mark_unhealthy();
            }
        }
        lease.release().await;

        result.map_err(|source| GatewayError::backend(operation, source))
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

async fn run_cache_sweeper(
    cache: Weak<TtlCache<Value>>,
    shutdown: CancellationToken,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(cache) = cache.upgrade() else {
            break;
        };

        let purged = cache.purge_expired();
        if purged > 0 {
            debug!(purged, remaining = cache.len(), "purged expired cache entries");
        }
    }

    debug!("cache sweeper stopped");
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
