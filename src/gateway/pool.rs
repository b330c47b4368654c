//! Bounded backend connection pool.
//!
//! All bookkeeping (`active` count, idle set, closed flag) lives in one
//! `PoolState` behind a single mutex; waiters park on a `Notify` and re-check
//! the state when woken. Idle connections are reused LIFO and waiters are not
//! served in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::{BackendError, Connection, ConnectionFactory};
use crate::config::PoolConfig;

// -----------------------------------------------------------------------------
// ----- ConnectionPool --------------------------------------------------------

pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    available: Notify,
    next_id: AtomicU64,
    counters: Counters,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

struct PoolState<C> {
    /// Most recently returned at the back.
    idle: Vec<ConnectionWrapper<C>>,
    /// Every connection that exists or is being created, leased or idle.
    active: usize,
    closed: bool,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    closed: AtomicU64,
    evicted: AtomicU64,
    timeouts: AtomicU64,
    create_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub backend: String,
    pub max_size: usize,
    pub active: usize,
    pub idle: usize,
    pub in_use: usize,
    pub closed: bool,
    pub created: u64,
    pub closed_total: u64,
    pub evicted: u64,
    pub timeouts: u64,
    pub create_failures: u64,
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("backend", &self.factory.backend())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionPool: Static ------------------------------------------------

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Builds the pool and starts its health-check task. Must be called from
    /// within a Tokio runtime.
    pub fn new(factory: F, config: PoolConfig) -> Arc<Self> {
        let max_size = config.max_size.max(1);
        let pool = Arc::new(Self {
            factory,
            config: PoolConfig { max_size, ..config },
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(max_size),
                active: 0,
                closed: false,
            }),
            available: Notify::new(),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
            health_task: Mutex::new(None),
        });

        let handle = tokio::spawn(run_health_checks(
            Arc::downgrade(&pool),
            pool.shutdown.clone(),
            pool.config.health_check_interval,
        ));
        *pool.health_task.lock() = Some(handle);

        info!(
            backend = %pool.backend(),
            max_size,
            "connection pool created"
        );
        pool
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionPool: Public ------------------------------------------------

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn backend(&self) -> &str {
        self.factory.backend()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquires with the configured `acquire_timeout`.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<F>, ConnectionError> {
        self.acquire_until(Instant::now() + self.config.acquire_timeout)
            .await
    }

    /// Returns an idle connection, opens a new one while under `max_size`, or
    /// waits for a release until `deadline`. The deadline covers connection
    /// creation (including retries) as well as waiting.
    pub async fn acquire_until(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> Result<PooledConnection<F>, ConnectionError> {
        let started = Instant::now();

        loop {
            // Registered before inspecting the state so a release that lands
            // in between is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.checkout()? {
                Checkout::Idle(wrapper) => {
                    trace!(backend = %self.backend(), id = wrapper.id, "reusing idle connection");
                    return Ok(PooledConnection::new(self.clone(), wrapper));
                }
                Checkout::Reserved(slot) => {
                    return match timeout_at(deadline, self.open_with_retry()).await {
                        Ok(Ok(mut connection)) => {
                            if self.is_closed() {
                                drop(slot);
                                connection.close().await;
                                return Err(ConnectionError::PoolClosed {
                                    backend: self.backend().to_string(),
                                });
                            }
                            slot.commit();
                            let wrapper = ConnectionWrapper::leased(self.next_id(), connection);
                            Ok(PooledConnection::new(self.clone(), wrapper))
                        }
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(self.timed_out(started)),
                    };
                }
                Checkout::Exhausted => {}
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(self.timed_out(started));
            }
        }
    }

    /// Pre-opens connections until `target` are idle. Failures are logged.
    /// Returns how many connections were opened.
    pub async fn warm(self: &Arc<Self>, target: usize) -> usize {
        let target = target.min(self.config.max_size);
        let mut leases = Vec::with_capacity(target);
        let mut opened = 0;

        while self.stats().idle + leases.len() < target {
            let slot = match self.checkout() {
                Ok(Checkout::Reserved(slot)) => slot,
                Ok(Checkout::Idle(wrapper)) => {
                    leases.push(PooledConnection::new(self.clone(), wrapper));
                    continue;
                }
                Ok(Checkout::Exhausted) | Err(_) => break,
            };

            match self.open_with_retry().await {
                Ok(connection) => {
                    slot.commit();
                    opened += 1;
                    let wrapper = ConnectionWrapper::leased(self.next_id(), connection);
                    leases.push(PooledConnection::new(self.clone(), wrapper));
                }
                Err(err) => {
                    warn!(backend = %self.backend(), "failed to warm connection: {err}");
                    break;
                }
            }
        }

        for lease in leases {
            lease.release().await;
        }

        info!(backend = %self.backend(), opened, "connection pool warmed");
        opened
    }

    /// Runs one health-check pass over the connections idle right now.
    /// Leased connections are never probed. Returns the number evicted.
    pub async fn check_idle_connections(&self) -> usize {
        let snapshot: Vec<u64> = {
            let state = self.state.lock();
            state.idle.iter().map(|w| w.id).collect()
        };

        let mut evicted = 0;
        for id in snapshot {
            // Pulled out of the idle set while probing so nobody leases it.
            let wrapper = {
                let mut state = self.state.lock();
                match state.idle.iter().position(|w| w.id == id) {
                    Some(pos) => state.idle.remove(pos),
                    None => continue,
                }
            };

            let mut wrapper = wrapper;
            let healthy = wrapper.connection.health_check().await;

            let to_close = {
                let mut state = self.state.lock();
                if healthy && !state.closed {
                    // Back at the cold end: a probe is not a use.
                    state.idle.insert(0, wrapper);
                    None
                } else {
                    state.active -= 1;
                    Some(wrapper)
                }
            };
            self.available.notify_one();

            if let Some(mut wrapper) = to_close {
                if !healthy {
                    wrapper.mark_unhealthy();
                    evicted += 1;
                    self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                    warn!(backend = %self.backend(), id = wrapper.id, "evicting connection that failed health check");
                }
                self.close_wrapper(wrapper).await;
            }
        }

        evicted
    }

    /// Stops new acquires, stops the health-check task, and closes idle
    /// connections. Leased connections are closed when released.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;

            let idle = std::mem::take(&mut state.idle);
            state.active -= idle.len();
            idle
        };

        self.shutdown.cancel();
        self.available.notify_waiters();

        let handle = self.health_task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(backend = %self.backend(), "health-check task ended abnormally: {err}");
            }
        }

        let closing = idle.len();
        for wrapper in idle {
            self.close_wrapper(wrapper).await;
        }

        info!(backend = %self.backend(), closed_idle = closing, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let (active, idle, closed) = {
            let state = self.state.lock();
            (state.active, state.idle.len(), state.closed)
        };

        PoolStats {
            backend: self.backend().to_string(),
            max_size: self.config.max_size,
            active,
            idle,
            in_use: active - idle,
            closed,
            created: self.counters.created.load(Ordering::Relaxed),
            closed_total: self.counters.closed.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            create_failures: self.counters.create_failures.load(Ordering::Relaxed),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionPool: Private -----------------------------------------------

enum Checkout<'a, F: ConnectionFactory> {
    Idle(ConnectionWrapper<F::Connection>),
    Reserved(SlotReservation<'a, F>),
    Exhausted,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    fn checkout(&self) -> Result<Checkout<'_, F>, ConnectionError> {
        let mut state = self.state.lock();

        if state.closed {
            return Err(ConnectionError::PoolClosed {
                backend: self.backend().to_string(),
            });
        }

        if let Some(mut wrapper) = state.idle.pop() {
            wrapper.mark_in_use();
            return Ok(Checkout::Idle(wrapper));
        }

        if state.active < self.config.max_size {
            state.active += 1;
            return Ok(Checkout::Reserved(SlotReservation {
                pool: self,
                committed: false,
            }));
        }

        Ok(Checkout::Exhausted)
    }

    async fn open_with_retry(&self) -> Result<F::Connection, ConnectionError> {
        let attempts = self.config.retry_count.saturating_add(1);
        let mut attempt = 0;

        loop {
            match self.factory.connect().await {
                Ok(connection) => {
                    self.counters.created.fetch_add(1, Ordering::Relaxed);
                    if attempt > 0 {
                        info!(backend = %self.backend(), attempt = attempt + 1, "backend connection opened after retry");
                    }
                    return Ok(connection);
                }
                Err(err) if attempt + 1 >= attempts => {
                    self.counters.create_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(backend = %self.backend(), attempts, "giving up on backend connection: {err}");
                    return Err(ConnectionError::Create {
                        backend: self.backend().to_string(),
                        attempts,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = backoff_delay(self.config.base_retry_delay, attempt);
                    debug!(
                        backend = %self.backend(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "backend connect failed, retrying: {err}"
                    );

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            return Err(ConnectionError::PoolClosed {
                                backend: self.backend().to_string(),
                            });
                        }
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Returns a released wrapper to the idle set, or hands it back for
    /// closing when the pool is closed or the wrapper is unhealthy.
    fn return_wrapper(
        &self,
        mut wrapper: ConnectionWrapper<F::Connection>,
    ) -> Option<ConnectionWrapper<F::Connection>> {
        let mut state = self.state.lock();

        let discarded = if state.closed || !wrapper.is_healthy() {
            state.active -= 1;
            Some(wrapper)
        } else {
            wrapper.mark_idle();
            state.idle.push(wrapper);
            None
        };
        drop(state);

        self.available.notify_one();
        discarded
    }

    async fn close_wrapper(&self, mut wrapper: ConnectionWrapper<F::Connection>) {
        wrapper.connection.close().await;
        wrapper.state = ConnectionState::Closed;
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        debug!(backend = %self.backend(), id = wrapper.id, "backend connection closed");
    }

    fn timed_out(&self, started: Instant) -> ConnectionError {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        ConnectionError::PoolTimeout {
            backend: self.backend().to_string(),
            waited: started.elapsed(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

// -----------------------------------------------------------------------------
// ----- SlotReservation -------------------------------------------------------

/// Capacity counted in `active` before the connection exists. Rolled back on
/// drop unless committed, so failed or abandoned creations never leak a slot.
struct SlotReservation<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    committed: bool,
}

impl<F: ConnectionFactory> SlotReservation<'_, F> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl<F: ConnectionFactory> Drop for SlotReservation<'_, F> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.pool.state.lock().active -= 1;
        self.pool.available.notify_one();
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionWrapper -----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Idle,
    InUse,
    /// Terminal; the wrapper never goes back to the idle set.
    Unhealthy,
    Closed,
}

#[derive(Debug)]
pub struct ConnectionWrapper<C> {
    id: u64,
    connection: C,
    created_at: Instant,
    last_used: Instant,
    state: ConnectionState,
}

impl<C> ConnectionWrapper<C> {
    fn new(id: u64, connection: C) -> Self {
        let now = Instant::now();
        Self {
            id,
            connection,
            created_at: now,
            last_used: now,
            state: ConnectionState::Created,
        }
    }

    fn leased(id: u64, connection: C) -> Self {
        let mut wrapper = Self::new(id, connection);
        wrapper.mark_in_use();
        wrapper
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn in_use(&self) -> bool {
        self.state == ConnectionState::InUse
    }

    pub fn is_healthy(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Created | ConnectionState::Idle | ConnectionState::InUse
        )
    }

    fn mark_in_use(&mut self) {
        self.state = ConnectionState::InUse;
        self.last_used = Instant::now();
    }

    fn mark_idle(&mut self) {
        self.state = ConnectionState::Idle;
        self.last_used = Instant::now();
    }

    fn mark_unhealthy(&mut self) {
        self.state = ConnectionState::Unhealthy;
    }
}

// -----------------------------------------------------------------------------
// ----- PooledConnection ------------------------------------------------------

/// A leased connection. Give it back with [`release`](Self::release); dropping
/// it also returns it, closing on a spawned task if needed.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<ConnectionPool<F>>,
    wrapper: Option<ConnectionWrapper<F::Connection>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(pool: Arc<ConnectionPool<F>>, wrapper: ConnectionWrapper<F::Connection>) -> Self {
        Self {
            pool,
            wrapper: Some(wrapper),
        }
    }

    fn wrapper(&self) -> &ConnectionWrapper<F::Connection> {
        self.wrapper
            .as_ref()
            .expect("pooled connection missing wrapper")
    }

    pub fn id(&self) -> u64 {
        self.wrapper().id
    }

    pub fn state(&self) -> ConnectionState {
        self.wrapper().state
    }

    pub fn connection(&mut self) -> &mut F::Connection {
        &mut self
            .wrapper
            .as_mut()
            .expect("pooled connection missing wrapper")
            .connection
    }

    /// The connection is discarded instead of reused when released.
    pub fn mark_unhealthy(&mut self) {
        if let Some(wrapper) = self.wrapper.as_mut() {
            wrapper.mark_unhealthy();
        }
    }

    pub async fn release(mut self) {
        let Some(wrapper) = self.wrapper.take() else {
            return;
        };

        if let Some(wrapper) = self.pool.return_wrapper(wrapper) {
            self.pool.close_wrapper(wrapper).await;
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("backend", &self.pool.backend())
            .field("id", &self.wrapper.as_ref().map(|w| w.id))
            .finish()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(wrapper) = self.wrapper.take() else {
            return;
        };
        let Some(wrapper) = self.pool.return_wrapper(wrapper) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                handle.spawn(async move {
                    pool.close_wrapper(wrapper).await;
                });
            }
            Err(_) => {
                debug!(backend = %self.pool.backend(), "no runtime; dropping connection without close");
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

async fn run_health_checks<F: ConnectionFactory>(
    pool: Weak<ConnectionPool<F>>,
    shutdown: CancellationToken,
    period: Duration,
) {
    if period.is_zero() {
        return;
    }

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(pool) = pool.upgrade() else {
            break;
        };

        let evicted = pool.check_idle_connections().await;
        if evicted > 0 {
            let stats = pool.stats();
            info!(
                backend = %stats.backend,
                evicted,
                active = stats.active,
                idle = stats.idle,
                "health check evicted connections"
            );
        }
    }

    debug!("health-check task stopped");
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("could not connect to {backend} after {attempts} attempt(s): {source}")]
    Create {
        backend: String,
        attempts: u32,
        #[source]
        source: Box<BackendError>,
    },

    #[error("timed out after {waited:?} waiting for a connection to {backend}")]
    PoolTimeout { backend: String, waited: Duration },

    #[error("connection pool for {backend} is closed")]
    PoolClosed { backend: String },
}

impl ConnectionError {
    pub fn backend(&self) -> &str {
        match self {
            Self::Create { backend, .. }
            | Self::PoolTimeout { backend, .. }
            | Self::PoolClosed { backend } => backend,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PoolTimeout { .. })
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
