use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};

use objgate::config::Settings;
use objgate::{Authenticator, BackendError, Connection, ConnectionFactory, Credentials, Invoker};

// -----------------------------------------------------------------------------
// ----- MockFactory -----------------------------------------------------------

/// Counters shared by a factory and every connection it opened.
#[derive(Debug, Default)]
pub struct Backend {
    pub connects: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub health_checks: AtomicUsize,
    pub fail_next: AtomicUsize,
    next_id: AtomicU64,
    connect_delay: Mutex<Duration>,
    unhealthy: Mutex<HashSet<u64>>,
}

#[allow(dead_code)]
impl Backend {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    /// The next `n` connect attempts fail with an i/o error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Connection `id` fails every health check from now on.
    pub fn break_connection(&self, id: u64) {
        self.unhealthy.lock().insert(id);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    pub backend: Arc<Backend>,
}

#[allow(dead_code)]
impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    fn backend(&self) -> &str {
        "mock@127.0.0.1:8069"
    }

    async fn connect(&self) -> Result<MockConnection, BackendError> {
        self.backend.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.backend.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .backend
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused").into());
        }

        self.backend.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id: self.backend.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            backend: self.backend.clone(),
        })
    }
}

// -----------------------------------------------------------------------------
// ----- MockConnection --------------------------------------------------------

#[derive(Debug)]
pub struct MockConnection {
    pub id: u64,
    backend: Arc<Backend>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn health_check(&mut self) -> bool {
        self.backend.health_checks.fetch_add(1, Ordering::SeqCst);
        !self.backend.unhealthy.lock().contains(&self.id)
    }

    async fn close(&mut self) {
        self.backend.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// -----------------------------------------------------------------------------
// ----- EchoInvoker -----------------------------------------------------------

/// Answers every call with the operation, principal, connection id, and args.
#[derive(Debug, Default)]
pub struct EchoInvoker {
    pub calls: AtomicUsize,
    pub fail_transport: AtomicBool,
}

#[allow(dead_code)]
impl EchoInvoker {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<A> Invoker<MockConnection, A> for EchoInvoker
where
    A: Serialize + ?Sized + Sync,
{
    async fn invoke(
        &self,
        connection: &mut MockConnection,
        principal_id: i64,
        operation: &str,
        args: &A,
    ) -> Result<Value, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_transport.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe").into());
        }

        let args = serde_json::to_value(args).map_err(|e| BackendError::fault(e.to_string()))?;
        Ok(json!({
            "operation": operation,
            "principal_id": principal_id,
            "connection": connection.id,
            "args": args,
        }))
    }
}

// -----------------------------------------------------------------------------
// ----- StaticAuth ------------------------------------------------------------

/// `alice`/`secret` is principal 7, `bob`/`hunter2` is principal 8; login
/// `outage` simulates a backend fault.
#[derive(Debug, Default)]
pub struct StaticAuth;

#[async_trait]
impl Authenticator for StaticAuth {
    async fn authenticate(&self, credentials: &Credentials) -> Result<i64, BackendError> {
        use secrecy::ExposeSecret;

        match (credentials.login.as_str(), credentials.password.expose_secret()) {
            ("alice", "secret") => Ok(7),
            ("bob", "hunter2") => Ok(8),
            ("outage", _) => Err(BackendError::fault("auth service unavailable")),
            _ => Err(BackendError::rejected("invalid login or password")),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Settings --------------------------------------------------------------

/// Defaults with background tasks pushed far out so they stay out of the way
/// of paused-clock tests.
#[allow(dead_code)]
pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.pool.health_check_interval = Duration::from_secs(3600);
    settings.pool.base_retry_delay = Duration::from_millis(10);
    settings.session.cleanup_interval = Duration::from_secs(3600);
    settings
}

#[allow(dead_code)]
pub fn alice() -> Credentials {
    Credentials::new("alice", "secret")
}

#[allow(dead_code)]
pub fn bob() -> Credentials {
    Credentials::new("bob", "hunter2")
}
