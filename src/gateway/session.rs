use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::{Rng, distr::Alphanumeric};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Authenticator, BackendError, Credentials};
use crate::config::SessionConfig;
use crate::errors::GatewayError;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const SESSION_ID_LEN: usize = 32;

// -----------------------------------------------------------------------------
// ----- Session ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub principal_id: i64,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub timeout: Duration,
}

impl Session {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.timeout
    }
}

// -----------------------------------------------------------------------------
// ----- SessionManager --------------------------------------------------------

pub struct SessionManager {
    authenticator: Arc<dyn Authenticator>,
    sessions: Mutex<HashMap<String, Session>>,
    timeout: Duration,
    cleanup_interval: Duration,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("active", &self.active_count())
            .field("timeout", &self.timeout)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// ----- SessionManager: Static ------------------------------------------------

impl SessionManager {
    pub fn new(authenticator: Arc<dyn Authenticator>, config: &SessionConfig) -> Self {
        Self {
            authenticator,
            sessions: Mutex::new(HashMap::new()),
            timeout: config.timeout,
            cleanup_interval: config.cleanup_interval,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SessionManager: Public ------------------------------------------------

impl SessionManager {
    /// Authenticates and stores a new session. Not retried on failure.
    pub async fn create_session(&self, credentials: &Credentials) -> Result<Session, GatewayError> {
        let principal_id = match self.authenticator.authenticate(credentials).await {
            Ok(id) => id,
            Err(BackendError::Rejected { reason }) => {
                info!(login = %credentials.login, "authentication rejected");
                return Err(GatewayError::Auth {
                    login: credentials.login.clone(),
                    reason,
                });
            }
            Err(source) => {
                warn!(login = %credentials.login, "authentication failed: {source}");
                return Err(GatewayError::backend("authenticate", source));
            }
        };

        let now = Instant::now();
        let mut sessions = self.sessions.lock();

        let id = loop {
            let candidate = new_session_id();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Session {
            id: id.clone(),
            principal_id,
            created_at: now,
            last_activity: now,
            timeout: self.timeout,
        };
        sessions.insert(id, session.clone());

        debug!(principal_id, active = sessions.len(), "session created");
        Ok(session)
    }

    /// Looks up a live session and refreshes its activity. Expired sessions
    /// are removed and reported as absent.
    pub fn get_session(&self, id: &str) -> Option<Session> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();

        let session = sessions.get_mut(id)?;
        if session.is_expired(now) {
            let principal_id = session.principal_id;
            sessions.remove(id);
            debug!(principal_id, "session expired on lookup");
            return None;
        }

        session.last_activity = now;
        Some(session.clone())
    }

    /// Like [`get_session`](Self::get_session), for operations that cannot
    /// proceed without an established session.
    pub fn require_session(&self, id: &str) -> Result<Session, GatewayError> {
        self.get_session(id).ok_or_else(|| GatewayError::Session {
            session_id: id.to_string(),
        })
    }

    /// Idempotent. Returns whether a session was removed.
    pub fn destroy_session(&self, id: &str) -> bool {
        let removed = self.sessions.lock().remove(id);
        if let Some(session) = &removed {
            debug!(principal_id = session.principal_id, "session destroyed");
        }
        removed.is_some()
    }

    /// Removes every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();

        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));
        before - sessions.len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts the background sweep. Calling it twice is a no-op.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.cleanup_interval;
        *sweeper = Some(tokio::spawn(run_sweeper(manager, shutdown, period)));
    }

    /// Stops the sweeper and waits for it to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("session sweeper ended abnormally: {err}");
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn new_session_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

async fn run_sweeper(manager: Weak<SessionManager>, shutdown: CancellationToken, period: Duration) {
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

        let Some(manager) = manager.upgrade() else {
            break;
        };

        let removed = manager.sweep_expired();
        if removed > 0 {
            info!(removed, active = manager.active_count(), "swept expired sessions");
        }
    }

    debug!("session sweeper stopped");
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
