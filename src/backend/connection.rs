use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use thiserror::Error;

// -----------------------------------------------------------------------------
// ----- Credentials -----------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Credentials {
    pub login: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        let password: String = password.into();
        Self {
            login: login.into(),
            password: SecretString::new(password.into_boxed_str()),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Connection ------------------------------------------------------------

/// One live backend connection, exclusively owned by a pool wrapper.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Cheap liveness probe. Only ever called on idle connections.
    async fn health_check(&mut self) -> bool;

    async fn close(&mut self);
}

// -----------------------------------------------------------------------------
// ----- ConnectionFactory -----------------------------------------------------

#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection;

    /// Identifier used in logs and error context (e.g. `erp-primary@10.0.0.4:8069`).
    fn backend(&self) -> &str;

    async fn connect(&self) -> Result<Self::Connection, BackendError>;
}

// -----------------------------------------------------------------------------
// ----- Authenticator ---------------------------------------------------------

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolves credentials to a principal id. Credential rejection must be
    /// reported as [`BackendError::Rejected`]; anything else is treated as a
    /// collaborator failure.
    async fn authenticate(&self, credentials: &Credentials) -> Result<i64, BackendError>;
}

// -----------------------------------------------------------------------------
// ----- Invoker ---------------------------------------------------------------

/// Performs one backend call over a leased connection.
#[async_trait]
pub trait Invoker<C, A>: Send + Sync
where
    C: Connection,
    A: ?Sized + Sync,
{
    async fn invoke(
        &self,
        connection: &mut C,
        principal_id: i64,
        operation: &str,
        args: &A,
    ) -> Result<Value, BackendError>;
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("credentials rejected: {reason}")]
    Rejected { reason: String },

    #[error("backend i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("backend fault: {0}")]
    Fault(String),
}

impl BackendError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault(message.into())
    }

    /// True when the failure says something about the connection itself,
    /// meaning the leased connection should not go back to the idle set.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectTimeout { .. })
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn credentials_keep_password_secret() {
        let creds = Credentials::new("alice", "hunter2");
        assert_eq!(creds.password.expose_secret(), "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn only_io_failures_are_transport_failures() {
        let io = BackendError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(io.is_transport());
        assert!(!BackendError::rejected("bad password").is_transport());
        assert!(!BackendError::fault("record not found").is_transport());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
