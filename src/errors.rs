use thiserror::Error;

use crate::backend::BackendError;
use crate::gateway::{ConnectionError, RateLimitError};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

/// Session ids are bearer tokens; only this many characters reach messages.
const SESSION_ID_PREFIX_LEN: usize = 8;

// -----------------------------------------------------------------------------
// ----- GatewayError ----------------------------------------------------------

/// What callers of the gateway see. Each variant keeps its cause reachable
/// through `source()`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("authentication failed for {login}: {reason}")]
    Auth { login: String, reason: String },

    #[error("session {} is invalid or expired", redact_session_id(.session_id))]
    Session { session_id: String },

    #[error("backend call {operation} failed: {source}")]
    Backend {
        operation: String,
        #[source]
        source: BackendError,
    },
}

// -----------------------------------------------------------------------------
// ----- GatewayError: Static --------------------------------------------------

impl GatewayError {
    pub fn backend(operation: impl Into<String>, source: BackendError) -> Self {
        Self::Backend {
            operation: operation.into(),
            source,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- GatewayError: Public --------------------------------------------------

impl GatewayError {
    /// Pool wait or rate-limit wait ran past its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Connection(ConnectionError::PoolTimeout { .. })
                | Self::RateLimit(RateLimitError::Timeout { .. })
        )
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::Session { .. })
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn redact_session_id(id: &str) -> String {
    match id.char_indices().nth(SESSION_ID_PREFIX_LEN) {
        Some((cut, _)) => format!("{}…", &id[..cut]),
        None => id.to_string(),
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
