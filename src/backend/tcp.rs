use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::connection::{BackendError, Connection, ConnectionFactory};
use crate::config::BackendSettings;

// -----------------------------------------------------------------------------
// ----- TcpConnectionFactory --------------------------------------------------

#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    label: String,
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnectionFactory {
    pub fn new(settings: &BackendSettings) -> Self {
        let addr = format!("{}:{}", settings.host, settings.port);
        Self {
            label: format!("{}@{}", settings.name, addr),
            addr,
            connect_timeout: settings.connect_timeout,
        }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    type Connection = TcpConnection;

    fn backend(&self) -> &str {
        &self.label
    }

    async fn connect(&self) -> Result<TcpConnection, BackendError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| BackendError::ConnectTimeout {
                addr: self.addr.clone(),
                timeout: self.connect_timeout,
            })??;
        stream.set_nodelay(true)?;

        debug!(backend = %self.label, "opened backend connection");
        Ok(TcpConnection { stream })
    }
}

// -----------------------------------------------------------------------------
// ----- TcpConnection ---------------------------------------------------------

/// A bare stream to the backend. Idle connections must have nothing to read.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn health_check(&mut self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Ok(0) => false, // peer closed
            Ok(_) => false, // unsolicited bytes on an idle connection
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.shutdown().await {
            debug!("backend connection shutdown failed: {err}");
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
