//! Abstract bidirectional frame channel to the room server.

use crate::token::Credential;
use async_trait::async_trait;
use std::sync::Arc;

/// Failure to establish a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connection attempt timed out")]
    Timeout,
    #[error("connection refused: {0}")]
    Refused(String),
    /// The server rejected the credential. Retrying with the same
    /// parameters will not help.
    #[error("credential rejected by server: {0}")]
    AuthRejected(String),
}

impl ConnectError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Refused(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("transport send failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReceiveError {
    /// The peer closed the connection or the stream ended.
    #[error("connection closed by peer")]
    Closed,
    #[error("transport receive failed: {0}")]
    Transport(String),
}

/// Opens connections to the room server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn Connection>, ConnectError>;
}

/// One open connection. Shared by the receive and heartbeat loops, so every
/// method takes `&self`; `send` is atomic per call.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), SendError>;

    /// Waits for the next frame, a peer close, or a transport error.
    async fn receive(&self) -> Result<Vec<u8>, ReceiveError>;

    /// Closes the connection. Idempotent.
    async fn close(&self);
}

/// Owns a connection for the lifetime of one session and guarantees it gets
/// closed on every exit path.
///
/// If the guard is dropped without [`ScopedConnection::close`] having run
/// (for example because the owning future was cancelled), the close is
/// scheduled on the current runtime instead.
pub struct ScopedConnection {
    inner: Option<Arc<dyn Connection>>,
}

impl ScopedConnection {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            inner: Some(connection),
        }
    }

    pub async fn close(mut self) {
        if let Some(connection) = self.inner.take() {
            connection.close().await;
        }
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.inner.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { connection.close().await });
            } else {
                tracing::warn!("Connection dropped outside a runtime; close skipped");
            }
        }
    }
}
