//! Session lifecycle management.
//!
//! A [`SessionManager`] drives one logical room membership through
//! `Connecting → Connected → Reconnecting → …` until it is stopped or runs
//! out of attempts. While connected it runs exactly two tasks against the
//! shared connection: a receive loop feeding the [`EventRouter`] and a
//! heartbeat loop. Whichever ends first cancels the other, the connection is
//! closed, and the control loop decides whether to retry.

use crate::backoff::ReconnectPolicy;
use crate::frame::{HeartbeatStats, InboundFrame, OutboundFrame};
use crate::router::{DispatchContext, EventRouter};
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::token::{Capability, DEFAULT_TOKEN_TTL, SigningError, TokenIssuer};
use crate::transport::{ConnectError, Connection, ReceiveError, ScopedConnection, Transport};
use chrono::Utc;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Fatal session outcomes. Transport-level disruptions never surface here;
/// they are absorbed by reconnection.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to issue access token: {0}")]
    Signing(#[from] SigningError),
    #[error("credential rejected by server: {0}")]
    AuthRejected(String),
    #[error("gave up after {attempts} failed connection attempts")]
    Exhausted { attempts: u32 },
    #[error("session task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: String,
    pub room: String,
    pub identity: String,
    pub capabilities: BTreeSet<Capability>,
    pub token_ttl: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Longest silence tolerated from the server before the connection is
    /// considered lost.
    pub idle_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    pub fn new(
        endpoint: impl Into<String>,
        room: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            room: room.into(),
            identity: identity.into(),
            capabilities: Capability::agent_defaults(),
            token_ttl: DEFAULT_TOKEN_TTL,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        for (name, value) in [
            ("endpoint", &self.endpoint),
            ("room", &self.room),
            ("identity", &self.identity),
        ] {
            if value.trim().is_empty() {
                return Err(SessionError::InvalidConfig(format!("{name} must not be empty")));
            }
        }
        for (name, value) in [
            ("token_ttl", self.token_ttl),
            ("connect_timeout", self.connect_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("idle_timeout", self.idle_timeout),
        ] {
            if value.is_zero() {
                return Err(SessionError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Why a connected session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskExit {
    Cancelled,
    PeerClosed,
    IdleTimeout,
    Failed(String),
}

pub struct SessionManager {
    config: SessionConfig,
    issuer: TokenIssuer,
    transport: Arc<dyn Transport>,
    router: Arc<EventRouter>,
    stats: Arc<ConnectionStats>,
    state: watch::Sender<SessionState>,
    attempts: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        issuer: TokenIssuer,
        transport: Arc<dyn Transport>,
        router: Arc<EventRouter>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            issuer,
            transport,
            router,
            stats: Arc::new(ConnectionStats::new()),
            state,
            attempts: Arc::new(AtomicU32::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` to stop the session instead of a private one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        self.stats.clone()
    }

    pub fn router(&self) -> Arc<EventRouter> {
        self.router.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns the control loop and returns a handle to observe and stop it.
    pub fn start(self) -> SessionHandle {
        let state = self.watch_state();
        let stats = self.stats.clone();
        let router = self.router.clone();
        let attempts = self.attempts.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move { self.run().await });
        SessionHandle {
            state,
            stats,
            router,
            attempts,
            cancel,
            task: Some(task),
            outcome: None,
        }
    }

    /// Runs the control loop to completion.
    ///
    /// Returns `Ok(())` when stopped through the cancellation token and an
    /// error for every fatal outcome. The state is `Stopped` on return.
    pub async fn run(&self) -> Result<(), SessionError> {
        let span = info_span!("session", room = %self.config.room, identity = %self.config.identity);
        let result = async {
            self.config.validate()?;
            self.control_loop().await
        }
        .instrument(span)
        .await;
        self.set_state(SessionState::Stopped);
        result
    }

    async fn control_loop(&self) -> Result<(), SessionError> {
        let policy = &self.config.reconnect;
        let mut attempts: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                info!("Stop requested");
                return Ok(());
            }
            self.set_state(SessionState::Connecting);

            let credential = self.issuer.issue(
                &self.config.room,
                &self.config.identity,
                &self.config.capabilities,
                self.config.token_ttl,
            )?;

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Stop requested while connecting");
                    return Ok(());
                }
                result = tokio::time::timeout(
                    self.config.connect_timeout,
                    self.transport.connect(&self.config.endpoint, &credential),
                ) => result.unwrap_or(Err(ConnectError::Timeout)),
            };

            let retry_delay = match connected {
                Ok(connection) => {
                    attempts = 0;
                    self.attempts.store(0, Ordering::SeqCst);
                    self.stats.mark_connected(Utc::now());
                    self.set_state(SessionState::Connected);

                    let exit = self.run_connected(connection).await;
                    if self.cancel.is_cancelled() {
                        info!("Stop requested; connection closed");
                        return Ok(());
                    }
                    warn!(reason = ?exit, "Connection lost");
                    policy.delay(1)
                }
                Err(ConnectError::AuthRejected(reason)) => {
                    error!(%reason, "Server rejected the access token; not retrying");
                    return Err(SessionError::AuthRejected(reason));
                }
                Err(e) => {
                    attempts = attempts.saturating_add(1);
                    self.attempts.store(attempts, Ordering::SeqCst);
                    if !policy.should_retry(attempts) {
                        error!(
                            error = %e,
                            attempts,
                            "Connection attempts exhausted; giving up"
                        );
                        return Err(SessionError::Exhausted { attempts });
                    }
                    warn!(
                        error = %e,
                        attempt = attempts,
                        max_attempts = policy.max_attempts,
                        "Connection attempt failed"
                    );
                    policy.delay(attempts)
                }
            };

            self.set_state(SessionState::Reconnecting);
            info!(delay = ?retry_delay, "Reconnecting after backoff");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Stop requested during backoff");
                    return Ok(());
                }
                _ = tokio::time::sleep(retry_delay) => {}
            }
        }
    }

    /// Runs the receive and heartbeat loops until either ends, then tears
    /// both down and closes the connection.
    async fn run_connected(&self, connection: Arc<dyn Connection>) -> TaskExit {
        let scoped = ScopedConnection::new(connection.clone());
        let session_cancel = self.cancel.child_token();
        let mut tasks = JoinSet::new();

        tasks.spawn(
            receive_loop(
                connection.clone(),
                self.router.clone(),
                self.stats.clone(),
                self.config.idle_timeout,
                session_cancel.clone(),
            )
            .in_current_span(),
        );
        tasks.spawn(
            heartbeat_loop(
                connection,
                self.router.clone(),
                self.stats.clone(),
                self.config.heartbeat_interval,
                session_cancel.clone(),
            )
            .in_current_span(),
        );

        let exit = match tasks.join_next().await {
            Some(Ok(exit)) => exit,
            Some(Err(e)) => TaskExit::Failed(format!("session task aborted: {e}")),
            None => TaskExit::Cancelled,
        };
        session_cancel.cancel();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Session task ended abnormally");
            }
        }
        scoped.close().await;
        exit
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Session state changed");
        }
    }
}

async fn receive_loop(
    connection: Arc<dyn Connection>,
    router: Arc<EventRouter>,
    stats: Arc<ConnectionStats>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> TaskExit {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return TaskExit::Cancelled,
            result = tokio::time::timeout(idle_timeout, connection.receive()) => result,
        };
        let raw = match received {
            Ok(Ok(raw)) => raw,
            Ok(Err(ReceiveError::Closed)) => {
                info!("Server closed the connection");
                return TaskExit::PeerClosed;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Receive failed");
                return TaskExit::Failed(e.to_string());
            }
            Err(_) => {
                warn!(?idle_timeout, "No frames from server within idle timeout");
                return TaskExit::IdleTimeout;
            }
        };
        stats.record_received();

        let frame = match InboundFrame::decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, bytes = raw.len(), "Dropping undecodable frame");
                continue;
            }
        };
        debug!(kind = frame.kind(), "Frame received");

        let ctx = DispatchContext { stats: &stats };
        let replies = tokio::select! {
            _ = cancel.cancelled() => return TaskExit::Cancelled,
            replies = router.dispatch(frame, &ctx) => replies,
        };
        for reply in replies {
            if let Err(exit) = send_frame(connection.as_ref(), &stats, &reply, &cancel).await {
                return exit;
            }
        }
    }
}

async fn heartbeat_loop(
    connection: Arc<dyn Connection>,
    router: Arc<EventRouter>,
    stats: Arc<ConnectionStats>,
    interval: Duration,
    cancel: CancellationToken,
) -> TaskExit {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return TaskExit::Cancelled,
            _ = ticker.tick() => {}
        }
        let ping = OutboundFrame::Ping {
            timestamp: Utc::now().timestamp(),
            stats: HeartbeatStats {
                messages_sent: stats.messages_sent(),
                messages_received: stats.messages_received(),
                audio_units_processed: stats.audio_units_processed(),
                participants_count: router.participant_count(),
            },
        };
        if let Err(exit) = send_frame(connection.as_ref(), &stats, &ping, &cancel).await {
            return exit;
        }
    }
}

async fn send_frame(
    connection: &dyn Connection,
    stats: &ConnectionStats,
    frame: &OutboundFrame,
    cancel: &CancellationToken,
) -> Result<(), TaskExit> {
    if cancel.is_cancelled() {
        return Err(TaskExit::Cancelled);
    }
    let bytes = match frame.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, kind = frame.kind(), "Failed to encode outbound frame");
            return Ok(());
        }
    };
    let sent = tokio::select! {
        _ = cancel.cancelled() => return Err(TaskExit::Cancelled),
        sent = connection.send(bytes) => sent,
    };
    match sent {
        Ok(()) => {
            stats.record_sent();
            debug!(kind = frame.kind(), "Frame sent");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, kind = frame.kind(), "Send failed");
            Err(TaskExit::Failed(e.to_string()))
        }
    }
}

/// Owner-side handle to a running session.
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    stats: Arc<ConnectionStats>,
    router: Arc<EventRouter>,
    attempts: Arc<AtomicU32>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), SessionError>>>,
    outcome: Option<Result<(), SessionError>>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Failed connection attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the session. Returns once the connection is closed and both
    /// session tasks have ended. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Waits for the session to end on its own (or through its token) and
    /// returns the outcome.
    pub async fn wait(mut self) -> Result<(), SessionError> {
        self.join().await;
        self.outcome.take().unwrap_or(Ok(()))
    }

    async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let outcome = match task.await {
                Ok(result) => result,
                Err(e) => Err(SessionError::Task(e.to_string())),
            };
            self.outcome = Some(outcome);
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
