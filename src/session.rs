use std::{fmt, io, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{
    config::EndpointConfiguration,
    directory::DirectoryPathTracker,
    error::{Error, Result},
    filesystem::RemoteFilesystem,
};

/// An authenticated session with an open file-transfer channel.
#[async_trait]
pub trait RemoteSession: RemoteFilesystem {
    /// True while both the transport and the protocol client are usable.
    fn is_open(&self) -> bool;

    async fn close(&mut self) -> io::Result<()>;
}

/// Builds sessions. One connector belongs to one [`SessionManager`] and is only
/// called with the manager's lock held.
#[async_trait]
pub trait Connector: Send {
    type Session: RemoteSession + 'static;

    /// Runs a single connection attempt: transport, verification,
    /// authentication and protocol setup.
    async fn connect(&mut self, config: &Arc<EndpointConfiguration>) -> Result<Self::Session>;

    /// Drops whatever the connector keeps between attempts so the next
    /// attempt starts from scratch.
    fn reset(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Unconnected,
    Connecting,
    Open,
    Closed,
    Failed(String),
}

enum Slot<S> {
    Unconnected,
    Connecting,
    Open(S),
    Closed,
    Failed(String),
}

struct SessionState<C>
where
    C: Connector,
{
    connector: C,
    slot: Slot<C::Session>,
    tracker: DirectoryPathTracker,
}

/// Owns the single session of an endpoint.
///
/// Every operation holds one lock for its whole duration, including the
/// reconnect loop, so concurrent callers are served one at a time.
pub struct SessionManager<C>
where
    C: Connector,
{
    config: Arc<EndpointConfiguration>,
    state: Mutex<SessionState<C>>,
}

impl<C> SessionManager<C>
where
    C: Connector,
{
    pub fn new(config: Arc<EndpointConfiguration>, connector: C) -> Result<SessionManager<C>> {
        config.validate()?;
        let tracker = DirectoryPathTracker::new(config.stepwise);
        Ok(SessionManager {
            config,
            state: Mutex::new(SessionState {
                connector,
                slot: Slot::Unconnected,
                tracker,
            }),
        })
    }

    pub fn config(&self) -> &Arc<EndpointConfiguration> {
        &self.config
    }

    /// Waits for exclusive access to the session.
    pub async fn lock(&self) -> SessionGuard<'_, C> {
        SessionGuard {
            config: &self.config,
            state: self.state.lock().await,
        }
    }

    pub async fn ensure_connected(&self) -> Result<()> {
        self.lock().await.ensure_connected().await
    }

    pub async fn is_connected(&self) -> bool {
        self.lock().await.is_connected()
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.lock().await.disconnect().await
    }

    pub async fn force_disconnect(&self) {
        self.lock().await.force_disconnect().await
    }

    pub async fn status(&self) -> SessionStatus {
        self.lock().await.status()
    }
}

impl<C> fmt::Debug for SessionManager<C>
where
    C: Connector,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .finish_non_exhaustive()
    }
}

pub struct SessionGuard<'a, C>
where
    C: Connector,
{
    config: &'a Arc<EndpointConfiguration>,
    state: MutexGuard<'a, SessionState<C>>,
}

impl<C> SessionGuard<'_, C>
where
    C: Connector,
{
    pub fn config(&self) -> &EndpointConfiguration {
        self.config
    }

    pub fn is_connected(&self) -> bool {
        matches!(&self.state.slot, Slot::Open(session) if session.is_open())
    }

    pub fn status(&self) -> SessionStatus {
        match &self.state.slot {
            Slot::Unconnected => SessionStatus::Unconnected,
            Slot::Connecting => SessionStatus::Connecting,
            Slot::Open(session) if session.is_open() => SessionStatus::Open,
            Slot::Open(_) => SessionStatus::Failed("session closed by peer".into()),
            Slot::Closed => SessionStatus::Closed,
            Slot::Failed(reason) => SessionStatus::Failed(reason.clone()),
        }
    }

    /// Returns at once when the session is open, otherwise connects with up to
    /// `reconnect_attempts` retries spaced by `reconnect_delay`.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        if let Slot::Open(mut dead) = std::mem::replace(&mut self.state.slot, Slot::Unconnected) {
            debug!(host = %self.config.host, "discarding dead session");
            if let Err(err) = dead.close().await {
                debug!(error = %err, "closing dead session failed");
            }
            self.state.tracker.invalidate();
        }

        let config = self.config.clone();
        let attempts = config.reconnect_attempts.saturating_add(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            self.state.slot = Slot::Connecting;
            debug!(host = %config.host, port = config.port, attempt, attempts, "connecting");

            match self.state.connector.connect(&config).await {
                Ok(session) => {
                    info!(host = %config.host, port = config.port, user = %config.username, attempt, "session established");
                    self.state.slot = Slot::Open(session);
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        host = %config.host,
                        port = config.port,
                        attempt,
                        attempts,
                        error = %err,
                        "connection attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < attempts && !config.reconnect_delay.is_zero() {
                        tokio::time::sleep(config.reconnect_delay).await;
                    }
                }
            }
        }

        let source = last_error.unwrap_or(Error::NotConnected);
        self.state.slot = Slot::Failed(source.to_string());
        Err(Error::Connection {
            host: config.host.clone(),
            port: config.port,
            attempts,
            source: Box::new(source),
        })
    }

    /// Graceful teardown. The session is gone afterwards even if closing failed.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.state.tracker.invalidate();
        match std::mem::replace(&mut self.state.slot, Slot::Closed) {
            Slot::Open(mut session) => {
                info!(host = %self.config.host, "closing session");
                session
                    .close()
                    .await
                    .map_err(|err| Error::operation("disconnect", self.config.host.clone(), err))
            }
            _ => Ok(()),
        }
    }

    /// Best-effort teardown that also resets the connector. Never fails.
    pub async fn force_disconnect(&mut self) {
        self.state.tracker.invalidate();
        if let Slot::Open(mut session) = std::mem::replace(&mut self.state.slot, Slot::Closed) {
            if let Err(err) = session.close().await {
                debug!(host = %self.config.host, error = %err, "ignoring error while force closing session");
            }
        }
        self.state.connector.reset();
        info!(host = %self.config.host, "session forcibly disconnected");
    }

    /// Drops a session that hit an unrecoverable error; the next
    /// [`ensure_connected`](Self::ensure_connected) reconnects.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(host = %self.config.host, %reason, "session marked as failed");
        self.state.tracker.invalidate();
        self.state.slot = Slot::Failed(reason);
    }

    pub fn session(&self) -> Result<&C::Session> {
        match &self.state.slot {
            Slot::Open(session) => Ok(session),
            _ => Err(Error::NotConnected),
        }
    }

    pub fn tracker(&self) -> &DirectoryPathTracker {
        &self.state.tracker
    }

    /// The session together with the directory tracker, for operations that
    /// query the session and then move the cursor.
    pub fn parts(&mut self) -> Result<(&C::Session, &mut DirectoryPathTracker)> {
        let state = &mut *self.state;
        match &state.slot {
            Slot::Open(session) => Ok((session, &mut state.tracker)),
            _ => Err(Error::NotConnected),
        }
    }
}
