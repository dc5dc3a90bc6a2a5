//! Sync client handle
//!
//! [`SyncClient`] is a thin handle: every method turns into a command for
//! the connection task, and results come back over oneshot channels.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info_span, warn, Instrument};

use super::cache::ChecksumCache;
use super::connection::{Command, Connection, ConnectionStatus, Endpoint, SyncEvent, Visibility};
use super::engine::Engine;
use super::patch::{MergePatch, Patcher};
use super::registry::{Observer, Query};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};

/// Client for a sync server
pub struct SyncClient {
    commands: mpsc::UnboundedSender<Command>,
    /// Status receiver for external monitoring
    status_rx: watch::Receiver<ConnectionStatus>,
    /// Event receiver
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    /// Tags this client's log lines
    session_id: String,
}

impl SyncClient {
    /// Create a client that applies diffs as JSON merge patches
    ///
    /// Spawns the connection task, so this must be called from within a
    /// Tokio runtime. Nothing connects until [`SyncClient::connect`].
    pub fn new(config: Config) -> Self {
        Self::with_patcher(config, MergePatch)
    }

    /// Create a client with a custom diff format
    pub fn with_patcher(config: Config, patcher: impl Patcher) -> Self {
        let cache = match &config.cache_path {
            Some(path) => ChecksumCache::with_path(path.clone()).unwrap_or_else(|e| {
                warn!("Ignoring unreadable checksum cache {:?}: {:#}", path, e);
                ChecksumCache::new()
            }),
            None => ChecksumCache::new(),
        };
        let engine = Engine::new(patcher)
            .with_cache(cache)
            .with_request_timeout(config.request_timeout());

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let session_id = format!("sluice-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let connection = Connection::new(engine, config, event_tx, status_tx);
        tokio::spawn(
            connection
                .run(command_rx)
                .instrument(info_span!("sync", session = %session_id)),
        );

        Self {
            commands: command_tx,
            status_rx,
            event_rx: Some(event_rx),
            session_id,
        }
    }

    /// Start connecting (and keep reconnecting) to `endpoint`
    pub fn connect(&self, endpoint: impl Into<Endpoint>) -> SyncResult<()> {
        self.send(Command::Connect(endpoint.into()))
    }

    /// Close the connection and stop reconnecting; queued work is kept
    pub fn disconnect(&self) -> SyncResult<()> {
        self.send(Command::Disconnect)
    }

    /// Subscribe to a live query
    ///
    /// The subscription lasts until the returned handle is dropped or
    /// [`ObserveHandle::unsubscribe`] is called.
    pub async fn observe(&self, query: Query, observer: Observer) -> SyncResult<ObserveHandle> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Observe {
            query,
            observer,
            reply: tx,
        })?;
        let (id, subscriber) = rx.await.map_err(|_| SyncError::TaskGone)?;
        Ok(ObserveHandle {
            id,
            subscriber,
            commands: self.commands.clone(),
            active: true,
        })
    }

    /// Fetch the current value of a query once
    pub async fn get(&self, query: Query) -> SyncResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Get {
            query,
            reply: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        })?;
        rx.await.map_err(|_| SyncError::TaskGone)?
    }

    /// Call a server function
    pub async fn call(&self, name: &str, payload: Value) -> SyncResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Call {
            name: name.to_string(),
            payload,
            reply: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        })?;
        rx.await.map_err(|_| SyncError::TaskGone)?
    }

    /// Set the auth token, or log out with `None`
    ///
    /// Resolves with whether the server considers the client authenticated.
    pub async fn auth(&self, token: Option<String>, options: Option<Value>) -> SyncResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Auth {
            token,
            options,
            reply: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        })?;
        rx.await.map_err(|_| SyncError::TaskGone)?
    }

    /// Send an analytics event
    pub fn track(&self, event: &str, payload: Option<Value>) -> SyncResult<()> {
        self.send(Command::Track {
            event: event.to_string(),
            payload,
        })
    }

    /// Tell the client whether the host is in the foreground
    pub fn set_visibility(&self, visibility: Visibility) -> SyncResult<()> {
        self.send(Command::SetVisibility(visibility))
    }

    /// Get the current status
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Subscribe to status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Shut down: fail everything pending, save the cache, close the socket
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Close { done: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, cmd: Command) -> SyncResult<()> {
        self.commands.send(cmd).map_err(|_| SyncError::TaskGone)
    }
}

/// Keeps a subscription alive
#[derive(Debug)]
pub struct ObserveHandle {
    id: u64,
    subscriber: u32,
    commands: mpsc::UnboundedSender<Command>,
    active: bool,
}

impl ObserveHandle {
    /// Subscription id shared by every observer of the same query
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.active) {
            let _ = self.commands.send(Command::Unobserve {
                id: self.id,
                subscriber: self.subscriber,
            });
        }
    }
}

impl Drop for ObserveHandle {
    fn drop(&mut self) {
        self.release();
    }
}
