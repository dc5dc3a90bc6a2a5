//! Connection task
//!
//! Owns the [`Engine`] and the WebSocket. Everything the client does goes
//! through one `select!` loop: commands from handles, inbound messages, the
//! in-flight connection attempt, the end-of-tick flush and the timers
//! (keepalive, reconnect backoff, background grace, call deadlines, token
//! expiry). Reconnects automatically with exponential backoff.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::auth::AuthReply;
use super::engine::{Engine, Reply};
use super::registry::{InitialFn, Observer, Query};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// In-flight connection attempt
type Dial = BoxFuture<'static, SyncResult<WsStream>>;

/// Stand-in deadline for timers that are switched off
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected; reconnecting if an endpoint is set
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected and flushing
    Connected,
    /// Closed because the host went to the background
    Suspended,
}

/// Events emitted by the connection task
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    Suspended,
    /// The auth token expires soon; renew it with `auth`
    TokenExpiring { expires_at: SystemTime },
    /// Connection attempt or transport failure
    Error(String),
}

/// Whether the host application is in the foreground
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Active,
    Inactive,
}

pub type ResolveFuture = BoxFuture<'static, SyncResult<String>>;

/// Where to connect
///
/// A resolver is invoked again on every connection attempt, so it can hand
/// out a fresh URL each time (endpoint discovery, signed URLs).
#[derive(Clone)]
pub enum Endpoint {
    Url(String),
    Resolver(Arc<dyn Fn() -> ResolveFuture + Send + Sync>),
}

impl Endpoint {
    pub fn resolver<F, Fut>(resolve: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<String>> + Send + 'static,
    {
        Endpoint::Resolver(Arc::new(move || -> ResolveFuture { Box::pin(resolve()) }))
    }

    pub async fn resolve(&self) -> SyncResult<String> {
        match self {
            Endpoint::Url(url) => Ok(url.clone()),
            Endpoint::Resolver(resolve) => resolve().await,
        }
    }
}

impl From<&str> for Endpoint {
    fn from(url: &str) -> Self {
        Endpoint::Url(url.to_string())
    }
}

impl From<String> for Endpoint {
    fn from(url: String) -> Self {
        Endpoint::Url(url)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Endpoint::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay before the next attempt; doubles for the one after
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Requests from [`SyncClient`](super::SyncClient) handles
pub(crate) enum Command {
    Connect(Endpoint),
    Disconnect,
    Observe {
        query: Query,
        observer: Observer,
        reply: oneshot::Sender<(u64, u32)>,
    },
    Unobserve {
        id: u64,
        subscriber: u32,
    },
    Get {
        query: Query,
        reply: InitialFn,
    },
    Call {
        name: String,
        payload: Value,
        reply: Reply,
    },
    Auth {
        token: Option<String>,
        options: Option<Value>,
        reply: AuthReply,
    },
    Track {
        event: String,
        payload: Option<Value>,
    },
    SetVisibility(Visibility),
    Close {
        done: oneshot::Sender<()>,
    },
}

/// What woke the loop up
enum Wake {
    Command(Option<Command>),
    Flush,
    Inbound(Option<Result<Message, tungstenite::Error>>),
    Dialed(SyncResult<WsStream>),
    Ping,
    Reconnect,
    Suspend,
    ExpireRequests,
    TokenExpiring,
}

pub(crate) struct Connection {
    engine: Engine,
    config: Config,
    endpoint: Option<Endpoint>,
    ws: Option<WsStream>,
    dial: Option<Dial>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    idle_deadline: Instant,
    suspend_at: Option<Instant>,
    suspended: bool,
    watched_token: Option<String>,
    expiry_notice_at: Option<Instant>,
    events: mpsc::UnboundedSender<SyncEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl Connection {
    pub(crate) fn new(
        engine: Engine,
        config: Config,
        events: mpsc::UnboundedSender<SyncEvent>,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        let backoff = Backoff::new(config.reconnect_floor(), config.reconnect_ceiling());
        Self {
            engine,
            config,
            endpoint: None,
            ws: None,
            dial: None,
            backoff,
            reconnect_at: None,
            idle_deadline: Instant::now() + FAR_FUTURE,
            suspend_at: None,
            suspended: false,
            watched_token: None,
            expiry_notice_at: None,
            events,
            status,
        }
    }

    /// Run until closed or every handle is dropped
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            self.watch_token();

            let connected = self.ws.is_some();
            let flush_ready = connected && self.engine.outbox().is_flush_scheduled();
            let far = Instant::now() + FAR_FUTURE;
            let reconnect_at = self.reconnect_at.filter(|_| !connected);
            let request_deadline = self.engine.next_request_deadline().map(Instant::from_std);

            let wake = tokio::select! {
                biased;

                cmd = commands.recv() => Wake::Command(cmd),

                // End of tick: no more commands are ready
                _ = std::future::ready(()), if flush_ready => Wake::Flush,

                msg = next_message(&mut self.ws) => Wake::Inbound(msg),

                result = next_dial(&mut self.dial) => Wake::Dialed(result),

                _ = sleep_until(self.idle_deadline), if connected => Wake::Ping,

                _ = sleep_until(reconnect_at.unwrap_or(far)), if reconnect_at.is_some() => Wake::Reconnect,

                _ = sleep_until(self.suspend_at.unwrap_or(far)), if self.suspend_at.is_some() => Wake::Suspend,

                _ = sleep_until(request_deadline.unwrap_or(far)), if request_deadline.is_some() => Wake::ExpireRequests,

                _ = sleep_until(self.expiry_notice_at.unwrap_or(far)), if self.expiry_notice_at.is_some() => Wake::TokenExpiring,
            };

            match wake {
                Wake::Command(Some(Command::Close { done })) => {
                    self.shutdown().await;
                    let _ = done.send(());
                    return;
                }
                Wake::Command(Some(cmd)) => self.handle_command(cmd).await,
                Wake::Command(None) => {
                    debug!("All client handles dropped");
                    self.shutdown().await;
                    return;
                }
                Wake::Flush => self.flush().await,
                Wake::Inbound(msg) => self.handle_inbound(msg),
                Wake::Ping => self.ping().await,
                Wake::Dialed(result) => self.dialed(result),
                Wake::Reconnect => self.open(),
                Wake::Suspend => self.suspend().await,
                Wake::ExpireRequests => {
                    self.engine.expire_requests(Instant::now().into_std());
                }
                Wake::TokenExpiring => {
                    self.expiry_notice_at = None;
                    if let Some(expires_at) = self.engine.token_expiry() {
                        info!("Auth token expires soon");
                        self.emit(SyncEvent::TokenExpiring { expires_at });
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Connect(endpoint) => {
                debug!("Connecting to {:?}", endpoint);
                self.endpoint = Some(endpoint);
                self.suspended = false;
                self.dial = None;
                if self.ws.is_some() {
                    self.close_socket().await;
                    self.emit(SyncEvent::Disconnected);
                }
                self.set_status(ConnectionStatus::Disconnected);
                self.backoff.reset();
                self.reconnect_at = Some(now);
            }
            Command::Disconnect => {
                self.endpoint = None;
                self.reconnect_at = None;
                self.dial = None;
                self.suspended = false;
                if self.ws.is_some() {
                    self.close_socket().await;
                    self.emit(SyncEvent::Disconnected);
                }
                self.set_status(ConnectionStatus::Disconnected);
            }
            Command::Observe {
                query,
                observer,
                reply,
            } => {
                let (id, subscriber) = self.engine.add_subscriber(query, observer, None);
                if reply.send((id, subscriber)).is_err() {
                    // Caller went away before learning its subscriber id
                    self.engine.remove_subscriber(id, Some(subscriber));
                }
            }
            Command::Unobserve { id, subscriber } => {
                self.engine.remove_subscriber(id, Some(subscriber));
            }
            Command::Get { query, reply } => {
                self.engine.add_get_subscriber(query, reply, None);
            }
            Command::Call {
                name,
                payload,
                reply,
            } => {
                self.engine.call(&name, payload, reply, now.into_std());
            }
            Command::Auth {
                token,
                options,
                reply,
            } => self.engine.send_token(token, options, Some(reply)),
            Command::Track { event, payload } => self.engine.track(&event, payload),
            Command::SetVisibility(Visibility::Inactive) => {
                if self.suspend_at.is_none() && !self.suspended {
                    debug!("Host inactive, suspending in {:?}", self.config.background_grace());
                    self.suspend_at = Some(now + self.config.background_grace());
                }
            }
            Command::SetVisibility(Visibility::Active) => {
                self.suspend_at = None;
                if self.suspended {
                    info!("Host active again, reconnecting");
                    self.suspended = false;
                    self.set_status(ConnectionStatus::Disconnected);
                    if self.endpoint.is_some() {
                        self.backoff.reset();
                        self.reconnect_at = Some(now);
                    }
                }
            }
            Command::Close { .. } => {}
        }
    }

    /// Start one connection attempt; the loop keeps serving commands while
    /// it is in flight
    fn open(&mut self) {
        self.reconnect_at = None;
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        self.set_status(ConnectionStatus::Connecting);
        self.dial = Some(Box::pin(connect(endpoint)));
    }

    /// A connection attempt finished; on failure schedule the next one
    fn dialed(&mut self, result: SyncResult<WsStream>) {
        self.dial = None;
        match result {
            Ok(ws) => {
                info!("Connected to sync server");
                self.ws = Some(ws);
                self.backoff.reset();
                self.idle_deadline = Instant::now() + self.config.ping_interval();
                self.engine.on_open();
                self.set_status(ConnectionStatus::Connected);
                self.emit(SyncEvent::Connected);
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                warn!("Connection failed: {} (retrying in {:?})", e, delay);
                self.set_status(ConnectionStatus::Disconnected);
                self.emit(SyncEvent::Error(e.to_string()));
                self.reconnect_at = Some(Instant::now() + delay);
            }
        }
    }

    async fn flush(&mut self) {
        let Some(ws) = self.ws.as_mut() else {
            return;
        };
        let Some((batch, bytes)) = self.engine.flush() else {
            return;
        };
        match ws.send(Message::Binary(bytes)).await {
            Ok(()) => self.idle_deadline = Instant::now() + self.config.ping_interval(),
            Err(e) => {
                self.engine.restore(batch);
                self.connection_lost(format!("write failed: {}", e));
            }
        }
    }

    async fn ping(&mut self) {
        let Some(ws) = self.ws.as_mut() else {
            return;
        };
        debug!("Keepalive ping");
        match ws.send(Message::Ping(Vec::new())).await {
            Ok(()) => self.idle_deadline = Instant::now() + self.config.ping_interval(),
            Err(e) => self.connection_lost(format!("keepalive failed: {}", e)),
        }
    }

    fn handle_inbound(&mut self, msg: Option<Result<Message, tungstenite::Error>>) {
        match msg {
            Some(Ok(Message::Binary(data))) => self.engine.handle_message(&data),
            Some(Ok(Message::Text(text))) => {
                warn!("Ignoring unexpected text message ({} bytes)", text.len());
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.into_owned())
                    .unwrap_or_else(|| "closed by server".to_string());
                self.connection_lost(reason);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => self.connection_lost(e.to_string()),
            None => self.connection_lost("stream ended".to_string()),
        }
    }

    /// Socket dropped underneath us: schedule a reconnect
    fn connection_lost(&mut self, reason: String) {
        warn!("Connection lost: {}", reason);
        self.ws = None;
        self.engine.on_close(Instant::now().into_std());
        self.set_status(ConnectionStatus::Disconnected);
        self.emit(SyncEvent::Disconnected);
        if self.endpoint.is_some() && !self.suspended {
            self.reconnect_at = Some(Instant::now() + self.backoff.next_delay());
        }
    }

    /// Close the socket on purpose; no reconnect is scheduled
    async fn close_socket(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            if let Err(e) = ws.close(None).await {
                debug!("Error closing socket: {}", e);
            }
            self.engine.on_close(Instant::now().into_std());
        }
    }

    async fn suspend(&mut self) {
        info!("Suspending connection while the host is inactive");
        self.suspend_at = None;
        self.suspended = true;
        self.reconnect_at = None;
        self.dial = None;
        self.close_socket().await;
        self.set_status(ConnectionStatus::Suspended);
        self.emit(SyncEvent::Suspended);
    }

    async fn shutdown(&mut self) {
        info!("Closing sync client");
        self.endpoint = None;
        self.dial = None;
        self.close_socket().await;
        self.engine.shutdown();
        if let Err(e) = self.engine.cache().save() {
            warn!("Failed to save checksum cache: {:#}", e);
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Re-arm the expiry notice whenever the token changes
    fn watch_token(&mut self) {
        if self.engine.token() == self.watched_token.as_deref() {
            return;
        }
        self.watched_token = self.engine.token().map(str::to_string);
        let margin = self.config.token_expiry_margin();
        self.expiry_notice_at = self.engine.token_expiry().map(|expires_at| {
            let remaining = expires_at
                .duration_since(SystemTime::now())
                .unwrap_or_default();
            Instant::now() + remaining.saturating_sub(margin)
        });
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_message(ws: &mut Option<WsStream>) -> Option<Result<Message, tungstenite::Error>> {
    match ws {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn next_dial(dial: &mut Option<Dial>) -> SyncResult<WsStream> {
    match dial {
        Some(dial) => dial.await,
        None => std::future::pending().await,
    }
}

/// Resolve the endpoint and open the socket, both under one timeout
async fn connect(endpoint: Endpoint) -> SyncResult<WsStream> {
    let attempt = async {
        let url = endpoint.resolve().await?;
        debug!("Connecting to {}", url);
        connect_async(url.as_str())
            .await
            .map(|(ws, _response)| ws)
            .map_err(|e| SyncError::Transport(format!("Failed to connect to sync server: {}", e)))
    };
    match tokio::time::timeout(CONNECT_TIMEOUT, attempt).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Transport(
            "Timeout connecting to sync server. Check that the server is running.".to_string(),
        )),
    }
}
