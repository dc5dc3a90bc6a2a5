//! Client state machine
//!
//! The engine owns every piece of client state: checksum cache, outgoing
//! queues, subscription registry, pending function calls and auth. It does
//! no I/O. The connection task feeds it frames and commands and writes
//! whatever [`Engine::flush`] hands back.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, warn};

use super::auth::AuthState;
use super::cache::ChecksumCache;
use super::message::{encode_batch, ClientOp};
use super::outbox::Outbox;
use super::patch::Patcher;
use super::registry::Subscription;
use crate::error::{SyncError, SyncResult};

/// Request ids are 24-bit on the wire
pub const REQUEST_ID_LIMIT: u32 = 1 << 24;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub type Reply = Box<dyn FnOnce(SyncResult<Value>) + Send>;

struct PendingRequest {
    name: String,
    reply: Reply,
    /// Set once the request is at risk: issued offline, or the connection
    /// dropped before its response arrived
    deadline: Option<Instant>,
}

pub struct Engine {
    pub(crate) cache: ChecksumCache,
    pub(crate) outbox: Outbox,
    pub(crate) subscriptions: HashMap<u64, Subscription>,
    pub(crate) auth: AuthState,
    pub(crate) connected: bool,
    pub(crate) patcher: Box<dyn Patcher>,
    requests: HashMap<u32, PendingRequest>,
    next_request: u32,
    request_timeout: Duration,
}

impl Engine {
    pub fn new(patcher: impl Patcher) -> Self {
        Self {
            cache: ChecksumCache::new(),
            outbox: Outbox::new(),
            subscriptions: HashMap::new(),
            auth: AuthState::default(),
            connected: false,
            patcher: Box::new(patcher),
            requests: HashMap::new(),
            next_request: 1,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_cache(mut self, cache: ChecksumCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn cache(&self) -> &ChecksumCache {
        &self.cache
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn subscription(&self, id: u64) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Queue a function call; `reply` receives its result
    pub fn call(&mut self, name: &str, payload: Value, reply: Reply, now: Instant) -> u32 {
        let request_id = self.next_request_id();
        let deadline = (!self.connected).then(|| now + self.request_timeout);
        self.requests.insert(
            request_id,
            PendingRequest {
                name: name.to_string(),
                reply,
                deadline,
            },
        );
        self.outbox.push(
            ClientOp::Call {
                request_id,
                name: name.to_string(),
                payload,
            },
            self.connected,
        );
        request_id
    }

    /// Queue an analytics event
    pub fn track(&mut self, event: &str, payload: Option<Value>) {
        self.outbox.push(
            ClientOp::Track {
                event: event.to_string(),
                payload,
            },
            self.connected,
        );
    }

    fn next_request_id(&mut self) -> u32 {
        loop {
            let id = self.next_request;
            self.next_request = (self.next_request + 1) % REQUEST_ID_LIMIT;
            if self.next_request == 0 {
                self.next_request = 1;
            }
            if !self.requests.contains_key(&id) {
                return id;
            }
        }
    }

    /// Settle a pending call
    pub(crate) fn resolve_request(&mut self, request_id: u32, result: SyncResult<Value>) {
        match self.requests.remove(&request_id) {
            Some(pending) => {
                if let Err(err) = &result {
                    debug!("Call {} ({}) failed: {}", request_id, pending.name, err);
                }
                (pending.reply)(result);
            }
            None => debug!("Response for unknown request {}", request_id),
        }
    }

    /// Earliest deadline among pending calls
    pub fn next_request_deadline(&self) -> Option<Instant> {
        self.requests.values().filter_map(|r| r.deadline).min()
    }

    /// Reject calls whose deadline has passed
    pub fn expire_requests(&mut self, now: Instant) -> usize {
        let expired: Vec<u32> = self
            .requests
            .iter()
            .filter(|(_, r)| r.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(pending) = self.requests.remove(id) {
                warn!("Call {} ({}) timed out without a connection", id, pending.name);
                (pending.reply)(Err(SyncError::ConnectionLost));
            }
        }
        expired.len()
    }

    /// Take everything queued and encode it as one message
    ///
    /// Returns the operations alongside the bytes so a failed write can hand
    /// them back through [`Engine::restore`].
    pub fn flush(&mut self) -> Option<(Vec<ClientOp>, Vec<u8>)> {
        let batch = self.outbox.take_batch()?;
        let bytes = match encode_batch(&batch) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Dropping unencodable batch of {} operation(s): {}", batch.len(), e);
                return None;
            }
        };
        for op in &batch {
            if let ClientOp::Subscribe { id, .. } = op {
                if let Some(sub) = self.subscriptions.get_mut(id) {
                    sub.on_wire = true;
                }
            }
        }
        debug!("Flushing {} operation(s), {} bytes", batch.len(), bytes.len());
        Some((batch, bytes))
    }

    /// Put back a batch whose write failed, ahead of anything queued since
    pub fn restore(&mut self, batch: Vec<ClientOp>) {
        self.outbox.restore(batch);
    }

    /// Connection opened: re-authenticate and resubscribe
    pub fn on_open(&mut self) {
        self.connected = true;
        if let Some(token) = self.auth.token.clone() {
            self.auth.being_auth = true;
            self.outbox.push(
                ClientOp::Auth {
                    token: Some(token),
                    options: self.auth.options.clone(),
                },
                true,
            );
        }
        self.resubscribe_all(false);
        for request in self.requests.values_mut() {
            request.deadline = None;
        }
        self.outbox.schedule_flush();
    }

    /// Connection lost: keep the queue, arm call deadlines
    pub fn on_close(&mut self, now: Instant) {
        self.connected = false;
        self.outbox.cancel_flush();
        for sub in self.subscriptions.values_mut() {
            sub.on_wire = false;
        }
        let timeout = self.request_timeout;
        for request in self.requests.values_mut() {
            request.deadline.get_or_insert(now + timeout);
        }
    }

    /// Client is going away: fail everything still waiting
    pub fn shutdown(&mut self) {
        self.connected = false;
        for (_, pending) in self.requests.drain() {
            (pending.reply)(Err(SyncError::ClientClosed));
        }
        self.auth.settle(Err(SyncError::ClientClosed));
        for (_, mut sub) in self.subscriptions.drain() {
            sub.abandon(&SyncError::ClientClosed);
        }
        self.outbox = Outbox::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::registry::{Observer, Query};
    use crate::sync::testing::{engine, Recorder};
    use serde_json::json;

    #[test]
    fn test_flush_marks_subscriptions_on_wire() {
        let mut engine = engine();
        engine.on_open();
        let (id, _) = engine.add_subscriber(Query::new(json!(1)), Observer::new().on_data(|_, _| {}), None);
        assert!(!engine.subscription(id).unwrap().on_wire);

        let (batch, bytes) = engine.flush().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(ClientOp::decode_batch(&bytes).unwrap(), batch);
        assert!(engine.subscription(id).unwrap().on_wire);
        assert!(engine.flush().is_none());
    }

    #[test]
    fn test_operations_survive_disconnect() {
        let mut engine = engine();
        let recorder = Recorder::new();
        let now = Instant::now();
        engine.call("ping", json!(null), recorder.reply(), now);
        engine.track("opened", None);
        assert!(!engine.outbox.is_flush_scheduled());

        engine.on_open();
        let (batch, _) = engine.flush().unwrap();
        assert!(matches!(batch[0], ClientOp::Call { .. }));
        assert!(matches!(batch[1], ClientOp::Track { .. }));
    }

    #[test]
    fn test_restore_puts_batch_first() {
        let mut engine = engine();
        engine.on_open();
        engine.track("first", None);
        let (batch, _) = engine.flush().unwrap();
        engine.track("second", None);

        engine.restore(batch);
        let (batch, _) = engine.flush().unwrap();
        let events: Vec<&str> = batch
            .iter()
            .filter_map(|op| match op {
                ClientOp::Track { event, .. } => Some(event.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(events, vec!["first", "second"]);
    }

    #[test]
    fn test_request_ids_wrap_and_skip_zero() {
        let mut engine = engine();
        engine.next_request = REQUEST_ID_LIMIT - 1;
        let now = Instant::now();

        let a = engine.call("a", json!(null), Recorder::new().reply(), now);
        let b = engine.call("b", json!(null), Recorder::new().reply(), now);
        assert_eq!(a, REQUEST_ID_LIMIT - 1);
        assert_eq!(b, 1);
    }

    #[test]
    fn test_request_ids_skip_pending() {
        let mut engine = engine();
        let now = Instant::now();
        let first = engine.call("a", json!(null), Recorder::new().reply(), now);
        engine.next_request = first;

        let second = engine.call("b", json!(null), Recorder::new().reply(), now);
        assert_ne!(first, second);
    }

    #[test]
    fn test_response_resolves_call() {
        let mut engine = engine();
        engine.on_open();
        let recorder = Recorder::new();
        let id = engine.call("add", json!([1, 2]), recorder.reply(), Instant::now());

        engine.resolve_request(id, Ok(json!(3)));
        assert_eq!(recorder.replies(), vec![Ok(json!(3))]);
        assert_eq!(engine.pending_requests(), 0);

        // Late duplicate is ignored
        engine.resolve_request(id, Ok(json!(4)));
        assert_eq!(recorder.replies().len(), 1);
    }

    #[test]
    fn test_calls_expire_after_disconnect() {
        let mut engine = engine().with_request_timeout(Duration::from_secs(15));
        engine.on_open();
        let recorder = Recorder::new();
        let start = Instant::now();
        engine.call("slow", json!(null), recorder.reply(), start);
        assert!(engine.next_request_deadline().is_none());

        engine.on_close(start);
        assert_eq!(
            engine.next_request_deadline(),
            Some(start + Duration::from_secs(15))
        );

        assert_eq!(engine.expire_requests(start + Duration::from_secs(14)), 0);
        assert_eq!(engine.expire_requests(start + Duration::from_secs(15)), 1);
        assert_eq!(recorder.replies(), vec![Err(SyncError::ConnectionLost)]);
    }

    #[test]
    fn test_reconnect_disarms_deadline() {
        let mut engine = engine();
        let start = Instant::now();
        engine.call("offline", json!(null), Recorder::new().reply(), start);
        assert!(engine.next_request_deadline().is_some());

        engine.on_open();
        assert!(engine.next_request_deadline().is_none());
    }

    #[test]
    fn test_on_open_resubscribes_after_close() {
        let mut engine = engine();
        engine.on_open();
        let (id, _) = engine.add_subscriber(Query::new(json!("x")), Observer::new().on_data(|_, _| {}), None);
        engine.flush();

        engine.on_close(Instant::now());
        assert!(!engine.subscription(id).unwrap().on_wire);
        assert!(engine.outbox.is_empty());

        engine.on_open();
        assert!(engine.outbox.is_flush_scheduled());
        assert!(matches!(
            engine.outbox.subscriptions(),
            [ClientOp::Subscribe { id: i, .. }] if *i == id
        ));
    }

    #[test]
    fn test_shutdown_rejects_everything() {
        let mut engine = engine();
        let call = Recorder::new();
        let get = Recorder::new();
        engine.call("x", json!(null), call.reply(), Instant::now());
        engine.add_get_subscriber(Query::new(json!("y")), get.initial(), None);

        engine.shutdown();
        assert_eq!(call.replies(), vec![Err(SyncError::ClientClosed)]);
        assert_eq!(get.initials(), vec![Err(SyncError::ClientClosed)]);
        assert_eq!(engine.subscription_count(), 0);
        assert!(engine.outbox.is_empty());
    }
}
