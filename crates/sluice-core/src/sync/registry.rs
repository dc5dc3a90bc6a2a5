//! Subscription registry
//!
//! One record per subscription id, however many local observers share it.
//! Adding and removing observers rewrites the not-yet-sent queue so the
//! server sees at most one live subscription per id and never a redundant
//! subscribe/unsubscribe pair.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use tracing::debug;

use super::engine::Engine;
use super::hash::subscription_id;
use super::message::ClientOp;
use crate::error::{SyncError, SyncResult};

pub type InitialFn = Box<dyn FnOnce(SyncResult<Value>) + Send>;
pub type DataFn = Box<dyn FnMut(&Value, u64) + Send>;
pub type ErrorFn = Box<dyn FnMut(&SyncError) + Send>;

/// A query as seen by the server: an optional function name plus its payload
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub name: Option<String>,
    pub payload: Value,
}

impl Query {
    pub fn new(payload: Value) -> Self {
        Self {
            name: None,
            payload,
        }
    }

    pub fn named(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: Some(name.into()),
            payload,
        }
    }

    /// Subscription id shared by every identical query
    pub fn id(&self) -> u64 {
        subscription_id(self.name.as_deref(), &self.payload)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}({})", name, self.payload),
            None => write!(f, "{}", self.payload),
        }
    }
}

/// Callbacks of one local subscriber
///
/// `on_initial` fires at most once, with the first value (or error).
/// `on_data` fires for every confirmed value and keeps the subscriber alive;
/// a subscriber without it is dropped once its initial value is delivered.
#[derive(Default)]
pub struct Observer {
    on_initial: Option<InitialFn>,
    on_data: Option<DataFn>,
    on_error: Option<ErrorFn>,
}

impl Observer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_initial(mut self, f: impl FnOnce(SyncResult<Value>) + Send + 'static) -> Self {
        self.on_initial = Some(Box::new(f));
        self
    }

    pub fn on_data(mut self, f: impl FnMut(&Value, u64) + Send + 'static) -> Self {
        self.on_data = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&SyncError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Whether this subscriber wants ongoing updates
    pub fn is_persistent(&self) -> bool {
        self.on_data.is_some()
    }

    pub fn awaits_initial(&self) -> bool {
        self.on_initial.is_some()
    }

    fn deliver_initial(&mut self, result: SyncResult<Value>) {
        if let Some(f) = self.on_initial.take() {
            f(result);
        }
    }

    fn deliver_data(&mut self, value: &Value, checksum: u64) {
        if let Some(f) = self.on_data.as_mut() {
            f(value, checksum);
        }
    }

    fn deliver_error(&mut self, error: &SyncError) {
        if let Some(f) = self.on_error.as_mut() {
            f(error);
        }
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("on_initial", &self.on_initial.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Server-side shape of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Server pushes every change
    Observe,
    /// Single reply; every subscriber only wants its initial value
    Get,
}

/// Last authorization failure of a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct AuthErrorState {
    /// Token that was current when the failure was reported
    pub token: Option<String>,
    pub error: SyncError,
}

/// Registry entry for one subscription id
#[derive(Debug)]
pub struct Subscription {
    pub query: Query,
    pub kind: SubscriptionKind,
    pub auth_error: Option<AuthErrorState>,
    /// A subscribe for this id went out on the current connection
    pub on_wire: bool,
    subscribers: BTreeMap<u32, Observer>,
    next_subscriber: u32,
}

impl Subscription {
    fn new(query: Query, kind: SubscriptionKind) -> Self {
        Self {
            query,
            kind,
            auth_error: None,
            on_wire: false,
            subscribers: BTreeMap::new(),
            next_subscriber: 1,
        }
    }

    fn attach(&mut self, observer: Observer) -> u32 {
        let id = self.next_subscriber;
        self.next_subscriber = self.next_subscriber.wrapping_add(1).max(1);
        self.subscribers.insert(id, observer);
        id
    }

    /// Number of live subscribers
    pub fn refcount(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn has_subscriber(&self, subscriber: u32) -> bool {
        self.subscribers.contains_key(&subscriber)
    }

    pub fn has_pending_initial(&self) -> bool {
        self.subscribers.values().any(Observer::awaits_initial)
    }

    /// Fire pending `on_initial`s, drop satisfied one-shot subscribers, then
    /// fire `on_data` when `with_data` is set
    pub(crate) fn deliver(&mut self, value: &Value, checksum: u64, with_data: bool) {
        for observer in self.subscribers.values_mut() {
            observer.deliver_initial(Ok(value.clone()));
        }
        self.subscribers.retain(|_, observer| observer.is_persistent());
        if with_data {
            for observer in self.subscribers.values_mut() {
                observer.deliver_data(value, checksum);
            }
        }
    }

    /// Deliver a cached value to a single, just-attached subscriber
    fn deliver_to(&mut self, subscriber: u32, value: &Value, checksum: u64) {
        let Some(observer) = self.subscribers.get_mut(&subscriber) else {
            return;
        };
        observer.deliver_initial(Ok(value.clone()));
        if observer.is_persistent() {
            observer.deliver_data(value, checksum);
        } else {
            self.subscribers.remove(&subscriber);
        }
    }

    /// Report a failure: `on_initial` (when `settle`) and `on_error`
    ///
    /// With `settle`, one-shot subscribers are dropped afterwards. Without
    /// it, pending `on_initial`s stay queued until the failure is resolved.
    pub(crate) fn fail(&mut self, error: &SyncError, settle: bool) {
        for observer in self.subscribers.values_mut() {
            if settle {
                observer.deliver_initial(Err(error.clone()));
            }
            observer.deliver_error(error);
        }
        if settle {
            self.subscribers.retain(|_, observer| observer.is_persistent());
        }
    }

    /// Fail every pending `on_initial` and forget all subscribers
    pub(crate) fn abandon(&mut self, error: &SyncError) {
        for (_, mut observer) in std::mem::take(&mut self.subscribers) {
            observer.deliver_initial(Err(error.clone()));
        }
    }
}

fn targets(op: &ClientOp, id: u64) -> bool {
    op.subscription_id() == Some(id)
}

impl Engine {
    /// Register a subscriber for a live query
    ///
    /// Returns the subscription id and the subscriber id to pass to
    /// [`Engine::remove_subscriber`].
    pub fn add_subscriber(
        &mut self,
        query: Query,
        observer: Observer,
        explicit_id: Option<u64>,
    ) -> (u64, u32) {
        let id = explicit_id.unwrap_or_else(|| query.id());
        let persistent = observer.is_persistent();

        let subscriber = match self.subscriptions.get_mut(&id) {
            Some(sub) => {
                let subscriber = sub.attach(observer);
                if persistent && sub.kind == SubscriptionKind::Get {
                    debug!("Upgrading get {} to a subscription", id);
                    sub.kind = SubscriptionKind::Observe;
                    self.outbox
                        .drop_subscription_ops(|op| matches!(op, ClientOp::Get { id: i, .. } if *i == id));
                    self.upsert_subscribe(id, true);
                }
                subscriber
            }
            None => {
                let mut sub = Subscription::new(query, SubscriptionKind::Observe);
                let subscriber = sub.attach(observer);
                let query = sub.query.clone();

                // A pending unsubscribe means the server still holds the
                // subscription we are about to reuse
                sub.on_wire = self
                    .outbox
                    .has_subscription_op(|op| matches!(op, ClientOp::Unsubscribe { id: i } if *i == id));
                self.subscriptions.insert(id, sub);

                let had_get = self
                    .outbox
                    .has_subscription_op(|op| matches!(op, ClientOp::Get { id: i, .. } if *i == id));
                self.outbox.drop_subscription_ops(|op| {
                    targets(op, id) && !matches!(op, ClientOp::Subscribe { .. })
                });
                self.push_subscribe(id, query, had_get);
                subscriber
            }
        };

        if let (Some(entry), Some(sub)) = (self.cache.get(id), self.subscriptions.get_mut(&id)) {
            sub.deliver_to(subscriber, &entry.value, entry.checksum);
        }
        self.release_if_empty(id);

        (id, subscriber)
    }

    /// Register a one-shot subscriber that only wants the current value
    pub fn add_get_subscriber(
        &mut self,
        query: Query,
        on_initial: InitialFn,
        explicit_id: Option<u64>,
    ) -> u64 {
        let id = explicit_id.unwrap_or_else(|| query.id());
        let observer = Observer {
            on_initial: Some(on_initial),
            ..Observer::default()
        };

        if let Some(sub) = self.subscriptions.get_mut(&id) {
            if sub.kind == SubscriptionKind::Observe {
                if let Some(entry) = self.cache.get(id).filter(|_| sub.auth_error.is_none()) {
                    // Live subscription keeps the cache current
                    if let Some(f) = observer.on_initial {
                        f(Ok(entry.value.clone()));
                    }
                    return id;
                }
                sub.attach(observer);
                if let Some(ClientOp::Subscribe {
                    reply_unchanged, ..
                }) = self.outbox.find_subscription_op(|op| {
                    matches!(op, ClientOp::Subscribe { id: i, .. } if *i == id)
                }) {
                    *reply_unchanged = true;
                }
            } else {
                sub.attach(observer);
            }
            return id;
        }

        let mut sub = Subscription::new(query, SubscriptionKind::Get);
        sub.attach(observer);
        let query = sub.query.clone();
        self.subscriptions.insert(id, sub);

        let pending = self.outbox.has_subscription_op(|op| {
            matches!(op, ClientOp::Get { id: i, .. } if *i == id)
        });
        if !pending {
            self.outbox.push(
                ClientOp::Get {
                    id,
                    query: query.payload,
                    name: query.name,
                    checksum: self.cache.checksum(id),
                },
                self.connected,
            );
        }
        id
    }

    /// Remove one subscriber, or every subscriber when `subscriber` is `None`
    ///
    /// Returns false when the subscription or subscriber was unknown.
    pub fn remove_subscriber(&mut self, id: u64, subscriber: Option<u32>) -> bool {
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            return false;
        };
        let removed = match subscriber {
            Some(subscriber) => sub.subscribers.remove(&subscriber).is_some(),
            None => {
                sub.subscribers.clear();
                true
            }
        };
        self.release_if_empty(id);
        removed
    }

    /// Destroy the record for `id` once its last subscriber is gone
    pub(crate) fn release_if_empty(&mut self, id: u64) {
        if !self.subscriptions.get(&id).is_some_and(Subscription::is_empty) {
            return;
        }
        let Some(sub) = self.subscriptions.remove(&id) else {
            return;
        };

        // Anything not yet sent for this id is moot now.
        let cancelled = self.outbox.drop_subscription_ops(|op| {
            targets(op, id) && !matches!(op, ClientOp::Unsubscribe { .. })
        });

        let already_pending = self
            .outbox
            .has_subscription_op(|op| matches!(op, ClientOp::Unsubscribe { id: i } if *i == id));
        if sub.kind == SubscriptionKind::Observe && sub.on_wire && !already_pending {
            self.outbox
                .push(ClientOp::Unsubscribe { id }, self.connected);
        }
        debug!(
            "Released subscription {} ({} queued operation(s) cancelled)",
            id, cancelled
        );
    }

    /// Queue a subscribe for every record, e.g. after reconnecting or a
    /// token change. `force_reply` asks the server to answer even when the
    /// cached checksum is still current.
    pub(crate) fn resubscribe_all(&mut self, force_reply: bool) {
        let records: Vec<(u64, SubscriptionKind, bool, Query)> = self
            .subscriptions
            .iter()
            .map(|(id, sub)| (*id, sub.kind, sub.has_pending_initial(), sub.query.clone()))
            .collect();

        for (id, kind, awaiting, query) in records {
            match kind {
                SubscriptionKind::Observe => self.upsert_subscribe(id, force_reply || awaiting),
                SubscriptionKind::Get => {
                    let pending = self.outbox.has_subscription_op(|op| {
                        matches!(op, ClientOp::Get { id: i, .. } if *i == id)
                    });
                    if !pending {
                        self.outbox.push(
                            ClientOp::Get {
                                id,
                                query: query.payload,
                                name: query.name,
                                checksum: self.cache.checksum(id),
                            },
                            self.connected,
                        );
                    }
                }
            }
        }
    }

    /// Refresh a pending subscribe in place, or queue a new one
    fn upsert_subscribe(&mut self, id: u64, reply: bool) {
        let Some(query) = self.subscriptions.get(&id).map(|sub| sub.query.clone()) else {
            return;
        };
        self.push_subscribe(id, query, reply);
    }

    fn push_subscribe(&mut self, id: u64, query: Query, reply: bool) {
        let cached = self.cache.checksum(id);
        if let Some(ClientOp::Subscribe {
            checksum,
            reply_unchanged,
            ..
        }) = self
            .outbox
            .find_subscription_op(|op| matches!(op, ClientOp::Subscribe { id: i, .. } if *i == id))
        {
            *checksum = cached;
            *reply_unchanged |= reply;
            return;
        }
        self.outbox.push(
            ClientOp::Subscribe {
                id,
                query: query.payload,
                name: query.name,
                checksum: cached,
                reply_unchanged: reply,
            },
            self.connected,
        );
    }
}
