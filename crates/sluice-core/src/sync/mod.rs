//! Real-time sync client
//!
//! Keeps a local cache of server query results current over one WebSocket.
//!
//! ## Protocol
//!
//! 1. Client batches operations (subscribe, unsubscribe, get, resend, call,
//!    auth, track) and sends them as one binary message per tick
//! 2. Server answers with binary frames: full values, diffs against a
//!    checksum, "unchanged" notices, call responses, auth results, errors
//! 3. Diffs are applied only on top of the checksum they were computed
//!    against; anything else triggers a resend of the full value
//!
//! ## Usage
//!
//! ```ignore
//! let client = SyncClient::new(Config::load()?);
//! client.connect("wss://sync.example.com/ws")?;
//! let feed = client
//!     .observe(Query::named("feed", json!({ "limit": 10 })), Observer::new().on_data(|value, _| println!("{}", value)))
//!     .await?;
//! ```

mod auth;
mod cache;
mod client;
mod connection;
mod engine;
mod frame;
mod hash;
mod message;
mod outbox;
mod patch;
mod reconcile;
mod registry;

pub use auth::{token_expiry, AuthReply, AuthState};
pub use cache::{CacheEntry, ChecksumCache};
pub use client::{ObserveHandle, SyncClient};
pub use connection::{Backoff, ConnectionStatus, Endpoint, ResolveFuture, SyncEvent, Visibility};
pub use engine::{Engine, Reply, REQUEST_ID_LIMIT};
pub use frame::{
    Frame, FrameError, FrameHeader, FrameKind, HEADER_LEN, MAX_FRAME_LEN, MAX_INFLATED_LEN,
};
pub use hash::subscription_id;
pub use message::{encode_batch, tag, AuthUpdate, ClientOp, ErrorPayload};
pub use outbox::Outbox;
pub use patch::{MergePatch, PatchError, Patcher};
pub use registry::{
    AuthErrorState, DataFn, ErrorFn, InitialFn, Observer, Query, Subscription, SubscriptionKind,
};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use serde_json::Value;

    use super::auth::AuthReply;
    use super::engine::{Engine, Reply};
    use super::patch::MergePatch;
    use super::registry::{InitialFn, Observer};
    use crate::error::{SyncError, SyncResult};

    pub fn engine() -> Engine {
        Engine::new(MergePatch)
    }

    #[derive(Default)]
    struct Log {
        initials: Vec<SyncResult<Value>>,
        data: Vec<(Value, u64)>,
        errors: Vec<SyncError>,
        replies: Vec<SyncResult<Value>>,
        auth: Vec<SyncResult<bool>>,
    }

    /// Records every callback it hands out
    #[derive(Clone, Default)]
    pub struct Recorder(Arc<Mutex<Log>>);

    impl Recorder {
        pub fn new() -> Self {
            Self::default()
        }

        /// Observer with all three callbacks
        pub fn observer(&self) -> Observer {
            let (a, b, c) = (self.clone(), self.clone(), self.clone());
            Observer::new()
                .on_initial(move |result| a.0.lock().unwrap().initials.push(result))
                .on_data(move |value, checksum| {
                    b.0.lock().unwrap().data.push((value.clone(), checksum))
                })
                .on_error(move |error| c.0.lock().unwrap().errors.push(error.clone()))
        }

        pub fn initial(&self) -> InitialFn {
            let log = self.clone();
            Box::new(move |result| log.0.lock().unwrap().initials.push(result))
        }

        pub fn reply(&self) -> Reply {
            let log = self.clone();
            Box::new(move |result| log.0.lock().unwrap().replies.push(result))
        }

        pub fn auth_reply(&self) -> AuthReply {
            let log = self.clone();
            Box::new(move |result| log.0.lock().unwrap().auth.push(result))
        }

        pub fn initials(&self) -> Vec<SyncResult<Value>> {
            self.0.lock().unwrap().initials.clone()
        }

        pub fn data(&self) -> Vec<(Value, u64)> {
            self.0.lock().unwrap().data.clone()
        }

        pub fn errors(&self) -> Vec<SyncError> {
            self.0.lock().unwrap().errors.clone()
        }

        pub fn replies(&self) -> Vec<SyncResult<Value>> {
            self.0.lock().unwrap().replies.clone()
        }

        pub fn auth_results(&self) -> Vec<SyncResult<bool>> {
            self.0.lock().unwrap().auth.clone()
        }
    }
}
