//! Sluice Core Library
//!
//! This crate provides the client side of Sluice, a real-time data sync
//! protocol: a local cache of server query results that is kept current over
//! a single WebSocket, plus request/response function calls on the same
//! connection.
//!
//! # Architecture
//!
//! - **Engine**: owns the checksum cache, outgoing queues, subscription
//!   registry and pending calls; does no I/O
//! - **Connection task**: owns the engine and the socket, one per client
//! - **SyncClient**: cheap handle that talks to the task over channels
//!
//! # Quick Start
//!
//! ```text
//! let client = SyncClient::new(Config::load()?);
//! client.connect("wss://sync.example.com/ws")?;
//!
//! // One-shot read
//! let user = client.get(Query::named("user", json!({ "id": 1 }))).await?;
//!
//! // Function call
//! let sum = client.call("add", json!([1, 2])).await?;
//! ```
//!
//! # Modules
//!
//! - `sync`: wire codec, cache, registry, reconciler and connection task
//! - `config`: client configuration
//! - `error`: error types

pub mod config;
pub mod error;
pub mod sync;

pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use sync::{
    ConnectionStatus, Endpoint, ObserveHandle, Observer, Query, SyncClient, SyncEvent, Visibility,
};
