//! Applying server frames
//!
//! The cache only ever moves forward along checksums the server confirmed.
//! A diff whose base does not match the cache, or that fails to apply,
//! costs one round trip for the full value instead of corrupting state.

use serde_json::Value;
use tracing::{debug, error, warn};

use super::engine::Engine;
use super::frame::Frame;
use super::message::{ClientOp, ErrorPayload};
use super::registry::SubscriptionKind;
use crate::error::SyncError;

impl Engine {
    /// Decode and apply every frame of an incoming message
    ///
    /// A malformed frame ends processing of the message; frames before it
    /// have already been applied.
    pub fn handle_message(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            match Frame::decode(bytes) {
                Ok((frame, consumed)) => {
                    self.handle_frame(frame);
                    bytes = &bytes[consumed..];
                }
                Err(e) => {
                    warn!("Dropping malformed frame ({} bytes left): {}", bytes.len(), e);
                    return;
                }
            }
        }
    }

    pub fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::FunctionResponse {
                request_id,
                payload,
            } => self.resolve_request(request_id, Ok(payload.unwrap_or(Value::Null))),
            Frame::SubscriptionData {
                id,
                checksum,
                payload,
            } => self.apply_full(id, checksum, payload.unwrap_or(Value::Null)),
            Frame::SubscriptionDiff {
                id,
                checksum,
                previous_checksum,
                patch,
            } => self.apply_diff(id, previous_checksum, checksum, patch),
            Frame::GetUnchanged { id } => self.apply_unchanged(id),
            Frame::Auth { payload } => self.handle_auth(payload.as_ref()),
            Frame::Error { payload } => self.handle_error(ErrorPayload::from_value(payload)),
        }
    }

    fn apply_full(&mut self, id: u64, checksum: u64, value: Value) {
        let unchanged = self.cache.checksum(id) == Some(checksum);
        if !unchanged {
            self.cache.insert(id, value, checksum);
        }
        self.fan_out(id, !unchanged);
    }

    fn apply_diff(&mut self, id: u64, from: u64, to: u64, patch: Option<Value>) {
        let Some(sub) = self.subscriptions.get(&id) else {
            debug!("Ignoring diff for unknown subscription {}", id);
            return;
        };
        let query = sub.query.to_string();

        match self.cache.checksum(id) {
            None => {
                debug!("Diff for {} without a cached base", id);
                self.request_resend(id);
            }
            Some(current) if current != from => {
                if current == to {
                    // Already there; only waiting subscribers care
                    self.fan_out(id, false);
                } else {
                    debug!(
                        "Diff for {} based on {:x}, cache has {:x}",
                        id, from, current
                    );
                    self.request_resend(id);
                }
            }
            Some(_) => {
                let Some(entry) = self.cache.remove(id) else {
                    return;
                };
                let next = match patch {
                    Some(patch) => self.patcher.apply(entry.value, &patch),
                    None => Ok(entry.value),
                };
                match next {
                    Ok(value) => {
                        self.cache.insert(id, value, to);
                        self.fan_out(id, true);
                    }
                    Err(e) => {
                        error!("Corrupt patch for subscription {} ({}): {}", id, query, e);
                        self.request_resend(id);
                    }
                }
            }
        }
    }

    fn apply_unchanged(&mut self, id: u64) {
        if self.cache.contains(id) {
            self.fan_out(id, false);
            return;
        }
        let Some(sub) = self.subscriptions.get(&id) else {
            return;
        };
        debug!("Unchanged reply for {} without a cached value", id);
        if sub.kind == SubscriptionKind::Get {
            let query = sub.query.clone();
            self.outbox.push(
                ClientOp::Get {
                    id,
                    query: query.payload,
                    name: query.name,
                    checksum: None,
                },
                self.connected,
            );
        } else {
            self.request_resend(id);
        }
    }

    fn handle_error(&mut self, payload: ErrorPayload) {
        warn!(
            "Server error (request {:?}, subscription {:?}): {}",
            payload.request_id, payload.observable_id, payload.message
        );

        let error = if payload.auth {
            SyncError::Unauthorized {
                message: payload.message.clone(),
            }
        } else {
            SyncError::server(payload.code, payload.message.clone())
        };

        if let Some(request_id) = payload.request_id {
            self.resolve_request(request_id, Err(error.clone()));
        }

        let Some(id) = payload.observable_id else {
            return;
        };
        if payload.auth {
            self.auth_failure(id, payload.message);
            return;
        }
        if let Some(sub) = self.subscriptions.get_mut(&id) {
            sub.fail(&error, true);
        }
        self.release_if_empty(id);
    }

    /// Deliver the cached value of `id` to its subscribers
    fn fan_out(&mut self, id: u64, with_data: bool) {
        let (Some(entry), Some(sub)) = (self.cache.get(id), self.subscriptions.get_mut(&id))
        else {
            return;
        };
        sub.auth_error = None;
        sub.deliver(&entry.value, entry.checksum, with_data);
        self.release_if_empty(id);
    }

    /// Ask for the full value of `id`, once
    fn request_resend(&mut self, id: u64) {
        let pending = self
            .outbox
            .has_subscription_op(|op| matches!(op, ClientOp::Resend { id: i } if *i == id));
        if !pending {
            self.outbox.push(ClientOp::Resend { id }, self.connected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::patch::PatchError;
    use crate::sync::registry::Query;
    use crate::sync::testing::{engine, Recorder};
    use serde_json::json;

    fn resends(engine: &Engine, id: u64) -> usize {
        engine
            .outbox
            .subscriptions()
            .iter()
            .filter(|op| matches!(op, ClientOp::Resend { id: i } if *i == id))
            .count()
    }

    fn observed(engine: &mut Engine, payload: Value) -> (u64, Recorder) {
        let recorder = Recorder::new();
        let (id, _) = engine.add_subscriber(Query::new(payload), recorder.observer(), None);
        (id, recorder)
    }

    #[test]
    fn test_full_data_fills_cache_and_fans_out() {
        let mut engine = engine();
        let (id, recorder) = observed(&mut engine, json!("feed"));

        engine.handle_frame(Frame::SubscriptionData {
            id,
            checksum: 10,
            payload: Some(json!({ "a": 1 })),
        });

        assert_eq!(engine.cache.checksum(id), Some(10));
        assert_eq!(recorder.initials(), vec![Ok(json!({ "a": 1 }))]);
        assert_eq!(recorder.data(), vec![(json!({ "a": 1 }), 10)]);
    }

    #[test]
    fn test_full_data_without_record_still_caches() {
        let mut engine = engine();
        engine.handle_frame(Frame::SubscriptionData {
            id: 77,
            checksum: 1,
            payload: Some(json!(1)),
        });
        assert_eq!(engine.cache.checksum(77), Some(1));
    }

    #[test]
    fn test_unchanged_full_data_only_settles_initials() {
        let mut engine = engine();
        let query = Query::new(json!("feed"));
        let id = query.id();
        engine.cache.insert(id, json!(1), 10);
        let get = Recorder::new();
        engine.add_get_subscriber(query, get.initial(), None);

        engine.handle_frame(Frame::SubscriptionData {
            id,
            checksum: 10,
            payload: Some(json!(1)),
        });

        assert_eq!(get.initials(), vec![Ok(json!(1))]);
        assert!(engine.subscription(id).is_none());
    }

    #[test]
    fn test_repeated_full_data_does_not_refire() {
        let mut engine = engine();
        let (id, live) = observed(&mut engine, json!("feed"));
        for _ in 0..2 {
            engine.handle_frame(Frame::SubscriptionData {
                id,
                checksum: 10,
                payload: Some(json!(1)),
            });
        }
        assert_eq!(live.data(), vec![(json!(1), 10)]);
    }

    #[test]
    fn test_diff_applies_in_order() {
        let mut engine = engine();
        let (id, recorder) = observed(&mut engine, json!("doc"));
        engine.handle_frame(Frame::SubscriptionData {
            id,
            checksum: 1,
            payload: Some(json!({ "title": "a", "n": 1 })),
        });

        engine.handle_frame(Frame::SubscriptionDiff {
            id,
            checksum: 2,
            previous_checksum: 1,
            patch: Some(json!({ "n": 2 })),
        });

        assert_eq!(engine.cache.checksum(id), Some(2));
        assert_eq!(
            recorder.data(),
            vec![
                (json!({ "title": "a", "n": 1 }), 1),
                (json!({ "title": "a", "n": 2 }), 2)
            ]
        );
        assert_eq!(resends(&engine, id), 0);
    }

    #[test]
    fn test_diff_without_cache_requests_resend_once() {
        let mut engine = engine();
        let (id, recorder) = observed(&mut engine, json!("doc"));

        for _ in 0..2 {
            engine.handle_frame(Frame::SubscriptionDiff {
                id,
                checksum: 2,
                previous_checksum: 1,
                patch: Some(json!({})),
            });
        }

        assert_eq!(resends(&engine, id), 1);
        assert!(recorder.data().is_empty());
        assert!(engine.cache.checksum(id).is_none());
    }

    #[test]
    fn test_stale_diff_requests_resend() {
        let mut engine = engine();
        let (id, recorder) = observed(&mut engine, json!("doc"));
        engine.handle_frame(Frame::SubscriptionData {
            id,
            checksum: 5,
            payload: Some(json!({ "n": 5 })),
        });

        engine.handle_frame(Frame::SubscriptionDiff {
            id,
            checksum: 4,
            previous_checksum: 3,
            patch: Some(json!({ "n": 4 })),
        });

        assert_eq!(engine.cache.checksum(id), Some(5));
        assert_eq!(resends(&engine, id), 1);
        assert_eq!(recorder.data().len(), 1);
    }

    #[test]
    fn test_diff_to_current_checksum_settles_waiters() {
        let mut engine = engine();
        let (id, recorder) = observed(&mut engine, json!("doc"));
        // Cache caught up through another path before this diff arrived
        engine.cache.insert(id, json!("cached"), 9);

        engine.handle_frame(Frame::SubscriptionDiff {
            id,
            checksum: 9,
            previous_checksum: 8,
            patch: Some(json!("ignored")),
        });

        assert_eq!(recorder.initials(), vec![Ok(json!("cached"))]);
        assert!(recorder.data().is_empty());
        assert_eq!(resends(&engine, id), 0);
    }

    #[test]
    fn test_corrupt_patch_drops_cache_and_resends() {
        let failing = |_: Value, _: &Value| -> Result<Value, PatchError> {
            Err(PatchError::Mismatch("bad index".to_string()))
        };
        let mut engine = Engine::new(failing);
        let (id, recorder) = observed(&mut engine, json!("doc"));
        engine.handle_frame(Frame::SubscriptionData {
            id,
            checksum: 1,
            payload: Some(json!([1, 2])),
        });

        engine.handle_frame(Frame::SubscriptionDiff {
            id,
            checksum: 2,
            previous_checksum: 1,
            patch: Some(json!([3])),
        });

        assert!(!engine.cache.contains(id));
        assert_eq!(resends(&engine, id), 1);
        assert_eq!(recorder.data().len(), 1);
        assert!(engine.subscription(id).is_some());
    }

    #[test]
    fn test_null_merge_result_drops_cache_and_resends() {
        let mut engine = engine();
        let (id, recorder) = observed(&mut engine, json!("doc"));
        engine.handle_frame(Frame::SubscriptionData {
            id,
            checksum: 1,
            payload: Some(json!({ "n": 1 })),
        });

        for _ in 0..2 {
            engine.handle_frame(Frame::SubscriptionDiff {
                id,
                checksum: 2,
                previous_checksum: 1,
                patch: Some(Value::Null),
            });
        }

        assert!(!engine.cache.contains(id));
        assert_eq!(resends(&engine, id), 1);
        assert_eq!(recorder.data(), vec![(json!({ "n": 1 }), 1)]);
        assert!(recorder.errors().is_empty());
    }

    #[test]
    fn test_diff_for_unknown_subscription_is_ignored() {
        let mut engine = engine();
        engine.cache.insert(3, json!(1), 1);
        engine.handle_frame(Frame::SubscriptionDiff {
            id: 3,
            checksum: 2,
            previous_checksum: 1,
            patch: Some(json!(2)),
        });
        assert_eq!(engine.cache.checksum(3), Some(1));
        assert!(engine.outbox.is_empty());
    }

    #[test]
    fn test_get_unchanged_uses_cache() {
        let mut engine = engine();
        let query = Query::new(json!("user"));
        engine.cache.insert(query.id(), json!({ "name": "ada" }), 4);
        let get = Recorder::new();
        let id = engine.add_get_subscriber(query, get.initial(), None);

        engine.handle_frame(Frame::GetUnchanged { id });

        assert_eq!(get.initials(), vec![Ok(json!({ "name": "ada" }))]);
        assert!(engine.subscription(id).is_none());
    }

    #[test]
    fn test_get_unchanged_without_cache_refetches() {
        let mut engine = engine();
        engine.on_open();
        let id = engine.add_get_subscriber(Query::new(json!("user")), Recorder::new().initial(), None);
        engine.flush();

        engine.handle_frame(Frame::GetUnchanged { id });
        assert!(matches!(
            engine.outbox.subscriptions(),
            [ClientOp::Get { id: i, checksum: None, .. }] if *i == id
        ));
    }

    #[test]
    fn test_subscription_error_fails_initial_and_keeps_cache() {
        let mut engine = engine();
        engine.on_open();
        let (id, recorder) = observed(&mut engine, json!("q"));
        engine.cache.insert(id, json!("old"), 1);

        engine.handle_frame(Frame::Error {
            payload: Some(json!({ "observableId": id, "code": 500, "message": "boom" })),
        });

        let expected = SyncError::server(Some(500), "boom");
        assert_eq!(recorder.initials(), vec![Err(expected.clone())]);
        assert_eq!(recorder.errors(), vec![expected]);
        assert!(engine.cache.contains(id));
        assert!(engine.subscription(id).is_some());
    }

    #[test]
    fn test_auth_error_defers_initial_until_success() {
        let mut engine = engine();
        let (id, recorder) = observed(&mut engine, json!("private"));

        engine.handle_frame(Frame::Error {
            payload: Some(json!({ "observableId": id, "auth": true, "message": "login first" })),
        });
        assert!(recorder.initials().is_empty());
        assert_eq!(recorder.errors().len(), 1);
        assert!(engine.subscription(id).unwrap().auth_error.is_some());

        engine.handle_frame(Frame::SubscriptionData {
            id,
            checksum: 2,
            payload: Some(json!("ok")),
        });
        assert_eq!(recorder.initials(), vec![Ok(json!("ok"))]);
        assert!(engine.subscription(id).unwrap().auth_error.is_none());
    }

    #[test]
    fn test_error_resolves_call() {
        let mut engine = engine();
        engine.on_open();
        let recorder = Recorder::new();
        let request_id = engine.call("fail", json!(null), recorder.reply(), std::time::Instant::now());

        engine.handle_frame(Frame::Error {
            payload: Some(json!({ "requestId": request_id, "message": "nope" })),
        });
        assert_eq!(
            recorder.replies(),
            vec![Err(SyncError::server(None, "nope"))]
        );
    }

    #[test]
    fn test_handle_message_applies_frames_before_garbage() {
        let mut engine = engine();
        let (id, recorder) = observed(&mut engine, json!("multi"));
        let mut bytes = Frame::SubscriptionData {
            id,
            checksum: 1,
            payload: Some(json!(1)),
        }
        .encode(false)
        .unwrap();
        bytes.extend(
            Frame::SubscriptionDiff {
                id,
                checksum: 2,
                previous_checksum: 1,
                patch: Some(json!(2)),
            }
            .encode(true)
            .unwrap(),
        );
        bytes.extend([0xff, 0xff]);

        engine.handle_message(&bytes);
        assert_eq!(recorder.data(), vec![(json!(1), 1), (json!(2), 2)]);
    }
}
