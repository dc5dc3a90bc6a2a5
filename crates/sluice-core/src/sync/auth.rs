//! Auth lifecycle
//!
//! A token change is sent as part of the next batch together with a
//! resubscribe of everything, so the server re-validates every subscription
//! under the new identity before answering.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::engine::Engine;
use super::message::{AuthUpdate, ClientOp};
use super::registry::AuthErrorState;
use crate::error::{SyncError, SyncResult};

pub type AuthReply = Box<dyn FnOnce(SyncResult<bool>) + Send>;

#[derive(Default)]
pub struct AuthState {
    pub token: Option<String>,
    pub options: Option<Value>,
    /// A token was sent and the server has not answered yet
    pub being_auth: bool,
    waiters: Vec<AuthReply>,
}

impl AuthState {
    /// Resolve everyone waiting on the outstanding token change
    pub(crate) fn settle(&mut self, result: SyncResult<bool>) {
        self.being_auth = false;
        for waiter in self.waiters.drain(..) {
            waiter(result.clone());
        }
    }
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("being_auth", &self.being_auth)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

impl Engine {
    pub fn token(&self) -> Option<&str> {
        self.auth.token.as_deref()
    }

    pub fn is_authenticating(&self) -> bool {
        self.auth.being_auth
    }

    /// Install (or with `None`, clear) the auth token
    ///
    /// `reply` resolves with whether the client ends up authenticated, once
    /// the server answers.
    pub fn send_token(
        &mut self,
        token: Option<String>,
        options: Option<Value>,
        reply: Option<AuthReply>,
    ) {
        self.auth.being_auth = true;
        self.auth.token = token;
        self.auth.options = options;
        if let Some(reply) = reply {
            self.auth.waiters.push(reply);
        }

        if self.auth.token.is_none() {
            // Cached values may have been visible only to the old identity
            let live = &self.subscriptions;
            self.cache.retain(|id| live.contains_key(&id));
        }

        if !self.connected {
            if self.auth.token.is_none() {
                // A fresh connection starts unauthenticated anyway
                self.auth.settle(Ok(false));
            }
            return;
        }

        self.outbox.push(
            ClientOp::Auth {
                token: self.auth.token.clone(),
                options: self.auth.options.clone(),
            },
            true,
        );
        self.resubscribe_all(true);
        self.outbox.schedule_flush();
    }

    /// Apply an auth frame
    pub(crate) fn handle_auth(&mut self, payload: Option<&Value>) {
        match AuthUpdate::from_payload(payload) {
            AuthUpdate::Confirmed => {
                debug!("Token accepted");
                self.auth.settle(Ok(true));
            }
            AuthUpdate::Cleared => {
                info!("Server cleared authentication");
                self.auth.token = None;
                self.auth.options = None;
                self.auth.settle(Ok(false));
            }
            AuthUpdate::Rejected(message) => {
                warn!("Token rejected: {}", message);
                self.auth.token = None;
                self.auth.options = None;
                self.auth.settle(Err(SyncError::AuthRejected { message }));
            }
            AuthUpdate::Replaced { token, options } => {
                info!("Server replaced the auth token");
                self.auth.token = Some(token);
                self.auth.options = options;
                self.auth.settle(Ok(true));
            }
            AuthUpdate::Invalidate(ids) => {
                for id in ids {
                    self.cache.remove(id);
                    self.auth_failure(id, "Access revoked by server".to_string());
                }
            }
        }
    }

    /// Record an authorization failure on a subscription and notify its
    /// error handlers. Pending initial values stay pending until a later
    /// token is accepted for the subscription.
    pub(crate) fn auth_failure(&mut self, id: u64, message: String) {
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            debug!("Auth failure for unknown subscription {}", id);
            return;
        };
        warn!("Subscription {} unauthorized: {}", sub.query, message);
        let error = SyncError::Unauthorized { message };
        sub.auth_error = Some(AuthErrorState {
            token: self.auth.token.clone(),
            error: error.clone(),
        });
        sub.fail(&error, false);
    }

    /// When the current token stops being valid, if it says so
    pub fn token_expiry(&self) -> Option<SystemTime> {
        self.auth.token.as_deref().and_then(token_expiry)
    }
}

/// Read the `exp` claim of a JWT without verifying it
pub fn token_expiry(token: &str) -> Option<SystemTime> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;

    let claims = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(claims.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_u64()?;
    Some(UNIX_EPOCH + Duration::from_secs(exp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::registry::{Observer, Query};
    use crate::sync::testing::{engine, Recorder};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use serde_json::json;

    fn jwt(claims: Value) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        )
    }

    #[test]
    fn test_token_expiry() {
        let token = jwt(json!({ "sub": "u1", "exp": 1_700_000_000u64 }));
        assert_eq!(
            token_expiry(&token),
            Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
        );

        assert!(token_expiry(&jwt(json!({ "sub": "u1" }))).is_none());
        assert!(token_expiry("opaque-token").is_none());
        assert!(token_expiry("a.!!!.c").is_none());
    }

    #[test]
    fn test_send_token_while_connected_resubscribes() {
        let mut engine = engine();
        engine.on_open();
        let (id, _) = engine.add_subscriber(Query::new(json!("a")), Observer::new().on_data(|_, _| {}), None);
        engine.flush();

        engine.send_token(Some("t1".to_string()), None, None);
        assert!(engine.is_authenticating());
        assert!(engine.outbox.is_flush_scheduled());

        let (batch, _) = engine.flush().unwrap();
        assert!(matches!(&batch[0], ClientOp::Auth { token: Some(t), .. } if t == "t1"));
        assert!(matches!(
            &batch[1],
            ClientOp::Subscribe { id: i, reply_unchanged: true, .. } if *i == id
        ));
    }

    #[test]
    fn test_confirmation_resolves_waiters() {
        let mut engine = engine();
        engine.on_open();
        let recorder = Recorder::new();
        engine.send_token(Some("t1".to_string()), None, Some(recorder.auth_reply()));
        assert!(recorder.auth_results().is_empty());

        engine.handle_auth(Some(&json!(true)));
        assert_eq!(recorder.auth_results(), vec![Ok(true)]);
        assert!(!engine.is_authenticating());
        assert_eq!(engine.token(), Some("t1"));
    }

    #[test]
    fn test_rejection_clears_token() {
        let mut engine = engine();
        engine.on_open();
        let recorder = Recorder::new();
        engine.send_token(Some("bad".to_string()), None, Some(recorder.auth_reply()));

        engine.handle_auth(Some(&json!({ "error": "expired" })));
        assert_eq!(
            recorder.auth_results(),
            vec![Err(SyncError::AuthRejected {
                message: "expired".to_string()
            })]
        );
        assert!(engine.token().is_none());
    }

    #[test]
    fn test_logout_purges_orphaned_cache() {
        let mut engine = engine();
        let (live, _) = engine.add_subscriber(Query::new(json!("live")), Observer::new().on_data(|_, _| {}), None);
        engine.cache.insert(live, json!(1), 1);
        engine.cache.insert(999, json!(2), 2);

        let recorder = Recorder::new();
        engine.send_token(None, None, Some(recorder.auth_reply()));

        assert!(engine.cache.contains(live));
        assert!(!engine.cache.contains(999));
        // Offline logout settles immediately
        assert_eq!(recorder.auth_results(), vec![Ok(false)]);
    }

    #[test]
    fn test_offline_token_is_sent_on_open() {
        let mut engine = engine();
        let recorder = Recorder::new();
        engine.send_token(Some("t1".to_string()), Some(json!({ "v": 2 })), Some(recorder.auth_reply()));
        assert!(engine.outbox.is_empty());

        engine.on_open();
        let (batch, _) = engine.flush().unwrap();
        assert_eq!(
            batch,
            vec![ClientOp::Auth {
                token: Some("t1".to_string()),
                options: Some(json!({ "v": 2 })),
            }]
        );
        engine.handle_auth(Some(&json!(true)));
        assert_eq!(recorder.auth_results(), vec![Ok(true)]);
    }

    #[test]
    fn test_invalidate_keeps_record() {
        let mut engine = engine();
        engine.on_open();
        engine.send_token(Some("t1".to_string()), None, None);
        let recorder = Recorder::new();
        let (id, _) = engine.add_subscriber(Query::new(json!("secret")), recorder.observer(), None);
        engine.cache.insert(id, json!("classified"), 5);

        engine.handle_auth(Some(&json!({ "invalidate": [id] })));

        assert!(!engine.cache.contains(id));
        let sub = engine.subscription(id).unwrap();
        assert_eq!(sub.refcount(), 1);
        let state = sub.auth_error.as_ref().unwrap();
        assert_eq!(state.token.as_deref(), Some("t1"));
        assert!(state.error.is_auth());
        assert_eq!(recorder.errors().len(), 1);
    }

    #[test]
    fn test_replaced_token() {
        let mut engine = engine();
        engine.on_open();
        engine.handle_auth(Some(&json!({ "token": "t2", "options": { "refresh": true } })));
        assert_eq!(engine.token(), Some("t2"));
        assert_eq!(engine.auth.options, Some(json!({ "refresh": true })));
    }
}
