//! Session state shared by the gateway and the cache.
//!
//! Authentication itself happens elsewhere; this only holds the bearer token
//! and raises the one-shot "session expired" signal on the first 401.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use libris_api_types::User;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "application::session";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Anonymous,
    SignedIn { user_id: i64 },
    /// Raised once per login when the backend rejects the token.
    Expired,
    SignedOut,
}

pub struct Session {
    token: RwLock<Option<String>>,
    user: RwLock<Option<User>>,
    expiry_notified: AtomicBool,
    events: watch::Sender<SessionEvent>,
}

impl Session {
    pub fn new() -> Self {
        let (events, _) = watch::channel(SessionEvent::Anonymous);
        Self {
            token: RwLock::new(None),
            user: RwLock::new(None),
            expiry_notified: AtomicBool::new(false),
            events,
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let session = Self::new();
        *rw_write(&session.token, SOURCE, "with_token") = Some(token.into());
        session
    }

    pub fn login(&self, token: impl Into<String>, user: User) {
        let user_id = user.id;
        *rw_write(&self.token, SOURCE, "login.token") = Some(token.into());
        *rw_write(&self.user, SOURCE, "login.user") = Some(user);
        self.expiry_notified.store(false, Ordering::SeqCst);
        self.events.send_replace(SessionEvent::SignedIn { user_id });
        info!(user_id, "Session started");
    }

    pub fn logout(&self) {
        self.clear();
        self.events.send_replace(SessionEvent::SignedOut);
        info!("Session ended");
    }

    pub fn token(&self) -> Option<String> {
        rw_read(&self.token, SOURCE, "token").clone()
    }

    pub fn user(&self) -> Option<User> {
        rw_read(&self.user, SOURCE, "user").clone()
    }

    pub fn is_authenticated(&self) -> bool {
        rw_read(&self.token, SOURCE, "is_authenticated").is_some()
    }

    /// Handle a 401: drop credentials and notify subscribers.
    ///
    /// Returns `true` only for the first 401 since the last login, so callers
    /// never emit duplicate "session expired" notifications.
    pub fn mark_unauthorized(&self) -> bool {
        self.clear();
        if self.expiry_notified.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!("Backend rejected the session token");
        self.events.send_replace(SessionEvent::Expired);
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn clear(&self) {
        *rw_write(&self.token, SOURCE, "clear.token") = None;
        *rw_write(&self.user, SOURCE, "clear.user") = None;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
