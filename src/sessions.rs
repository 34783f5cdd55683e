//! Per-client state keyed by a session cookie.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::request::Request;
use crate::response::Response;

/// A bag of string values belonging to one client.
#[derive(Debug, Clone)]
pub struct Session {
    key: String,
    values: HashMap<String, String>,
    last_access: Instant,
}

impl Session {
    fn new(key: String) -> Self {
        Self {
            key,
            values: HashMap::new(),
            last_access: Instant::now(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self, name: &str, fallback: &str) -> String {
        self.values
            .get(name)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_string(), value.into());
    }

    pub fn unset(&mut self, name: &str) -> Option<String> {
        self.values.remove(name)
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    fn touch(&mut self, now: Instant) {
        self.last_access = now;
    }
}

/// Session store shared by every controller. Owned by the poll thread while serving.
#[derive(Debug)]
pub struct Sessions {
    cookie: String,
    ttl: Duration,
    sessions: HashMap<String, Session>,
}

impl Default for Sessions {
    fn default() -> Self {
        Self::new("sessid", Duration::from_secs(3600))
    }
}

impl Sessions {
    /// A zero `ttl` keeps sessions until they are removed explicitly.
    pub fn new(cookie: impl Into<String>, ttl: Duration) -> Self {
        Self {
            cookie: cookie.into(),
            ttl,
            sessions: HashMap::new(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie
    }

    // Intent: find the caller's session from its cookie, creating one on first contact.
    // Result: a live session; new sessions also set the cookie on the response.
    pub fn get(&mut self, request: &Request, response: &mut Response) -> &mut Session {
        let now = Instant::now();
        let presented = request.cookie(&self.cookie, "");
        let key = if !presented.is_empty() && self.sessions.contains_key(&presented) {
            presented
        } else {
            let key = uuid::Uuid::new_v4().simple().to_string();
            response.set_cookie(&self.cookie, &key);
            tracing::debug!(session = %key, "created session");
            self.sessions.insert(key.clone(), Session::new(key.clone()));
            key
        };
        let session = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| Session::new(key));
        session.touch(now);
        session
    }

    pub fn get_by_key(&mut self, key: &str) -> Option<&mut Session> {
        let session = self.sessions.get_mut(key)?;
        session.touch(Instant::now());
        Some(session)
    }

    pub fn remove(&mut self, key: &str) -> Option<Session> {
        self.sessions.remove(key)
    }

    /// Drop sessions idle for longer than the configured TTL.
    pub fn garbage_collect(&mut self, now: Instant) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let ttl = self.ttl;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now.saturating_duration_since(session.last_access) <= ttl);
        let expired = before - self.sessions.len();
        if expired > 0 {
            tracing::debug!(expired, remaining = self.sessions.len(), "expired idle sessions");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
