// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Connection bookkeeping for the relay server.
//!
//! - [`SessionId`]: unique identifier for an inbound connection
//! - [`SessionInfo`]: who is connected, from where, and for how long
//! - [`SessionManager`]: all live connections, bounded by a capacity

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use thiserror::Error;

use super::auth::AuthMethodTag;

/// Errors from session bookkeeping.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Connection limit has been reached.
    #[error("too many concurrent connections (limit: {limit})")]
    TooManySessions { limit: usize },

    /// Session was not found.
    #[error("session not found")]
    SessionNotFound,
}

/// Unique identifier for an inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a new unique session ID.
    ///
    /// Uses `Ordering::SeqCst` so IDs are strictly ordered across threads,
    /// which keeps log output in connection order.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value of the session ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Information about one inbound connection.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique identifier for this session.
    pub id: SessionId,

    /// Username of the authenticated user (if authenticated).
    pub user: Option<String>,

    /// How the user authenticated.
    pub method: Option<AuthMethodTag>,

    /// Remote address of the connected client.
    pub peer_addr: Option<SocketAddr>,

    /// Timestamp when the session was created.
    pub started_at: Instant,

    /// Whether the user has been authenticated.
    pub authenticated: bool,

    /// Number of failed authentication attempts.
    pub auth_attempts: u32,
}

impl SessionInfo {
    /// Create a new session info with the given peer address.
    pub fn new(peer_addr: Option<SocketAddr>) -> Self {
        Self {
            id: SessionId::new(),
            user: None,
            method: None,
            peer_addr,
            started_at: Instant::now(),
            authenticated: false,
            auth_attempts: 0,
        }
    }

    /// Mark the session as authenticated.
    pub fn authenticate(&mut self, username: impl Into<String>, method: AuthMethodTag) {
        self.user = Some(username.into());
        self.method = Some(method);
        self.authenticated = true;
    }

    /// Increment the authentication attempt counter.
    pub fn increment_auth_attempts(&mut self) {
        self.auth_attempts += 1;
    }

    /// Get the session duration in seconds.
    pub fn duration_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Tracks all live inbound connections.
#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<SessionId, SessionInfo>,
    max_sessions: usize,
}

impl SessionManager {
    /// Create a manager admitting at most `max_sessions` connections.
    pub fn with_max_sessions(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    /// Register a new connection.
    pub fn create_session(&mut self, peer_addr: Option<SocketAddr>) -> Result<SessionInfo, SessionError> {
        if self.sessions.len() >= self.max_sessions {
            tracing::warn!(
                current = self.sessions.len(),
                limit = self.max_sessions,
                "Connection limit reached"
            );
            return Err(SessionError::TooManySessions {
                limit: self.max_sessions,
            });
        }

        let info = SessionInfo::new(peer_addr);
        self.sessions.insert(info.id, info.clone());
        tracing::debug!(session_id = %info.id, peer = ?peer_addr, "Session created");
        Ok(info)
    }

    /// Record a successful authentication.
    pub fn authenticate_session(
        &mut self,
        id: SessionId,
        username: &str,
        method: AuthMethodTag,
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::SessionNotFound)?;
        session.authenticate(username, method);
        Ok(())
    }

    /// Get a session by ID.
    pub fn get(&self, id: SessionId) -> Option<&SessionInfo> {
        self.sessions.get(&id)
    }

    /// Remove a session by ID.
    pub fn remove(&mut self, id: SessionId) -> Option<SessionInfo> {
        let session = self.sessions.remove(&id);
        if let Some(ref session) = session {
            tracing::debug!(
                session_id = %id,
                user = ?session.user,
                duration_secs = session.duration_secs(),
                "Session removed"
            );
        }
        session
    }

    /// Get the number of live connections.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get the number of authenticated connections.
    pub fn authenticated_count(&self) -> usize {
        self.sessions.values().filter(|s| s.authenticated).count()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::with_max_sessions(256)
    }
}
