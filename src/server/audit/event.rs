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

//! Audit event types.
//!
//! Events cover the connection lifecycle, authentication outcomes, relay
//! setup and teardown, and security-relevant incidents such as host key
//! mismatches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A single auditable occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier
    pub id: String,

    /// Timestamp when the event occurred
    pub timestamp: DateTime<Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Session ID associated with this event
    pub session_id: String,

    /// Username associated with this event
    pub user: String,

    /// Client IP address (if available)
    pub client_ip: Option<IpAddr>,

    /// Selection key of the relay target, once chosen
    pub server: Option<String>,

    /// Authentication method involved (`password`, `pk`)
    pub method: Option<String>,

    /// Result of the operation
    pub result: EventResult,

    /// Additional details about the event
    pub details: Option<String>,
}

/// Type of audit event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Connection events
    /// Inbound transport connection accepted
    ConnectionStart,
    /// Inbound transport connection finished
    ConnectionEnd,

    // Authentication events
    /// Successful authentication
    AuthSuccess,
    /// Failed authentication attempt
    AuthFailure,

    // Relay events
    /// Dialing the chosen target
    RelayConnecting,
    /// Relay established
    RelayConnected,
    /// Relay torn down
    RelayDisconnected,
    /// Relay could not be established
    RelayFailed,

    // Security and configuration events
    /// Target presented a host key that matches no pinned key
    HostKeyMismatch,
    /// Missing or invalid user or ACL configuration
    ConfigFault,
    /// Unsupported channel type refused
    ChannelRejected,
}

/// Result of an audit event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventResult {
    /// Operation succeeded
    Success,
    /// Operation failed
    Failure,
    /// Operation denied by policy
    Denied,
    /// Operation resulted in error
    Error,
}

impl AuditEvent {
    /// Create a new audit event with the minimum required fields.
    ///
    /// # Example
    ///
    /// ```
    /// use bastion_relay::server::audit::event::{AuditEvent, EventType};
    ///
    /// let event = AuditEvent::new(
    ///     EventType::AuthSuccess,
    ///     "alice".to_string(),
    ///     "session-123".to_string(),
    /// );
    /// ```
    pub fn new(event_type: EventType, user: String, session_id: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            session_id,
            user,
            client_ip: None,
            server: None,
            method: None,
            result: EventResult::Success,
            details: None,
        }
    }

    /// Set the client IP address.
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    /// Set the client IP address if known.
    pub fn with_client_ip_opt(mut self, ip: Option<IpAddr>) -> Self {
        self.client_ip = ip;
        self
    }

    /// Set the relay target.
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Set the authentication method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Set the operation result.
    pub fn with_result(mut self, result: EventResult) -> Self {
        self.result = result;
        self
    }

    /// Set additional details.
    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }
}
