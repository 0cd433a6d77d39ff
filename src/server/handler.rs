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

//! SSH handler implementation for the russh server.
//!
//! One [`SshHandler`] exists per inbound connection. It authenticates the
//! user through the [`CredentialVerifier`], refuses every channel type
//! except `session`, and hands each session channel to its own
//! [`SessionRelay`] task. Channel traffic reaching the handler is queued
//! to the relay without waiting on it, so the connection keeps reading
//! while a relay is blocked on the network.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use russh::keys::ssh_key;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty, Sig};
use tokio::sync::{mpsc, RwLock};
use tokio_util::task::TaskTracker;

use super::audit::{AuditEvent, EventResult, EventType, Transcript};
use super::auth::{AuthFailure, AuthMethodTag, CredentialVerifier, Permission};
use super::relay::{
    ChannelEvent, ChannelRequest, InboundEndpoint, RelayContext, RequestInterceptor, RequestKind,
    SessionIdentity, SessionRelay,
};
use super::session::{SessionInfo, SessionManager};

const UNSUPPORTED_CHANNEL: &str =
    "connection flow not supported, only interactive sessions are permitted.";

/// State shared by every connection handler.
pub struct ConnectionContext {
    pub verifier: CredentialVerifier,
    pub sessions: Arc<RwLock<SessionManager>>,
    pub relay: Arc<RelayContext>,
    pub max_auth_attempts: u32,
}

/// Where the handler delivers traffic for one session channel.
struct ChannelTap {
    events: mpsc::UnboundedSender<ChannelEvent>,
    interceptor: RequestInterceptor,
    transcript: Arc<Transcript>,
}

impl ChannelTap {
    /// Record `request`, queue what the interceptor forwards, and return
    /// whether the client should be answered right away. Nothing is
    /// answered before the request is in the transcript.
    async fn admit(&self, request: ChannelRequest) -> bool {
        let interception = self.interceptor.intercept(request.clone());
        self.transcript.record_request(&request.to_string()).await;
        if let Some(forward) = interception.forward {
            // A relay that already ended drops what follows.
            let _ = self.events.send(ChannelEvent::Request(forward));
        }
        interception.reply_now
    }
}

/// SSH handler for a single client connection.
pub struct SshHandler {
    /// Remote address of the connected client.
    peer_addr: Option<SocketAddr>,

    context: Arc<ConnectionContext>,

    /// Session information, created on the first authentication attempt.
    session_info: Option<SessionInfo>,

    /// Outcome of the successful authentication.
    permission: Option<Permission>,

    /// Open session channels of this connection.
    channels: HashMap<ChannelId, ChannelTap>,

    /// Relay tasks spawned for this connection.
    relays: TaskTracker,
}

impl SshHandler {
    /// Create a new SSH handler for a client connection.
    pub fn new(peer_addr: Option<SocketAddr>, context: Arc<ConnectionContext>) -> Self {
        Self {
            peer_addr,
            context,
            session_info: None,
            permission: None,
            channels: HashMap::new(),
            relays: TaskTracker::new(),
        }
    }

    /// Get the peer address of the connected client.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Check if the connection is authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.permission.is_some()
    }

    /// Get the authenticated username, if any.
    pub fn username(&self) -> Option<&str> {
        self.session_info
            .as_ref()
            .filter(|s| s.authenticated)
            .and_then(|s| s.user.as_deref())
    }

    fn peer_display(&self) -> String {
        self.peer_addr
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Build the method set of allowed authentication methods.
    fn allowed_methods(&self) -> MethodSet {
        let mut methods = MethodSet::empty();
        methods.push(MethodKind::PublicKey);
        if self.context.verifier.supports_password() {
            methods.push(MethodKind::Password);
        }
        methods
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(self.allowed_methods()),
            partial_success: false,
        }
    }

    fn refuse_all() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Register the connection on its first authentication attempt.
    /// `false` when the connection limit is reached.
    async fn ensure_session(&mut self) -> bool {
        if self.session_info.is_some() {
            return true;
        }
        match self.context.sessions.write().await.create_session(self.peer_addr) {
            Ok(info) => {
                tracing::debug!(session_id = %info.id, peer = ?self.peer_addr, "New session created");
                self.session_info = Some(info);
                true
            }
            Err(e) => {
                tracing::warn!(peer = ?self.peer_addr, error = %e, "Rejecting connection");
                false
            }
        }
    }

    /// Count an attempt. `true` when the connection has used up its attempts.
    fn count_attempt(&mut self) -> bool {
        let limit = self.context.max_auth_attempts;
        match self.session_info.as_mut() {
            Some(info) => {
                info.increment_auth_attempts();
                info.auth_attempts > limit
            }
            None => true,
        }
    }

    fn session_label(&self) -> String {
        self.session_info
            .as_ref()
            .map(|s| s.id.to_string())
            .unwrap_or_default()
    }

    fn event(&self, event_type: EventType, user: &str) -> AuditEvent {
        AuditEvent::new(event_type, user.to_string(), self.session_label())
            .with_client_ip_opt(self.peer_addr.map(|p| p.ip()))
    }

    /// Log and audit the outcome of one authentication attempt.
    async fn finish_auth(
        &mut self,
        user: &str,
        method: AuthMethodTag,
        outcome: Result<Permission, AuthFailure>,
    ) -> Auth {
        let peer = self.peer_display();
        match outcome {
            Ok(permission) => {
                tracing::info!("Accepted {} for user {} from {} ssh2", method, user, peer);
                if let Some(info) = self.session_info.as_mut() {
                    info.authenticate(user, method);
                    let id = info.id;
                    if let Err(e) = self
                        .context
                        .sessions
                        .write()
                        .await
                        .authenticate_session(id, user, method)
                    {
                        tracing::debug!(session_id = %id, error = %e, "Session bookkeeping out of sync");
                    }
                }
                self.permission = Some(permission);

                let audit = &self.context.relay.audit;
                audit
                    .log(
                        self.event(EventType::AuthSuccess, user)
                            .with_method(method.as_str())
                            .with_result(EventResult::Success),
                    )
                    .await;
                tracing::info!("Connection Start by {} (User: {}).", peer, user);
                audit.log(self.event(EventType::ConnectionStart, user)).await;
                Auth::Accept
            }
            Err(e) => {
                tracing::info!("Failed {} for user {} from {} ssh2, {}", method, user, peer, e);
                self.context
                    .relay
                    .audit
                    .log(
                        self.event(EventType::AuthFailure, user)
                            .with_method(method.as_str())
                            .with_result(EventResult::Failure)
                            .with_details(e.to_string()),
                    )
                    .await;
                self.reject()
            }
        }
    }

    /// Pass an inbound request through the channel's interceptor, then
    /// send the immediate reply if one is due.
    async fn relay_request(
        &mut self,
        channel: ChannelId,
        kind: RequestKind,
        session: &mut Session,
    ) -> Result<(), anyhow::Error> {
        let request = ChannelRequest::inbound(kind);
        let Some(tap) = self.channels.get(&channel) else {
            tracing::warn!(channel = ?channel, request = request.kind.name(), "Request for unknown channel");
            let _ = session.channel_failure(channel);
            return Ok(());
        };
        if tap.admit(request).await {
            session.channel_success(channel)?;
        }
        Ok(())
    }

    fn push(&self, channel: ChannelId, event: ChannelEvent) {
        if let Some(tap) = self.channels.get(&channel) {
            // A relay that already ended drops what follows.
            let _ = tap.events.send(event);
        }
    }

    /// Refuse a non-session channel.
    async fn refuse_channel(&self, kind: &str) -> Result<bool, anyhow::Error> {
        let user = self.username().unwrap_or_default().to_string();
        tracing::warn!(
            user = %user,
            peer = %self.peer_display(),
            channel_type = kind,
            "{}",
            UNSUPPORTED_CHANNEL
        );
        self.context
            .relay
            .audit
            .log(
                self.event(EventType::ChannelRejected, &user)
                    .with_result(EventResult::Denied)
                    .with_details(format!("{kind}: {UNSUPPORTED_CHANNEL}")),
            )
            .await;
        Ok(false)
    }
}

impl russh::server::Handler for SshHandler {
    type Error = anyhow::Error;

    /// Handle 'none' authentication.
    ///
    /// Always rejects and advertises available authentication methods.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        tracing::debug!(user = %user, peer = ?self.peer_addr, "Auth none attempt");
        if !self.ensure_session().await {
            return Ok(Self::refuse_all());
        }
        Ok(self.reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if !self.ensure_session().await || self.count_attempt() {
            tracing::warn!(user = %user, peer = ?self.peer_addr, "Max authentication attempts exceeded");
            return Ok(Self::refuse_all());
        }
        let outcome = self.context.verifier.verify_password(user, password).await;
        Ok(self.finish_auth(user, AuthMethodTag::Password, outcome).await)
    }

    /// Called once the client has proven possession of `public_key`.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        tracing::debug!(
            user = %user,
            peer = ?self.peer_addr,
            key_type = %public_key.algorithm(),
            "Public key authentication attempt"
        );
        if !self.ensure_session().await || self.count_attempt() {
            tracing::warn!(user = %user, peer = ?self.peer_addr, "Max authentication attempts exceeded");
            return Ok(Self::refuse_all());
        }
        let outcome = self.context.verifier.verify_publickey(user, public_key).await;
        Ok(self.finish_auth(user, AuthMethodTag::PublicKey, outcome).await)
    }

    /// Accept a session channel and start its relay.
    fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let channel_id = channel.id();
        let identity = match (&self.session_info, &self.permission) {
            (Some(info), Some(permission)) => info.user.clone().map(|user| SessionIdentity {
                session_id: info.id.to_string(),
                user,
                peer: self.peer_addr,
                permission: permission.clone(),
            }),
            _ => None,
        };

        let accepted = match identity {
            Some(identity) => {
                tracing::debug!(
                    session_id = %identity.session_id,
                    channel = ?channel_id,
                    "Session channel opened"
                );
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let interceptor = RequestInterceptor::new();
                let transcript = Arc::new(Transcript::new());
                let handle = session.handle();

                let relay = SessionRelay::new(
                    Arc::clone(&self.context.relay),
                    identity,
                    Arc::new(InboundEndpoint::new(handle.clone(), channel_id)),
                    events_rx,
                    interceptor.clone(),
                    Arc::clone(&transcript),
                )
                .with_agent_source(handle);
                self.relays.spawn(relay.run());

                self.channels.insert(
                    channel_id,
                    ChannelTap {
                        events: events_tx,
                        interceptor,
                        transcript,
                    },
                );
                true
            }
            None => {
                tracing::warn!(peer = ?self.peer_addr, "Session channel before authentication");
                false
            }
        };

        async move { Ok(accepted) }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(target_host = %host_to_connect, port = port_to_connect, "direct-tcpip requested");
        self.refuse_channel("direct-tcpip").await
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.refuse_channel("forwarded-tcpip").await
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.refuse_channel("x11").await
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        _channel: Channel<Msg>,
        _socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.refuse_channel("direct-streamlocal@openssh.com").await
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(address = %address, port = *port, "Refusing global forwarding request");
        Ok(false)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = RequestKind::Pty {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
        };
        self.relay_request(channel, kind, session).await
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_request(channel, RequestKind::Shell, session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_request(channel, RequestKind::Exec(Bytes::copy_from_slice(data)), session).await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_request(channel, RequestKind::Subsystem(name.to_string()), session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = RequestKind::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.relay_request(channel, kind, session).await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = RequestKind::WindowChange {
            cols: col_width,
            rows: row_height,
            pix_width,
            pix_height,
        };
        self.relay_request(channel, kind, session).await
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_request(channel, RequestKind::Signal(signal), session).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = RequestKind::X11 {
            single_connection,
            auth_protocol: x11_auth_protocol.to_string(),
            auth_cookie: x11_auth_cookie.to_string(),
            screen: x11_screen_number,
        };
        self.relay_request(channel, kind, session).await
    }

    /// Agent forwarding is consumed here; it only makes the client's agent
    /// available to the outbound dial.
    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.channels.get(&channel) {
            Some(tap) => Ok(tap.admit(ChannelRequest::inbound(RequestKind::AgentForward)).await),
            None => Ok(false),
        }
    }

    fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        self.push(channel, ChannelEvent::Data(Bytes::copy_from_slice(data)));
        async { Ok(()) }
    }

    fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        self.push(
            channel,
            ChannelEvent::ExtendedData(code, Bytes::copy_from_slice(data)),
        );
        async { Ok(()) }
    }

    fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        tracing::debug!(channel = ?channel, "Channel EOF received");
        self.push(channel, ChannelEvent::Eof);
        async { Ok(()) }
    }

    fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        tracing::debug!(channel = ?channel, "Channel closed");
        self.push(channel, ChannelEvent::Close);
        self.channels.remove(&channel);
        async { Ok(()) }
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        // Ends every relay still reading from this connection.
        self.channels.clear();
        self.relays.close();

        let Some(info) = self.session_info.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let relays = self.relays.clone();
        let context = Arc::clone(&self.context);
        let peer = self.peer_display();
        let peer_ip = self.peer_addr.map(|p| p.ip());

        runtime.spawn(async move {
            relays.wait().await;
            context.sessions.write().await.remove(info.id);

            if let Some(user) = info.user.as_deref().filter(|_| info.authenticated) {
                tracing::info!("Connection closed by {} (User: {}).", peer, user);
                context
                    .relay
                    .audit
                    .log(
                        AuditEvent::new(EventType::ConnectionEnd, user.to_string(), info.id.to_string())
                            .with_client_ip_opt(peer_ip)
                            .with_details(format!("duration {}s", info.duration_secs())),
                    )
                    .await;
            } else {
                tracing::debug!(
                    session_id = %info.id,
                    peer = %peer,
                    "Connection closed before authentication"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::audit::{
        AuditConfig, AuditExporter, AuditManager, DiscardTranscriptStore, MemoryExporter,
        TranscriptSink,
    };
    use crate::server::auth::authorized_keys::tests::{key, ED25519_A, ED25519_B};
    use crate::server::config::{AclEntry, UserEntry};
    use crate::server::directory::{AccessControl, Backoff, DirectoryRegistry, RefreshScheduler};
    use crate::server::relay::SshDialer;
    use russh::server::Handler;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 22222)
    }

    fn context(
        users: BTreeMap<String, UserEntry>,
        max_sessions: usize,
    ) -> (Arc<ConnectionContext>, Arc<MemoryExporter>) {
        let registry = Arc::new(DirectoryRegistry::builder().build());
        let (_scheduler, refresh) =
            RefreshScheduler::new(Arc::clone(&registry), Backoff::default(), CancellationToken::new());
        let exporter = Arc::new(MemoryExporter::new());
        let audit = AuditManager::with_exporters(
            &AuditConfig::new().with_enabled(true),
            vec![exporter.clone() as Arc<dyn AuditExporter>],
        );
        let acls = BTreeMap::from([("ops".to_string(), AclEntry::default())]);

        let relay = RelayContext {
            registry,
            refresh,
            access: Arc::new(AccessControl::new(&users, &acls)),
            dialer: Arc::new(SshDialer::default()),
            audit: Arc::new(audit),
            transcripts: Arc::new(DiscardTranscriptStore),
            motd: String::new(),
            pass_password: false,
            redraw_delay: Duration::ZERO,
        };
        let context = ConnectionContext {
            verifier: CredentialVerifier::new(users),
            sessions: Arc::new(RwLock::new(SessionManager::with_max_sessions(max_sessions))),
            relay: Arc::new(relay),
            max_auth_attempts: 2,
        };
        (Arc::new(context), exporter)
    }

    fn user_with_keys(file: &tempfile::NamedTempFile) -> BTreeMap<String, UserEntry> {
        BTreeMap::from([(
            "alice".to_string(),
            UserEntry {
                acl: "ops".to_string(),
                authorized_keys_file: Some(file.path().to_path_buf()),
                awsuser: None,
            },
        )])
    }

    #[tokio::test]
    async fn test_handler_creation() {
        let (context, _) = context(BTreeMap::new(), 4);
        let handler = SshHandler::new(Some(test_addr()), context);

        assert_eq!(handler.peer_addr(), Some(test_addr()));
        assert!(!handler.is_authenticated());
        assert!(handler.username().is_none());
    }

    #[tokio::test]
    async fn test_password_not_advertised_without_directory() {
        let (context, _) = context(BTreeMap::new(), 4);
        let handler = SshHandler::new(Some(test_addr()), context);
        let methods = handler.allowed_methods();

        assert!(methods.contains(&MethodKind::PublicKey));
        assert!(!methods.contains(&MethodKind::Password));
    }

    #[tokio::test]
    async fn test_publickey_accepts_listed_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{ED25519_A}").unwrap();
        let (context, exporter) = context(user_with_keys(&file), 4);
        let mut handler = SshHandler::new(Some(test_addr()), Arc::clone(&context));

        let auth = handler.auth_publickey("alice", &key(ED25519_A)).await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert!(handler.is_authenticated());
        assert_eq!(handler.username(), Some("alice"));

        context.relay.audit.sync().await;
        assert_eq!(exporter.count(EventType::AuthSuccess), 1);
        assert_eq!(exporter.count(EventType::ConnectionStart), 1);
        assert_eq!(context.sessions.read().await.authenticated_count(), 1);
    }

    #[tokio::test]
    async fn test_publickey_rejects_other_key_and_limits_attempts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{ED25519_A}").unwrap();
        let (context, exporter) = context(user_with_keys(&file), 4);
        let mut handler = SshHandler::new(Some(test_addr()), Arc::clone(&context));

        for _ in 0..2 {
            let auth = handler.auth_publickey("alice", &key(ED25519_B)).await.unwrap();
            assert!(matches!(
                auth,
                Auth::Reject {
                    proceed_with_methods: Some(_),
                    ..
                }
            ));
        }
        let auth = handler.auth_publickey("alice", &key(ED25519_A)).await.unwrap();
        assert!(matches!(
            auth,
            Auth::Reject {
                proceed_with_methods: None,
                ..
            }
        ));
        assert!(!handler.is_authenticated());

        context.relay.audit.sync().await;
        assert_eq!(exporter.count(EventType::AuthFailure), 2);
    }

    #[tokio::test]
    async fn test_connection_limit_refuses_authentication() {
        let (context, _) = context(BTreeMap::new(), 1);
        let mut first = SshHandler::new(Some(test_addr()), Arc::clone(&context));
        let mut second = SshHandler::new(Some(test_addr()), Arc::clone(&context));

        assert!(matches!(
            first.auth_none("alice").await.unwrap(),
            Auth::Reject {
                proceed_with_methods: Some(_),
                ..
            }
        ));
        assert!(matches!(
            second.auth_none("alice").await.unwrap(),
            Auth::Reject {
                proceed_with_methods: None,
                ..
            }
        ));
    }

    #[derive(Clone, Default)]
    struct CapturedTranscript(Arc<std::sync::Mutex<Vec<u8>>>);

    #[async_trait::async_trait]
    impl TranscriptSink for CapturedTranscript {
        async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        async fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedTranscript {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[tokio::test]
    async fn test_requests_recorded_before_reply() {
        let (events, mut queued) = mpsc::unbounded_channel();
        let sink = CapturedTranscript::default();
        let transcript = Arc::new(Transcript::new());
        transcript.attach(Box::new(sink.clone())).await.unwrap();
        let tap = ChannelTap {
            events,
            interceptor: RequestInterceptor::new(),
            transcript,
        };

        let env = RequestKind::Env {
            name: "LANG".to_string(),
            value: "C".to_string(),
        };
        assert!(tap.admit(ChannelRequest::inbound(env.clone())).await);
        assert!(sink.text().contains("request: env"));
        assert_eq!(
            queued.try_recv().unwrap(),
            ChannelEvent::Request(ChannelRequest::new(env, false))
        );

        // Agent forwarding is recorded and answered but never queued.
        assert!(tap.admit(ChannelRequest::inbound(RequestKind::AgentForward)).await);
        assert!(sink.text().contains("request: auth-agent-req@openssh.com"));
        assert!(queued.try_recv().is_err());
        assert!(tap.interceptor.agent_forwarding());
    }
}
