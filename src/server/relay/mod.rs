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

//! Session relay.
//!
//! Every accepted session channel gets a [`SessionRelay`]. It greets the
//! client, resolves the target through the user's access policy and the
//! interactive selector, dials the target, and then bridges both channels
//! through a [`RelayLink`] until either side goes away.
//!
//! # Components
//!
//! - [`terminal`]: line editor used for selection and password prompts
//! - [`selector`]: the numbered-choice protocol
//! - [`request`]: request model and the inbound [`RequestInterceptor`]
//! - [`dial`]: outbound connections ([`SshDialer`])
//! - [`link`]: the two-way pump and its one-time close

pub mod dial;
pub mod hostkey;
pub mod inbound;
pub mod io;
pub mod link;
pub mod request;
pub mod selector;
pub mod terminal;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::server::audit::{AuditEvent, AuditManager, EventResult, EventType, Transcript, TranscriptStore};
use crate::server::auth::Permission;
use crate::server::directory::{AccessControl, DirectoryRegistry, PolicyError, RefreshHandle};

pub use dial::{DialRequest, Dialer, PasswordPrompt, RelayError, SshDialer, Upstream};
pub use hostkey::PinnedHostKeys;
pub use inbound::InboundEndpoint;
pub use io::{ChannelReader, EndpointWriter};
pub use link::{ChannelEvent, Endpoint, EventSource, Prefixed, RelayLink, Side};
pub use request::{ChannelRequest, Interception, RequestInterceptor, RequestKind};
pub use selector::{SelectionError, Selector};
pub use terminal::{Terminal, TerminalError};

/// Sets the client's window title.
const TITLE: &str = "\x1b]0;SSH Bastion Relay Login\x07";

/// Process-wide collaborators shared by every relay.
pub struct RelayContext {
    pub registry: Arc<DirectoryRegistry>,
    pub refresh: RefreshHandle,
    pub access: Arc<AccessControl>,
    pub dialer: Arc<dyn Dialer>,
    pub audit: Arc<AuditManager>,
    pub transcripts: Arc<dyn TranscriptStore>,
    pub motd: String,
    /// Offer the inbound password to targets.
    pub pass_password: bool,
    /// Pause after a refresh before redrawing the choices.
    pub redraw_delay: Duration,
}

/// The authenticated connection a session channel belongs to.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub session_id: String,
    pub user: String,
    pub peer: Option<SocketAddr>,
    pub permission: Permission,
}

impl SessionIdentity {
    fn peer_display(&self) -> String {
        self.peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn event(&self, event_type: EventType) -> AuditEvent {
        AuditEvent::new(event_type, self.user.clone(), self.session_id.clone())
            .with_client_ip_opt(self.peer.map(|p| p.ip()))
    }
}

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The relay ran and one side closed it.
    Completed(Side),
    /// The session ended before a relay was established.
    Aborted,
}

type SessionTerminal = Terminal<ChannelReader, EndpointWriter>;

/// Drives one session channel from greeting to teardown.
pub struct SessionRelay {
    context: Arc<RelayContext>,
    identity: SessionIdentity,
    inbound: Arc<dyn Endpoint>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    interceptor: RequestInterceptor,
    transcript: Arc<Transcript>,
    agent: Option<russh::server::Handle>,
}

impl SessionRelay {
    /// Relay for one channel.
    ///
    /// `events` carries what the client sends on the channel, with requests
    /// already passed through `interceptor`.
    pub fn new(
        context: Arc<RelayContext>,
        identity: SessionIdentity,
        inbound: Arc<dyn Endpoint>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        interceptor: RequestInterceptor,
        transcript: Arc<Transcript>,
    ) -> Self {
        Self {
            context,
            identity,
            inbound,
            events,
            interceptor,
            transcript,
            agent: None,
        }
    }

    /// Connection whose forwarded agent may be used for the outbound dial.
    pub fn with_agent_source(mut self, handle: russh::server::Handle) -> Self {
        self.agent = Some(handle);
        self
    }

    pub async fn run(self) -> RelayOutcome {
        let Self {
            context,
            identity,
            inbound,
            events,
            interceptor,
            transcript,
            agent,
        } = self;

        let mut term = Terminal::new(
            ChannelReader::new(events),
            EndpointWriter::new(Arc::clone(&inbound), Some(Arc::clone(&transcript))),
        );

        let Some(established) =
            establish(&context, &identity, &interceptor, agent, &transcript, &mut term).await
        else {
            inbound.close().await;
            transcript.close().await;
            return RelayOutcome::Aborted;
        };

        let Established { record_key, connect_path, upstream } = established;
        let (reader, _writer, leftover) = term.into_parts();
        let link = RelayLink::new(Arc::clone(&inbound), upstream.endpoint);

        let side = link
            .run(reader.into_source(leftover), upstream.events, Arc::clone(&transcript))
            .await;

        tracing::info!(
            "Disconnected from remote for relay ({}) by {} from {}.",
            connect_path,
            identity.user,
            identity.peer_display()
        );
        context
            .audit
            .log(
                identity
                    .event(EventType::RelayDisconnected)
                    .with_server(record_key)
                    .with_details(format!("closed by {side:?} side")),
            )
            .await;
        transcript.close().await;
        RelayOutcome::Completed(side)
    }
}

struct Established {
    record_key: String,
    connect_path: String,
    upstream: Upstream,
}

/// Greeting, target resolution and dial. `None` once the client has been
/// told why the session cannot continue.
async fn establish(
    context: &RelayContext,
    identity: &SessionIdentity,
    interceptor: &RequestInterceptor,
    agent: Option<russh::server::Handle>,
    transcript: &Transcript,
    term: &mut SessionTerminal,
) -> Option<Established> {
    let greeting = format!("{TITLE}{}\r\n", context.motd);
    term.write(&greeting).await.ok()?;

    let policy = match context.access.policy_for(&identity.user) {
        Ok(policy) => policy,
        Err(e) => {
            let details = match &e {
                PolicyError::UnknownAcl { acl, .. } => format!("invalid acl {acl}"),
                PolicyError::UnknownUser => "no identity configured".to_string(),
            };
            tracing::error!(user = %identity.user, error = %details, "Configuration fault resolving access policy");
            context
                .audit
                .log(
                    identity
                        .event(EventType::ConfigFault)
                        .with_result(EventResult::Error)
                        .with_details(details),
                )
                .await;
            let _ = term.write(&format!("{e}\r\n")).await;
            return None;
        }
    };

    let selector = Selector::new(&policy, &context.registry, &context.refresh)
        .with_redraw_delay(context.redraw_delay);
    let key = match selector.run(term).await {
        Ok(key) => key,
        Err(e) => {
            tracing::info!(user = %identity.user, error = %e, "Server selection failed");
            let _ = term.write("Error processing server selection.\r\n").await;
            return None;
        }
    };

    let Some(record) = context.registry.lookup(&key).await else {
        tracing::warn!(user = %identity.user, key = %key, "Selected server is no longer in the directory");
        let _ = term.write("Incorrectly Configured Server Selected.\r\n").await;
        return None;
    };

    let attached = match context.transcripts.open(&identity.user, &key).await {
        Ok(sink) => transcript.attach(sink).await,
        Err(e) => Err(e),
    };
    if let Err(e) = attached {
        tracing::error!(user = %identity.user, key = %key, error = %e, "Failed to initialize transcript");
        let _ = term.write("Failed to Initialize Session.\r\n").await;
        return None;
    }

    tracing::info!(
        "Connecting to remote for relay ({}) by {} from {}.",
        record.connect_path,
        identity.user,
        identity.peer_display()
    );
    context
        .audit
        .log(
            identity
                .event(EventType::RelayConnecting)
                .with_server(key.clone())
                .with_details(record.connect_path.clone()),
        )
        .await;
    term.write(&format!("Connecting to {key}\r\n")).await.ok()?;

    let password = if context.pass_password {
        identity
            .permission
            .reusable_password()
            .map(|p| Zeroizing::new(p.to_string()))
    } else {
        None
    };
    let request = DialRequest {
        record: Arc::clone(&record),
        remote_user: record
            .login_user
            .clone()
            .unwrap_or_else(|| identity.user.clone()),
        password,
        agent: agent.filter(|_| interceptor.agent_forwarding()),
    };

    let upstream = match context.dialer.dial(request, &mut *term).await {
        Ok(upstream) => upstream,
        Err(e) => {
            report_dial_failure(context, identity, &record.connect_path, &key, &e).await;
            let message = match e {
                RelayError::ChannelOpen(_) => format!("Remote session setup failed: {e}\r\n"),
                _ => format!("Connect failed: {e}\r\n"),
            };
            let _ = term.write(&message).await;
            return None;
        }
    };

    tracing::info!(
        "Connected to remote for relay ({}) by {} from {}.",
        record.connect_path,
        identity.user,
        identity.peer_display()
    );
    context
        .audit
        .log(
            identity
                .event(EventType::RelayConnected)
                .with_server(key.clone())
                .with_result(EventResult::Success)
                .with_details(record.connect_path.clone()),
        )
        .await;

    Some(Established {
        record_key: key,
        connect_path: record.connect_path.clone(),
        upstream,
    })
}

async fn report_dial_failure(
    context: &RelayContext,
    identity: &SessionIdentity,
    connect_path: &str,
    key: &str,
    error: &RelayError,
) {
    if let RelayError::HostKeyMismatch = error {
        tracing::warn!(
            "Host key validation failed for remote {} by user {} from {}.",
            connect_path,
            identity.user,
            identity.peer_display()
        );
        context
            .audit
            .log(
                identity
                    .event(EventType::HostKeyMismatch)
                    .with_server(key)
                    .with_result(EventResult::Denied)
                    .with_details(connect_path.to_string()),
            )
            .await;
    } else {
        tracing::warn!(remote = %key, error = %error, "Relay dial failed");
    }

    context
        .audit
        .log(
            identity
                .event(EventType::RelayFailed)
                .with_server(key)
                .with_result(EventResult::Failure)
                .with_details(error.to_string()),
        )
        .await;
}
