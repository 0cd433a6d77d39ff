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

//! Outbound connections to relay targets.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle as ClientHandle};
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::{ssh_key, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{AgentAuthError, Channel, ChannelMsg, CryptoVec, Disconnect, Signer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use super::hostkey::PinnedHostKeys;
use super::link::{ChannelEvent, Endpoint};
use super::request::{ChannelRequest, RequestKind};
use super::terminal::Terminal;
use crate::server::directory::ServerRecord;

/// Time allowed for TCP connect and key exchange.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Events buffered from the remote before the client catches up.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("HOST KEY VALIDATION FAILED - POSSIBLE MITM BETWEEN RELAY AND REMOTE")]
    HostKeyMismatch,

    #[error("{0}")]
    Connect(String),

    #[error("ssh: unable to authenticate, attempted methods {0}, no supported methods remain")]
    AuthRejected(String),

    #[error("{0}")]
    Credentials(String),

    /// The connection is up but the session channel could not be opened.
    #[error("{0}")]
    ChannelOpen(String),
}

/// Source of a password for the remote, asked only when needed.
#[async_trait]
pub trait PasswordPrompt: Send {
    async fn prompt_password(&mut self, prompt: &str) -> anyhow::Result<String>;
}

#[async_trait]
impl<R, W> PasswordPrompt for Terminal<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn prompt_password(&mut self, prompt: &str) -> anyhow::Result<String> {
        self.write(prompt).await?;
        Ok(self.read_password().await?)
    }
}

/// Everything needed to reach one target.
pub struct DialRequest {
    pub record: Arc<ServerRecord>,
    /// Login name on the target.
    pub remote_user: String,
    /// Inbound password, present only when reuse is allowed.
    pub password: Option<Zeroizing<String>>,
    /// Inbound connection whose forwarded agent may be used.
    pub agent: Option<russh::server::Handle>,
}

/// A connected remote session channel.
pub struct Upstream {
    pub endpoint: Arc<dyn Endpoint>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// Opens the outbound side of a relay.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        request: DialRequest,
        prompt: &mut dyn PasswordPrompt,
    ) -> Result<Upstream, RelayError>;
}

/// Client handler enforcing pinned host keys.
struct PinnedKeyHandler {
    pinned: PinnedHostKeys,
    rejected: Arc<AtomicBool>,
    remote: String,
}

impl client::Handler for PinnedKeyHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if self.pinned.accepts(server_public_key) {
            return Ok(true);
        }
        self.rejected.store(true, Ordering::SeqCst);
        tracing::warn!(
            remote = %self.remote,
            algorithm = %server_public_key.algorithm(),
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "Presented host key matches no pinned key"
        );
        Ok(false)
    }
}

/// Signer over a forwarded agent that owns the key across the await.
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            self.agent
                .sign_request(&key, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Dials targets over SSH with russh.
pub struct SshDialer {
    config: Arc<client::Config>,
}

impl Default for SshDialer {
    fn default() -> Self {
        Self::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        })
    }
}

impl SshDialer {
    pub fn new(config: client::Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    async fn connect(
        &self,
        record: &ServerRecord,
    ) -> Result<ClientHandle<PinnedKeyHandler>, RelayError> {
        let rejected = Arc::new(AtomicBool::new(false));
        let pinned = PinnedHostKeys::load(&record.host_pubkeys, &record.key);
        if !pinned.is_pinned() {
            tracing::warn!(remote = %record.key, "No host keys pinned, accepting any host key");
        }
        let handler = PinnedKeyHandler {
            pinned,
            rejected: Arc::clone(&rejected),
            remote: record.key.clone(),
        };

        let connecting = client::connect(
            Arc::clone(&self.config),
            record.connect_path.as_str(),
            handler,
        );
        match tokio::time::timeout(DIAL_TIMEOUT, connecting).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(_)) if rejected.load(Ordering::SeqCst) => Err(RelayError::HostKeyMismatch),
            Ok(Err(e)) => Err(RelayError::Connect(format!("{e:#}"))),
            Err(_) => Err(RelayError::Connect(format!(
                "dial tcp {}: i/o timeout",
                record.connect_path
            ))),
        }
    }

    async fn authenticate(
        &self,
        handle: &mut ClientHandle<PinnedKeyHandler>,
        request: DialRequest,
        prompt: &mut dyn PasswordPrompt,
    ) -> Result<(), RelayError> {
        let user = request.remote_user.as_str();
        let mut attempted = Vec::new();
        let auth_error = |e: russh::Error| RelayError::Connect(e.to_string());

        if let Some(path) = &request.record.login_privatekey {
            let key = russh::keys::load_secret_key(path, None).map_err(|e| {
                tracing::error!(path = %path.display(), remote = %request.record.key, error = %e, "Error loading login private key");
                RelayError::Credentials(format!("unable to load login key for {}", request.record.key))
            })?;
            attempted.push("publickey");
            let hash = handle.best_supported_rsa_hash().await.map_err(auth_error)?.flatten();
            let result = handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
                .await
                .map_err(auth_error)?;
            if result.success() {
                return Ok(());
            }
        }

        if let Some(inbound) = &request.agent {
            attempted.push("agent");
            match authenticate_with_agent(handle, user, inbound).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Forwarded agent unusable"),
            }
        }

        attempted.push("password");
        let password = match request.password {
            Some(password) => password,
            None => {
                let text = format!("{}@{} password: ", user, request.record.key);
                Zeroizing::new(
                    prompt
                        .prompt_password(&text)
                        .await
                        .map_err(|e| RelayError::Credentials(e.to_string()))?,
                )
            }
        };
        let result = handle
            .authenticate_password(user, password.as_str())
            .await
            .map_err(auth_error)?;
        if result.success() {
            return Ok(());
        }

        Err(RelayError::AuthRejected(format!("[{}]", attempted.join(" "))))
    }
}

async fn authenticate_with_agent(
    handle: &mut ClientHandle<PinnedKeyHandler>,
    user: &str,
    inbound: &russh::server::Handle,
) -> anyhow::Result<bool> {
    let channel = inbound
        .channel_open_agent()
        .await
        .map_err(|e| anyhow!("failed to open agent channel: {e}"))?;
    let mut agent = AgentClient::connect(channel.into_stream()).dynamic();
    let identities = agent.request_identities().await?;

    for identity in identities {
        let hash = handle.best_supported_rsa_hash().await?.flatten();
        match handle
            .authenticate_publickey_with(user, identity.clone(), hash, &mut AgentSigner { agent: &mut agent })
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => tracing::debug!(key = %identity.algorithm(), "Agent key rejected by remote"),
            Err(e) => tracing::warn!(error = %e, "Agent signing failed"),
        }
    }
    Ok(false)
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(
        &self,
        request: DialRequest,
        prompt: &mut dyn PasswordPrompt,
    ) -> Result<Upstream, RelayError> {
        let record = Arc::clone(&request.record);
        tracing::info!(remote = %record.key, path = %record.connect_path, "Getting ready to dial remote");

        let mut handle = self.connect(&record).await?;
        self.authenticate(&mut handle, request, prompt).await?;
        tracing::info!(remote = %record.key, "Dialled remote successfully");

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| RelayError::ChannelOpen(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(handle, channel, commands_rx, events_tx));

        Ok(Upstream {
            endpoint: Arc::new(OutboundEndpoint {
                commands: commands_tx,
            }),
            events: events_rx,
        })
    }
}

enum Command {
    Data(Bytes),
    ExtendedData(u32, Bytes),
    Request(ChannelRequest),
    Eof,
    Close,
}

/// Remote side of a relay; operations are queued to the channel's driver.
struct OutboundEndpoint {
    commands: mpsc::UnboundedSender<Command>,
}

impl OutboundEndpoint {
    fn send(&self, command: Command) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("remote channel is closed"))
    }
}

#[async_trait]
impl Endpoint for OutboundEndpoint {
    async fn data(&self, data: Bytes) -> anyhow::Result<()> {
        self.send(Command::Data(data))
    }

    async fn extended_data(&self, code: u32, data: Bytes) -> anyhow::Result<()> {
        self.send(Command::ExtendedData(code, data))
    }

    async fn request(&self, request: ChannelRequest) -> anyhow::Result<()> {
        self.send(Command::Request(request))
    }

    async fn reply(&self, _success: bool) -> anyhow::Result<()> {
        // Nothing is ever forwarded to the client wanting a reply.
        Ok(())
    }

    async fn eof(&self) -> anyhow::Result<()> {
        self.send(Command::Eof)
    }

    async fn close(&self) {
        let _ = self.send(Command::Close);
    }
}

/// Owns the remote channel: applies queued commands and publishes what the
/// remote sends, until either side closes.
async fn drive(
    handle: ClientHandle<PinnedKeyHandler>,
    mut channel: Channel<client::Msg>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<ChannelEvent>,
) {
    loop {
        tokio::select! {
            msg = channel.wait() => {
                let Some(msg) = msg else { break };
                let Some(event) = translate(msg) else { continue };
                let closing = event == ChannelEvent::Close;
                if events.send(event).await.is_err() || closing {
                    break;
                }
            }
            command = commands.recv() => {
                let result = match command {
                    None | Some(Command::Close) => {
                        let _ = channel.close().await;
                        break;
                    }
                    Some(Command::Data(data)) => channel.data(&data[..]).await,
                    Some(Command::ExtendedData(code, data)) => channel.extended_data(code, &data[..]).await,
                    Some(Command::Request(request)) => send_request(&channel, request).await,
                    Some(Command::Eof) => channel.eof().await,
                };
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Remote channel write failed");
                    break;
                }
            }
        }
    }

    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await;
}

fn translate(msg: ChannelMsg) -> Option<ChannelEvent> {
    let event = match msg {
        ChannelMsg::Data { data } => ChannelEvent::Data(Bytes::copy_from_slice(&data)),
        ChannelMsg::ExtendedData { data, ext } => {
            ChannelEvent::ExtendedData(ext, Bytes::copy_from_slice(&data))
        }
        ChannelMsg::Eof => ChannelEvent::Eof,
        ChannelMsg::Close => ChannelEvent::Close,
        ChannelMsg::Success => ChannelEvent::Reply(true),
        ChannelMsg::Failure => ChannelEvent::Reply(false),
        ChannelMsg::ExitStatus { exit_status } => {
            ChannelEvent::Request(ChannelRequest::new(RequestKind::ExitStatus(exit_status), false))
        }
        ChannelMsg::ExitSignal {
            signal_name,
            core_dumped,
            error_message,
            lang_tag,
        } => ChannelEvent::Request(ChannelRequest::new(
            RequestKind::ExitSignal {
                signal: signal_name,
                core_dumped,
                message: error_message,
                lang: lang_tag,
            },
            false,
        )),
        ChannelMsg::XonXoff { client_can_do } => {
            ChannelEvent::Request(ChannelRequest::new(RequestKind::XonXoff(client_can_do), false))
        }
        _ => return None,
    };
    Some(event)
}

async fn send_request(
    channel: &Channel<client::Msg>,
    request: ChannelRequest,
) -> Result<(), russh::Error> {
    let want_reply = request.want_reply;
    match request.kind {
        RequestKind::Pty {
            term,
            cols,
            rows,
            pix_width,
            pix_height,
            modes,
        } => {
            channel
                .request_pty(want_reply, &term, cols, rows, pix_width, pix_height, &modes)
                .await
        }
        RequestKind::Shell => channel.request_shell(want_reply).await,
        RequestKind::Exec(command) => channel.exec(want_reply, command.to_vec()).await,
        RequestKind::Subsystem(name) => channel.request_subsystem(want_reply, name).await,
        RequestKind::Env { name, value } => channel.set_env(want_reply, name, value).await,
        RequestKind::WindowChange {
            cols,
            rows,
            pix_width,
            pix_height,
        } => channel.window_change(cols, rows, pix_width, pix_height).await,
        RequestKind::Signal(signal) => channel.signal(signal).await,
        RequestKind::X11 {
            single_connection,
            auth_protocol,
            auth_cookie,
            screen,
        } => {
            channel
                .request_x11(want_reply, single_connection, auth_protocol, auth_cookie, screen)
                .await
        }
        RequestKind::AgentForward => channel.agent_forward(want_reply).await,
        other => {
            tracing::debug!(request = other.name(), "Request not relayable to remote, dropped");
            Ok(())
        }
    }
}
