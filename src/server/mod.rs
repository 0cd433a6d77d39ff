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

//! SSH bastion relay server.
//!
//! Clients authenticate once against the relay, pick one of the hosts their
//! access list permits, and the relay dials that host on their behalf and
//! splices the two sessions together.
//!
//! # Overview
//!
//! - [`BastionServer`]: assembles the collaborators and accepts connections
//! - [`SshHandler`]: handles SSH protocol events for each connection
//! - [`SessionManager`]: tracks live connections
//! - [`directory`]: the server directory, access lists and refresh task
//! - [`relay`]: per-channel selection, dial and bidirectional relay
//! - [`auth`]: inbound credential verification
//! - [`audit`]: audit events and session transcripts
//!
//! # Example
//!
//! ```no_run
//! use bastion_relay::server::config::load_config;
//! use bastion_relay::server::BastionServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(None)?;
//!     let server = BastionServer::build(config).await?;
//!     server.run(async { let _ = tokio::signal::ctrl_c().await; }).await
//! }
//! ```

pub mod audit;
pub mod auth;
pub mod config;
pub mod directory;
pub mod handler;
pub mod relay;
pub mod session;

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::Server;
use russh::{MethodKind, MethodSet, SshId};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use self::audit::{
    AuditConfig, AuditExporterConfig, AuditManager, DiscardTranscriptStore, FsTranscriptStore,
    TranscriptStore,
};
use self::auth::CredentialVerifier;
use self::config::RelayFileConfig;
use self::directory::{AccessControl, Backoff, DirectoryRegistry, RefreshScheduler};
use self::relay::{RelayContext, SshDialer};

pub use self::handler::{ConnectionContext, SshHandler};
pub use self::session::{SessionError, SessionId, SessionInfo, SessionManager};

/// Identification string sent to clients.
const SERVER_ID: &str = "SSH-2.0-BASTION";

/// Pause between a refresh and redrawing the selection list.
const REDRAW_DELAY: Duration = Duration::from_millis(500);

/// The relay server.
///
/// Built once from the loaded configuration; [`BastionServer::run`] then
/// serves until the shutdown future resolves.
pub struct BastionServer {
    config: Arc<RelayFileConfig>,
    russh_config: Arc<russh::server::Config>,
    context: Arc<ConnectionContext>,
    registry: Arc<DirectoryRegistry>,
    scheduler: Option<RefreshScheduler>,
    shutdown: CancellationToken,
}

impl BastionServer {
    /// Assemble the server from its configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a host key cannot be loaded, the audit log
    /// cannot be opened, or a dynamic group is misconfigured. These are
    /// startup faults; nothing is served.
    pub async fn build(config: RelayFileConfig) -> Result<Self> {
        let global = &config.global;
        let verifier = build_verifier(&config).await?;
        let russh_config = build_russh_config(&config, &verifier)?;

        let registry = Arc::new(
            DirectoryRegistry::from_config(&config).context("Failed to set up server directory")?,
        );
        let shutdown = CancellationToken::new();
        let (scheduler, refresh) =
            RefreshScheduler::new(Arc::clone(&registry), Backoff::default(), shutdown.clone());

        let audit = AuditManager::new(&audit_config(global.audit_log.as_deref()))
            .context("Failed to initialize audit log")?;
        let transcripts: Arc<dyn TranscriptStore> = match &global.log_path {
            Some(root) => Arc::new(FsTranscriptStore::new(root)),
            None => {
                tracing::warn!("No log_path configured, session transcripts are discarded");
                Arc::new(DiscardTranscriptStore)
            }
        };

        let relay = RelayContext {
            registry: Arc::clone(&registry),
            refresh,
            access: Arc::new(AccessControl::new(&config.users, &config.acls)),
            dialer: Arc::new(SshDialer::default()),
            audit: Arc::new(audit),
            transcripts,
            motd: load_motd(global.motd_path.as_deref()).await,
            pass_password: global.pass_password,
            redraw_delay: REDRAW_DELAY,
        };

        let context = ConnectionContext {
            verifier,
            sessions: Arc::new(RwLock::new(SessionManager::with_max_sessions(
                global.max_connections,
            ))),
            relay: Arc::new(relay),
            max_auth_attempts: global.max_auth_attempts,
        };

        Ok(Self {
            config: Arc::new(config),
            russh_config: Arc::new(russh_config),
            context: Arc::new(context),
            registry,
            scheduler: Some(scheduler),
            shutdown,
        })
    }

    /// Get the server configuration.
    pub fn config(&self) -> &RelayFileConfig {
        &self.config
    }

    /// The server directory.
    pub fn registry(&self) -> &Arc<DirectoryRegistry> {
        &self.registry
    }

    /// Get the number of live connections.
    pub async fn session_count(&self) -> usize {
        self.context.sessions.read().await.session_count()
    }

    /// Serve on the configured address until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound or the
    /// accept loop fails.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .global
            .listen_path
            .parse()
            .with_context(|| format!("Invalid listen address {}", self.config.global.listen_path))?;
        // Selections are only resolvable once a snapshot exists.
        if let Some(mut scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.prime().await {
                tracing::warn!(error = %e, "Initial directory build incomplete, serving what was found");
            }
            scheduler.spawn();
        }

        let socket = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {addr}"))?;

        tracing::info!(local_addr = ?socket.local_addr(), "SSH bastion relay listening");

        let mut runner = BastionServerRunner {
            context: Arc::clone(&self.context),
        };

        let result = tokio::select! {
            result = async { runner.run_on_socket(Arc::clone(&self.russh_config), &socket).await } => {
                result.map_err(|e| anyhow::anyhow!("Server error: {}", e))
            }
            _ = shutdown => {
                tracing::info!("Shutting down, no longer accepting connections");
                Ok(())
            }
        };

        self.shutdown.cancel();
        self.context.relay.audit.flush().await;
        result
    }
}

/// Implements the russh::server::Server trait.
///
/// Kept separate from [`BastionServer`], which owns startup state that is
/// not `Clone`.
#[derive(Clone)]
struct BastionServerRunner {
    context: Arc<ConnectionContext>,
}

impl russh::server::Server for BastionServerRunner {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        tracing::debug!(peer = ?peer_addr, "New client connection");
        SshHandler::new(peer_addr, Arc::clone(&self.context))
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        tracing::error!(error = %error, "Session error");
    }
}

/// Build the russh server configuration.
fn build_russh_config(
    config: &RelayFileConfig,
    verifier: &CredentialVerifier,
) -> Result<russh::server::Config> {
    let global = &config.global;
    if global.host_keys.is_empty() {
        anyhow::bail!("No host keys configured. At least one host key is required.");
    }

    let keys = global
        .host_keys
        .iter()
        .map(load_host_key)
        .collect::<Result<Vec<_>>>()?;
    tracing::info!(key_count = keys.len(), "Loaded host keys");

    let mut methods = MethodSet::empty();
    methods.push(MethodKind::PublicKey);
    if verifier.supports_password() {
        methods.push(MethodKind::Password);
    }

    let inactivity_timeout = match global.inactivity_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    Ok(russh::server::Config {
        server_id: SshId::Standard(SERVER_ID.to_string()),
        methods,
        keys,
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: global.max_auth_attempts as usize,
        inactivity_timeout,
        ..Default::default()
    })
}

/// Load an SSH host key from a file.
fn load_host_key(path: impl AsRef<Path>) -> Result<russh::keys::PrivateKey> {
    let path = path.as_ref();
    tracing::debug!(path = %path.display(), "Loading host key");

    russh::keys::load_secret_key(path, None)
        .with_context(|| format!("Failed to load host key from {}", path.display()))
}

/// Attach the password and cloud key backends the configuration asks for.
async fn build_verifier(config: &RelayFileConfig) -> Result<CredentialVerifier> {
    let global = &config.global;
    #[allow(unused_mut)]
    let mut verifier = CredentialVerifier::new(config.users.clone());

    if global.uses_directory_auth() {
        #[cfg(feature = "ldap")]
        {
            let directory = auth::LdapBind::new(global.ldap_server.clone());
            verifier = verifier.with_directory(Arc::new(directory), global.ldap_domain.clone());
            tracing::info!(server = %global.ldap_server, "Directory password authentication enabled");
        }
        #[cfg(not(feature = "ldap"))]
        tracing::warn!("auth_type requests directory binds but ldap support is not built in");
    }

    let cloud_users = config.users.values().filter(|u| u.awsuser.is_some()).count();
    if cloud_users > 0 {
        #[cfg(feature = "aws")]
        {
            verifier = verifier.with_identity_keys(Arc::new(auth::IamKeySource::from_env().await));
        }
        #[cfg(not(feature = "aws"))]
        anyhow::bail!(
            "{cloud_users} user(s) reference awsuser but cloud identity support is not compiled in (enable the `aws` feature)"
        );
    }

    Ok(verifier)
}

fn audit_config(audit_log: Option<&Path>) -> AuditConfig {
    match audit_log {
        Some(path) => AuditConfig::new()
            .with_enabled(true)
            .with_exporters(vec![AuditExporterConfig::File {
                path: path.to_path_buf(),
            }]),
        None => AuditConfig::new(),
    }
}

/// Read the message of the day, normalized to terminal line endings.
async fn load_motd(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return String::new();
    };
    match tokio::fs::read_to_string(path).await {
        Ok(text) => text.replace("\r\n", "\n").replace('\n', "\r\n"),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read motd");
            String::new()
        }
    }
}
