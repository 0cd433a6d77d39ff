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

//! Integration tests for the session relay: request interception, host key
//! pinning, and a full relay against in-memory endpoints.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bastion_relay::server::audit::{
    AuditConfig, AuditExporter, AuditManager, DiscardTranscriptStore, EventType, MemoryExporter,
    Transcript, TranscriptSink, TranscriptStore,
};
use bastion_relay::server::auth::Permission;
use bastion_relay::server::config::{AclEntry, ServerEntry, UserEntry};
use bastion_relay::server::directory::{
    AccessControl, Backoff, DirectoryRegistry, RefreshScheduler,
};
use bastion_relay::server::relay::{
    ChannelEvent, ChannelRequest, DialRequest, Dialer, Endpoint, PasswordPrompt, PinnedHostKeys,
    RelayContext, RelayError, RelayOutcome, RequestInterceptor, RequestKind, SessionIdentity,
    SessionRelay, Upstream,
};
use bytes::Bytes;
use russh::keys::PublicKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const KEY_A: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
const KEY_B: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBk9qZgp0G2wZVjoaJi1iYDAtHcRmmbJuNWUQMPzOlZA";

fn public_key(line: &str) -> PublicKey {
    PublicKey::from_openssh(line).unwrap()
}

fn pty() -> RequestKind {
    RequestKind::Pty {
        term: "xterm".to_string(),
        cols: 80,
        rows: 24,
        pix_width: 0,
        pix_height: 0,
        modes: Vec::new(),
    }
}

#[test]
fn test_pty_request_replied_once_and_forwarded_without_reply() {
    let interceptor = RequestInterceptor::new();
    let outcome = interceptor.intercept(ChannelRequest::new(pty(), true));

    assert!(outcome.reply_now);
    let forwarded = outcome.forward.unwrap();
    assert!(!forwarded.want_reply);
    assert_eq!(forwarded.kind, pty());
}

#[test]
fn test_shell_and_exec_interception() {
    let interceptor = RequestInterceptor::new();

    let shell = interceptor.intercept(ChannelRequest::new(RequestKind::Shell, true));
    assert!(shell.reply_now);
    assert_eq!(shell.forward.map(|r| r.want_reply), Some(false));

    let exec = RequestKind::Exec(Bytes::from_static(b"uptime"));
    let outcome = interceptor.intercept(ChannelRequest::new(exec.clone(), true));
    assert!(!outcome.reply_now);
    assert_eq!(outcome.forward, Some(ChannelRequest::new(exec, true)));
}

#[test]
fn test_agent_forward_is_consumed() {
    let interceptor = RequestInterceptor::new();
    assert!(!interceptor.agent_forwarding());

    let outcome = interceptor.intercept(ChannelRequest::new(RequestKind::AgentForward, true));
    assert!(outcome.reply_now);
    assert!(outcome.forward.is_none());
    assert!(interceptor.agent_forwarding());
}

#[test]
fn test_pinned_host_keys() {
    let pinned = PinnedHostKeys::from_keys([public_key(KEY_A)]);
    assert!(pinned.accepts(&public_key(KEY_A)));
    assert!(!pinned.accepts(&public_key(KEY_B)));

    let unpinned = PinnedHostKeys::load(&[], "hostA");
    assert!(!unpinned.is_pinned());
    assert!(unpinned.accepts(&public_key(KEY_B)));
}

#[test]
fn test_pinned_host_key_files() {
    let mut good = tempfile::NamedTempFile::new().unwrap();
    writeln!(good, "{KEY_A} root@hostA").unwrap();
    let mut broken = tempfile::NamedTempFile::new().unwrap();
    writeln!(broken, "not a key").unwrap();

    let paths = vec![broken.path().to_path_buf(), good.path().to_path_buf()];
    let pinned = PinnedHostKeys::load(&paths, "hostA");
    assert!(pinned.accepts(&public_key(KEY_A)));
    assert!(!pinned.accepts(&public_key(KEY_B)));

    let only_broken = PinnedHostKeys::load(&[broken.path().to_path_buf()], "hostA");
    assert!(only_broken.is_pinned());
    assert!(!only_broken.accepts(&public_key(KEY_A)));
}

/// Endpoint recording what it is sent.
#[derive(Default)]
struct MemoryEndpoint {
    events: Mutex<Vec<ChannelEvent>>,
    closes: AtomicUsize,
}

impl MemoryEndpoint {
    fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().unwrap().clone()
    }

    fn output(&self) -> String {
        self.events()
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
                _ => None,
            })
            .collect()
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn push(&self, event: ChannelEvent) -> Result<()> {
        if self.closes() > 0 {
            anyhow::bail!("channel closed");
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
    async fn data(&self, data: Bytes) -> Result<()> {
        self.push(ChannelEvent::Data(data))
    }

    async fn extended_data(&self, code: u32, data: Bytes) -> Result<()> {
        self.push(ChannelEvent::ExtendedData(code, data))
    }

    async fn request(&self, request: ChannelRequest) -> Result<()> {
        self.push(ChannelEvent::Request(request))
    }

    async fn reply(&self, success: bool) -> Result<()> {
        self.push(ChannelEvent::Reply(success))
    }

    async fn eof(&self) -> Result<()> {
        self.push(ChannelEvent::Eof)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Dialer handing out one prepared remote.
struct MemoryDialer {
    remote: Arc<MemoryEndpoint>,
    remote_events: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
    dialed: Mutex<Vec<(String, String)>>,
    fail: bool,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(
        &self,
        request: DialRequest,
        _prompt: &mut dyn PasswordPrompt,
    ) -> Result<Upstream, RelayError> {
        self.dialed
            .lock()
            .unwrap()
            .push((request.record.key.clone(), request.remote_user.clone()));
        if self.fail {
            return Err(RelayError::HostKeyMismatch);
        }
        let events = self
            .remote_events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RelayError::Connect("already dialed".to_string()))?;
        Ok(Upstream {
            endpoint: self.remote.clone(),
            events,
        })
    }
}

struct Harness {
    context: Arc<RelayContext>,
    exporter: Arc<MemoryExporter>,
    dialer: Arc<MemoryDialer>,
    remote: Arc<MemoryEndpoint>,
    remote_tx: mpsc::Sender<ChannelEvent>,
    _shutdown: tokio_util::sync::DropGuard,
}

/// Store whose transcripts can never be opened.
struct UnwritableTranscripts;

#[async_trait]
impl TranscriptStore for UnwritableTranscripts {
    async fn open(&self, _user: &str, _server: &str) -> Result<Box<dyn TranscriptSink>> {
        anyhow::bail!("permission denied")
    }
}

async fn harness(fail_dial: bool) -> Harness {
    harness_with(fail_dial, Arc::new(DiscardTranscriptStore)).await
}

/// alice may reach hostA and hostGone, which the directory does not know.
/// bob references an ACL that does not exist.
async fn harness_with(fail_dial: bool, transcripts: Arc<dyn TranscriptStore>) -> Harness {
    let servers = BTreeMap::from([(
        "hostA".to_string(),
        ServerEntry {
            connect_path: "10.0.0.5:22".to_string(),
            ..Default::default()
        },
    )]);
    let users = BTreeMap::from([
        (
            "alice".to_string(),
            UserEntry {
                acl: "ops".to_string(),
                ..Default::default()
            },
        ),
        (
            "bob".to_string(),
            UserEntry {
                acl: "ghost".to_string(),
                ..Default::default()
            },
        ),
    ]);
    let acls = BTreeMap::from([(
        "ops".to_string(),
        AclEntry {
            allow_list: vec!["hostA".to_string(), "hostGone".to_string()],
            aws_allow_list: Vec::new(),
        },
    )]);

    let registry = Arc::new(DirectoryRegistry::builder().static_servers(servers).build());
    registry.rebuild().await.unwrap();
    let shutdown = CancellationToken::new();
    let (scheduler, refresh) =
        RefreshScheduler::new(Arc::clone(&registry), Backoff::default(), shutdown.clone());
    scheduler.spawn();

    let exporter = Arc::new(MemoryExporter::new());
    let audit = AuditManager::with_exporters(
        &AuditConfig::new().with_enabled(true),
        vec![exporter.clone() as Arc<dyn AuditExporter>],
    );

    let remote = Arc::new(MemoryEndpoint::default());
    let (remote_tx, remote_rx) = mpsc::channel(16);
    let dialer = Arc::new(MemoryDialer {
        remote: Arc::clone(&remote),
        remote_events: Mutex::new(Some(remote_rx)),
        dialed: Mutex::new(Vec::new()),
        fail: fail_dial,
    });

    let context = Arc::new(RelayContext {
        registry,
        refresh,
        access: Arc::new(AccessControl::new(&users, &acls)),
        dialer: dialer.clone(),
        audit: Arc::new(audit),
        transcripts,
        motd: "Authorized use only".to_string(),
        pass_password: false,
        redraw_delay: Duration::ZERO,
    });

    Harness {
        context,
        exporter,
        dialer,
        remote,
        remote_tx,
        _shutdown: shutdown.drop_guard(),
    }
}

fn alice() -> SessionIdentity {
    identity("alice")
}

fn identity(user: &str) -> SessionIdentity {
    SessionIdentity {
        session_id: "session-1".to_string(),
        user: user.to_string(),
        peer: None,
        permission: Permission::public_key(),
    }
}

fn relay_for(
    h: &Harness,
    user: &str,
    client: &Arc<MemoryEndpoint>,
) -> (SessionRelay, mpsc::UnboundedSender<ChannelEvent>) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let relay = SessionRelay::new(
        Arc::clone(&h.context),
        identity(user),
        client.clone(),
        client_rx,
        RequestInterceptor::new(),
        Arc::new(Transcript::new()),
    );
    (relay, client_tx)
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_relay_end_to_end() {
    let h = harness(false).await;
    let client = Arc::new(MemoryEndpoint::default());
    let (client_tx, client_rx) = mpsc::unbounded_channel();

    let relay = SessionRelay::new(
        Arc::clone(&h.context),
        alice(),
        client.clone(),
        client_rx,
        RequestInterceptor::new(),
        Arc::new(Transcript::new()),
    );
    let task = tokio::spawn(relay.run());

    // Requests sent before the target is chosen reach it once connected.
    client_tx
        .send(ChannelEvent::Request(ChannelRequest::new(pty(), false)))
        .unwrap();
    client_tx
        .send(ChannelEvent::Data(Bytes::from_static(b"1\r")))
        .unwrap();

    let remote = Arc::clone(&h.remote);
    wait_until(|| !h.dialer.dialed.lock().unwrap().is_empty()).await;
    assert_eq!(
        h.dialer.dialed.lock().unwrap()[0],
        ("hostA".to_string(), "alice".to_string())
    );

    client_tx
        .send(ChannelEvent::Data(Bytes::from_static(b"uptime\n")))
        .unwrap();
    wait_until(|| {
        remote
            .events()
            .contains(&ChannelEvent::Data(Bytes::from_static(b"uptime\n")))
    })
    .await;
    assert!(remote
        .events()
        .contains(&ChannelEvent::Request(ChannelRequest::new(pty(), false))));

    h.remote_tx
        .send(ChannelEvent::Data(Bytes::from_static(b" 10:00 up 3 days\n")))
        .await
        .unwrap();
    h.remote_tx.send(ChannelEvent::Close).await.unwrap();

    let outcome = task.await.unwrap();
    assert!(matches!(outcome, RelayOutcome::Completed(_)));

    let screen = client.output();
    assert!(screen.contains("Authorized use only"));
    assert!(screen.contains("[  1 ] hostA"));
    assert!(screen.contains("Connecting to hostA"));
    assert!(screen.contains("10:00 up 3 days"));

    assert_eq!(client.closes(), 1);
    assert_eq!(h.remote.closes(), 1);

    h.context.audit.sync().await;
    assert_eq!(h.exporter.count(EventType::RelayConnected), 1);
    assert_eq!(h.exporter.count(EventType::RelayDisconnected), 1);
}

#[tokio::test]
async fn test_dial_failure_ends_session() {
    let h = harness(true).await;
    let client = Arc::new(MemoryEndpoint::default());
    let (client_tx, client_rx) = mpsc::unbounded_channel();

    let relay = SessionRelay::new(
        Arc::clone(&h.context),
        alice(),
        client.clone(),
        client_rx,
        RequestInterceptor::new(),
        Arc::new(Transcript::new()),
    );
    client_tx
        .send(ChannelEvent::Data(Bytes::from_static(b"1\r")))
        .unwrap();

    assert_eq!(relay.run().await, RelayOutcome::Aborted);
    assert!(client.output().contains("Connect failed: HOST KEY VALIDATION FAILED"));
    assert_eq!(client.closes(), 1);

    h.context.audit.sync().await;
    assert_eq!(h.exporter.count(EventType::HostKeyMismatch), 1);
    assert_eq!(h.exporter.count(EventType::RelayFailed), 1);
    assert_eq!(h.exporter.count(EventType::RelayConnected), 0);
}

#[tokio::test]
async fn test_unknown_user_is_told_and_closed() {
    let h = harness(false).await;
    let client = Arc::new(MemoryEndpoint::default());
    let (_client_tx, client_rx) = mpsc::unbounded_channel();

    let mut identity = alice();
    identity.user = "mallory".to_string();
    let relay = SessionRelay::new(
        Arc::clone(&h.context),
        identity,
        client.clone(),
        client_rx,
        RequestInterceptor::new(),
        Arc::new(Transcript::new()),
    );

    assert_eq!(relay.run().await, RelayOutcome::Aborted);
    assert!(client.output().contains("User has no permitted remote hosts."));
    assert_eq!(client.closes(), 1);
    assert!(h.dialer.dialed.lock().unwrap().is_empty());

    h.context.audit.sync().await;
    assert_eq!(h.exporter.count(EventType::ConfigFault), 1);
}

#[tokio::test]
async fn test_invalid_acl_is_a_config_fault() {
    let h = harness(false).await;
    let client = Arc::new(MemoryEndpoint::default());
    let (relay, _client_tx) = relay_for(&h, "bob", &client);

    assert_eq!(relay.run().await, RelayOutcome::Aborted);
    assert!(client.output().contains("Invalid ACL"));
    assert_eq!(client.closes(), 1);
    assert!(h.dialer.dialed.lock().unwrap().is_empty());

    h.context.audit.sync().await;
    assert_eq!(h.exporter.count(EventType::ConfigFault), 1);
    assert_eq!(h.exporter.count(EventType::RelayConnecting), 0);
}

#[tokio::test]
async fn test_selection_missing_from_directory_ends_session() {
    let h = harness(false).await;
    let client = Arc::new(MemoryEndpoint::default());
    let (relay, client_tx) = relay_for(&h, "alice", &client);

    // hostGone is offered by the ACL but absent from the directory.
    client_tx
        .send(ChannelEvent::Data(Bytes::from_static(b"2\r")))
        .unwrap();

    assert_eq!(relay.run().await, RelayOutcome::Aborted);
    let screen = client.output();
    assert!(screen.contains("[  2 ] hostGone"));
    assert!(screen.contains("Incorrectly Configured Server Selected."));
    assert_eq!(client.closes(), 1);
    assert!(h.dialer.dialed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_transcript_failure_aborts_before_dial() {
    let h = harness_with(false, Arc::new(UnwritableTranscripts)).await;
    let client = Arc::new(MemoryEndpoint::default());
    let (relay, client_tx) = relay_for(&h, "alice", &client);

    client_tx
        .send(ChannelEvent::Data(Bytes::from_static(b"1\r")))
        .unwrap();

    assert_eq!(relay.run().await, RelayOutcome::Aborted);
    assert!(client.output().contains("Failed to Initialize Session."));
    assert_eq!(client.closes(), 1);
    assert!(h.dialer.dialed.lock().unwrap().is_empty());
    assert!(h.remote.events().is_empty());

    h.context.audit.sync().await;
    assert_eq!(h.exporter.count(EventType::RelayConnecting), 0);
    assert_eq!(h.exporter.count(EventType::RelayConnected), 0);
}

#[tokio::test]
async fn test_queued_env_and_exec_get_one_remote_reply() {
    let h = harness(false).await;
    let client = Arc::new(MemoryEndpoint::default());
    let (relay, client_tx) = relay_for(&h, "alice", &client);
    let task = tokio::spawn(relay.run());

    // Both arrive while the user is still choosing, as the handler would
    // queue them after interception.
    let env = RequestKind::Env {
        name: "LANG".to_string(),
        value: "C.UTF-8".to_string(),
    };
    let exec = RequestKind::Exec(Bytes::from_static(b"uptime"));
    let interceptor = RequestInterceptor::new();
    for kind in [env.clone(), exec.clone()] {
        let outcome = interceptor.intercept(ChannelRequest::inbound(kind));
        client_tx
            .send(ChannelEvent::Request(outcome.forward.unwrap()))
            .unwrap();
    }
    client_tx
        .send(ChannelEvent::Data(Bytes::from_static(b"1\r")))
        .unwrap();

    let remote = Arc::clone(&h.remote);
    let exec_request = ChannelEvent::Request(ChannelRequest::new(exec, true));
    wait_until(|| remote.events().contains(&exec_request)).await;

    let sent = remote.events();
    let env_at = sent
        .iter()
        .position(|e| *e == ChannelEvent::Request(ChannelRequest::new(env.clone(), false)))
        .expect("env forwarded without a reply requested");
    let exec_at = sent.iter().position(|e| *e == exec_request).unwrap();
    assert!(env_at < exec_at);

    // Only exec asked the remote for a reply, so this one belongs to it.
    h.remote_tx.send(ChannelEvent::Reply(true)).await.unwrap();
    wait_until(|| client.events().contains(&ChannelEvent::Reply(true))).await;
    h.remote_tx.send(ChannelEvent::Close).await.unwrap();
    task.await.unwrap();

    let replies = client
        .events()
        .iter()
        .filter(|e| matches!(e, ChannelEvent::Reply(_)))
        .count();
    assert_eq!(replies, 1);
}
