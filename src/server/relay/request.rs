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

//! Channel requests and the inbound request interceptor.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use russh::{Pty, Sig};

/// Channel request payloads relayed between the two sides.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Pty {
        term: String,
        cols: u32,
        rows: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Bytes),
    Subsystem(String),
    Env {
        name: String,
        value: String,
    },
    WindowChange {
        cols: u32,
        rows: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
    X11 {
        single_connection: bool,
        auth_protocol: String,
        auth_cookie: String,
        screen: u32,
    },
    AgentForward,
    ExitStatus(u32),
    ExitSignal {
        signal: Sig,
        core_dumped: bool,
        message: String,
        lang: String,
    },
    XonXoff(bool),
}

impl RequestKind {
    /// Wire name of the request type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pty { .. } => "pty-req",
            Self::Shell => "shell",
            Self::Exec(_) => "exec",
            Self::Subsystem(_) => "subsystem",
            Self::Env { .. } => "env",
            Self::WindowChange { .. } => "window-change",
            Self::Signal(_) => "signal",
            Self::X11 { .. } => "x11-req",
            Self::AgentForward => "auth-agent-req@openssh.com",
            Self::ExitStatus(_) => "exit-status",
            Self::ExitSignal { .. } => "exit-signal",
            Self::XonXoff(_) => "xon-xoff",
        }
    }

    /// Whether the remote's answer is what the client waits on. Only
    /// these are sent upstream with a reply requested.
    pub fn reply_from_remote(&self) -> bool {
        matches!(self, Self::Exec(_) | Self::Subsystem(_))
    }

    /// Whether clients normally ask for a reply to this request type.
    pub fn replies_expected(&self) -> bool {
        matches!(
            self,
            Self::Pty { .. }
                | Self::Shell
                | Self::Exec(_)
                | Self::Subsystem(_)
                | Self::Env { .. }
                | Self::X11 { .. }
                | Self::AgentForward
        )
    }
}

// `Sig` has no equality of its own; signals compare by their debug form,
// which carries the name for both standard and custom signals.
fn same_signal(a: &Sig, b: &Sig) -> bool {
    format!("{a:?}") == format!("{b:?}")
}

impl PartialEq for RequestKind {
    fn eq(&self, other: &Self) -> bool {
        use RequestKind::*;
        match (self, other) {
            (
                Pty {
                    term,
                    cols,
                    rows,
                    pix_width,
                    pix_height,
                    modes,
                },
                Pty {
                    term: o_term,
                    cols: o_cols,
                    rows: o_rows,
                    pix_width: o_pw,
                    pix_height: o_ph,
                    modes: o_modes,
                },
            ) => {
                term == o_term
                    && cols == o_cols
                    && rows == o_rows
                    && pix_width == o_pw
                    && pix_height == o_ph
                    && modes == o_modes
            }
            (Shell, Shell) | (AgentForward, AgentForward) => true,
            (Exec(a), Exec(b)) => a == b,
            (Subsystem(a), Subsystem(b)) => a == b,
            (Env { name, value }, Env { name: o_name, value: o_value }) => {
                name == o_name && value == o_value
            }
            (
                WindowChange {
                    cols,
                    rows,
                    pix_width,
                    pix_height,
                },
                WindowChange {
                    cols: o_cols,
                    rows: o_rows,
                    pix_width: o_pw,
                    pix_height: o_ph,
                },
            ) => cols == o_cols && rows == o_rows && pix_width == o_pw && pix_height == o_ph,
            (Signal(a), Signal(b)) => same_signal(a, b),
            (
                X11 {
                    single_connection,
                    auth_protocol,
                    auth_cookie,
                    screen,
                },
                X11 {
                    single_connection: o_single,
                    auth_protocol: o_protocol,
                    auth_cookie: o_cookie,
                    screen: o_screen,
                },
            ) => {
                single_connection == o_single
                    && auth_protocol == o_protocol
                    && auth_cookie == o_cookie
                    && screen == o_screen
            }
            (ExitStatus(a), ExitStatus(b)) => a == b,
            (
                ExitSignal {
                    signal,
                    core_dumped,
                    message,
                    lang,
                },
                ExitSignal {
                    signal: o_signal,
                    core_dumped: o_core,
                    message: o_message,
                    lang: o_lang,
                },
            ) => {
                same_signal(signal, o_signal)
                    && core_dumped == o_core
                    && message == o_message
                    && lang == o_lang
            }
            (XonXoff(a), XonXoff(b)) => a == b,
            _ => false,
        }
    }
}

/// A channel request travelling through the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    pub kind: RequestKind,
    pub want_reply: bool,
}

impl ChannelRequest {
    pub fn new(kind: RequestKind, want_reply: bool) -> Self {
        Self { kind, want_reply }
    }

    /// Request as received from an inbound client.
    ///
    /// The server library keeps the wire flag to itself: it remembers the
    /// flag of the latest request on each channel and discards replies that
    /// request did not ask for. The flag here is therefore the type's usual
    /// one, and only decides whether a reply is attempted.
    pub fn inbound(kind: RequestKind) -> Self {
        let want_reply = kind.replies_expected();
        Self { kind, want_reply }
    }
}

impl fmt::Display for ChannelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (want_reply={})", self.kind.name(), self.want_reply)?;
        match &self.kind {
            RequestKind::Pty {
                term, cols, rows, ..
            } => write!(f, " term={term} size={cols}x{rows}"),
            RequestKind::Exec(command) => {
                write!(f, " command={:?}", String::from_utf8_lossy(command))
            }
            RequestKind::Subsystem(name) => write!(f, " name={name}"),
            RequestKind::Env { name, .. } => write!(f, " name={name}"),
            RequestKind::WindowChange { cols, rows, .. } => write!(f, " size={cols}x{rows}"),
            RequestKind::Signal(sig) => write!(f, " signal={sig:?}"),
            RequestKind::ExitStatus(code) => write!(f, " status={code}"),
            _ => Ok(()),
        }
    }
}

/// What the interceptor decided for one inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct Interception {
    /// Reply success to the client right now.
    pub reply_now: bool,
    /// Request to queue for the remote side, if any.
    pub forward: Option<ChannelRequest>,
}

/// Applies the relay's request rules before anything reaches the remote.
///
/// Agent forwarding requests are acknowledged and consumed; they only
/// enable agent-based authentication for the outbound dial. `exec` and
/// `subsystem` go upstream as received and the remote's reply is relayed
/// back. Every other request is acknowledged here when a reply is wanted
/// and forwarded with the reply flag cleared, so the remote never answers
/// it. A remote reply can then only ever belong to the request the client
/// is still waiting on.
#[derive(Debug, Clone, Default)]
pub struct RequestInterceptor {
    agent_forwarding: Arc<AtomicBool>,
}

impl RequestInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intercept(&self, mut request: ChannelRequest) -> Interception {
        match request.kind {
            RequestKind::AgentForward => {
                self.agent_forwarding.store(true, Ordering::SeqCst);
                Interception {
                    reply_now: request.want_reply,
                    forward: None,
                }
            }
            _ if request.kind.reply_from_remote() => Interception {
                reply_now: false,
                forward: Some(request),
            },
            _ => {
                let reply_now = request.want_reply;
                request.want_reply = false;
                Interception {
                    reply_now,
                    forward: Some(request),
                }
            }
        }
    }

    /// Whether the client asked for agent forwarding on this channel.
    pub fn agent_forwarding(&self) -> bool {
        self.agent_forwarding.load(Ordering::SeqCst)
    }
}
