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

//! Per-session transcripts.
//!
//! A [`Transcript`] is created as soon as a session channel is accepted and
//! buffers what it observes until the relay target is known. Once the
//! target resolves, [`TranscriptStore::open`] provides the durable sink and
//! [`Transcript::attach`] flushes the buffer into it.

use super::file::open_private_append;
use crate::utils::sanitize::sanitize_path_component;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

/// Bytes retained before a sink is attached.
const PENDING_LIMIT: usize = 64 * 1024;

/// Destination of one session's transcript.
#[async_trait]
pub trait TranscriptSink: Send {
    /// Append raw bytes.
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Push buffered bytes to the destination.
    async fn flush(&mut self) -> std::io::Result<()>;
}

/// Opens transcript sinks keyed by user and relay target.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Open the sink for `user` relaying to `server`.
    async fn open(&self, user: &str, server: &str) -> Result<Box<dyn TranscriptSink>>;
}

/// Store writing `{root}/{user}/{timestamp}-{server}.log`.
#[derive(Debug, Clone)]
pub struct FsTranscriptStore {
    root: PathBuf,
}

impl FsTranscriptStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, user: &str, server: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%.3f");
        self.root
            .join(sanitize_path_component(user))
            .join(format!("{stamp}-{}.log", sanitize_path_component(server)))
    }
}

struct FileSink(BufWriter<tokio::fs::File>);

#[async_trait]
impl TranscriptSink for FileSink {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.0.write_all(data).await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush().await
    }
}

#[async_trait]
impl TranscriptStore for FsTranscriptStore {
    async fn open(&self, user: &str, server: &str) -> Result<Box<dyn TranscriptSink>> {
        let path = self.path_for(user, server);
        let file = tokio::task::spawn_blocking({
            let path = path.clone();
            move || open_private_append(&path)
        })
        .await
        .context("transcript open task failed")?
        .with_context(|| format!("Failed to open transcript {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Opened session transcript");
        Ok(Box::new(FileSink(BufWriter::new(tokio::fs::File::from_std(
            file,
        )))))
    }
}

/// Store whose sinks discard everything; used when no transcript
/// directory is configured.
#[derive(Debug, Clone, Default)]
pub struct DiscardTranscriptStore;

struct DiscardSink;

#[async_trait]
impl TranscriptSink for DiscardSink {
    async fn write(&mut self, _data: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TranscriptStore for DiscardTranscriptStore {
    async fn open(&self, _user: &str, _server: &str) -> Result<Box<dyn TranscriptSink>> {
        Ok(Box::new(DiscardSink))
    }
}

enum State {
    Pending { buffer: Vec<u8>, truncated: bool },
    Attached(Box<dyn TranscriptSink>),
    Closed,
}

/// Transcript of one relayed session.
///
/// Records every inbound control request and every byte sent to the
/// client. Write failures are logged and never interrupt the relay.
pub struct Transcript {
    state: Mutex<State>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    /// Create a transcript that buffers until a sink is attached.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending {
                buffer: Vec::new(),
                truncated: false,
            }),
        }
    }

    /// Record an inbound control request.
    pub async fn record_request(&self, description: &str) {
        let line = format!(
            "\n[{}] request: {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            description
        );
        self.append(line.as_bytes()).await;
    }

    /// Record bytes delivered to the client.
    pub async fn record_output(&self, data: &[u8]) {
        self.append(data).await;
    }

    /// Attach the durable sink, writing everything buffered so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffered bytes cannot be written; the
    /// session must not be relayed in that case.
    pub async fn attach(&self, mut sink: Box<dyn TranscriptSink>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let State::Pending { buffer, truncated } = &*state {
            sink.write(buffer)
                .await
                .context("Failed to write transcript")?;
            if *truncated {
                sink.write(b"\n[transcript truncated before attach]\n")
                    .await
                    .context("Failed to write transcript")?;
            }
            sink.flush().await.context("Failed to flush transcript")?;
        }
        *state = State::Attached(sink);
        Ok(())
    }

    /// Flush and stop recording.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let State::Attached(sink) = &mut *state {
            if let Err(e) = sink.flush().await {
                tracing::warn!(error = %e, "Failed to flush transcript");
            }
        }
        *state = State::Closed;
    }

    async fn append(&self, data: &[u8]) {
        let mut state = self.state.lock().await;
        match &mut *state {
            State::Pending { buffer, truncated } => {
                let room = PENDING_LIMIT.saturating_sub(buffer.len());
                if data.len() > room {
                    *truncated = true;
                }
                buffer.extend_from_slice(&data[..data.len().min(room)]);
            }
            State::Attached(sink) => {
                if let Err(e) = sink.write(data).await {
                    tracing::warn!(error = %e, "Failed to write transcript");
                }
            }
            State::Closed => {}
        }
    }
}
