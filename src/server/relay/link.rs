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

//! Bidirectional relay between two channel endpoints.
//!
//! Each direction is pumped by its own task, carrying data, extended data,
//! requests, replies and EOF in arrival order. The first pump to finish
//! closes both endpoints through [`RelayLink::close`], which runs at most
//! once no matter how many paths trigger it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::request::ChannelRequest;
use crate::server::audit::Transcript;

/// Something that arrived on one side of the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Data(Bytes),
    ExtendedData(u32, Bytes),
    Request(ChannelRequest),
    /// Answer to a request forwarded to this side.
    Reply(bool),
    Eof,
    Close,
}

/// One side of a relay.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn data(&self, data: Bytes) -> Result<()>;

    async fn extended_data(&self, code: u32, data: Bytes) -> Result<()>;

    async fn request(&self, request: ChannelRequest) -> Result<()>;

    async fn reply(&self, success: bool) -> Result<()>;

    async fn eof(&self) -> Result<()>;

    /// Close the channel. Must tolerate an already closed channel.
    async fn close(&self);
}

/// Stream of events from one side.
#[async_trait]
pub trait EventSource: Send {
    /// Next event, `None` once the side is gone.
    async fn next_event(&mut self) -> Option<ChannelEvent>;
}

#[async_trait]
impl EventSource for mpsc::Receiver<ChannelEvent> {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.recv().await
    }
}

#[async_trait]
impl EventSource for mpsc::UnboundedReceiver<ChannelEvent> {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.recv().await
    }
}

/// Event source that replays queued events before reading on.
pub struct Prefixed<S> {
    prelude: VecDeque<ChannelEvent>,
    rest: S,
}

impl<S> Prefixed<S> {
    pub fn new(prelude: impl IntoIterator<Item = ChannelEvent>, rest: S) -> Self {
        Self {
            prelude: prelude.into_iter().collect(),
            rest,
        }
    }
}

#[async_trait]
impl<S: EventSource> EventSource for Prefixed<S> {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        match self.prelude.pop_front() {
            Some(event) => Some(event),
            None => self.rest.next_event().await,
        }
    }
}

/// Which side ended the relay first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Inbound,
    Outbound,
}

/// A live relay between an inbound and an outbound endpoint.
pub struct RelayLink {
    inbound: Arc<dyn Endpoint>,
    outbound: Arc<dyn Endpoint>,
    closed: AtomicBool,
    closing: CancellationToken,
}

impl RelayLink {
    pub fn new(inbound: Arc<dyn Endpoint>, outbound: Arc<dyn Endpoint>) -> Arc<Self> {
        Arc::new(Self {
            inbound,
            outbound,
            closed: AtomicBool::new(false),
            closing: CancellationToken::new(),
        })
    }

    /// Close both endpoints. Only the first call has any effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.cancel();
        tokio::join!(self.inbound.close(), self.outbound.close());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pump both directions until one side ends, then close both.
    ///
    /// Bytes delivered to the client are copied into `transcript`.
    pub async fn run<I, O>(self: &Arc<Self>, inbound: I, outbound: O, transcript: Arc<Transcript>) -> Side
    where
        I: EventSource + 'static,
        O: EventSource + 'static,
    {
        let (ended_tx, mut ended_rx) = mpsc::channel::<Side>(2);

        let upstream = {
            let link = Arc::clone(self);
            let ended = ended_tx.clone();
            tokio::spawn(async move {
                link.pump(inbound, Arc::clone(&link.outbound), None).await;
                let _ = ended.send(Side::Inbound).await;
                link.close().await;
            })
        };

        let downstream = {
            let link = Arc::clone(self);
            tokio::spawn(async move {
                link.pump(outbound, Arc::clone(&link.inbound), Some(transcript))
                    .await;
                let _ = ended_tx.send(Side::Outbound).await;
                link.close().await;
            })
        };

        let first = ended_rx.recv().await.unwrap_or(Side::Inbound);
        if let Err(e) = upstream.await {
            tracing::warn!(error = %e, "Upstream pump task failed");
        }
        if let Err(e) = downstream.await {
            tracing::warn!(error = %e, "Downstream pump task failed");
        }
        // Covers pump tasks that panicked before reaching their own close.
        self.close().await;
        first
    }

    async fn pump<S: EventSource>(
        &self,
        mut events: S,
        target: Arc<dyn Endpoint>,
        transcript: Option<Arc<Transcript>>,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.closing.cancelled() => break,
                event = events.next_event() => event,
            };

            let result = match event {
                None | Some(ChannelEvent::Close) => break,
                Some(ChannelEvent::Data(data)) => {
                    if let Some(t) = &transcript {
                        t.record_output(&data).await;
                    }
                    target.data(data).await
                }
                Some(ChannelEvent::ExtendedData(code, data)) => {
                    if let Some(t) = &transcript {
                        t.record_output(&data).await;
                    }
                    target.extended_data(code, data).await
                }
                Some(ChannelEvent::Request(request)) => {
                    tracing::trace!(request = %request, "Relaying request");
                    target.request(request).await
                }
                Some(ChannelEvent::Reply(success)) => target.reply(success).await,
                // Half-close; the other direction keeps flowing.
                Some(ChannelEvent::Eof) => target.eof().await,
            };

            if let Err(e) = result {
                tracing::debug!(error = %e, "Relay target rejected event");
                break;
            }
        }
    }
}
