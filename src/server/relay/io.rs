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

//! Byte-stream adapters over channel events, used while the session is
//! still talking to the relay itself.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use super::link::{ChannelEvent, Endpoint, Prefixed};
use crate::server::audit::Transcript;

/// Requests held back while the user is selecting a server.
const HELD_LIMIT: usize = 64;

/// Reads client data from the inbound event queue.
///
/// Requests that arrive meanwhile are held, in order, for relaying once the
/// remote side exists. EOF or close reads as end of stream.
pub struct ChannelReader {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    buffer: Bytes,
    held: VecDeque<ChannelEvent>,
    finished: bool,
}

impl ChannelReader {
    pub fn new(events: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self {
            events,
            buffer: Bytes::new(),
            held: VecDeque::new(),
            finished: false,
        }
    }

    fn hold(&mut self, event: ChannelEvent) {
        if self.held.len() >= HELD_LIMIT {
            tracing::warn!("Too many requests before relay start, dropping one");
            return;
        }
        self.held.push_back(event);
    }

    /// Turn the reader into the inbound event source for the relay.
    ///
    /// Held requests come first, then `leftover` (bytes already taken from
    /// the reader but not consumed), then unread data, then live events.
    pub fn into_source(self, leftover: Vec<u8>) -> Prefixed<mpsc::UnboundedReceiver<ChannelEvent>> {
        let mut prelude: Vec<ChannelEvent> = self.held.into_iter().collect();
        if !leftover.is_empty() {
            prelude.push(ChannelEvent::Data(Bytes::from(leftover)));
        }
        if !self.buffer.is_empty() {
            prelude.push(ChannelEvent::Data(self.buffer));
        }
        if self.finished {
            prelude.push(ChannelEvent::Close);
        }
        Prefixed::new(prelude, self.events)
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.buffer.is_empty() {
                let n = this.buffer.len().min(buf.remaining());
                buf.put_slice(&this.buffer[..n]);
                this.buffer.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.finished {
                return Poll::Ready(Ok(()));
            }
            match this.events.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(ChannelEvent::Data(data))) => this.buffer = data,
                Poll::Ready(Some(event @ ChannelEvent::Request(_))) => this.hold(event),
                Poll::Ready(Some(ChannelEvent::ExtendedData(..))) => {}
                Poll::Ready(Some(ChannelEvent::Reply(_))) => {}
                Poll::Ready(Some(ChannelEvent::Eof | ChannelEvent::Close) | None) => {
                    this.finished = true;
                }
            }
        }
    }
}

/// Writes to an endpoint as a byte stream, copying into the transcript.
pub struct EndpointWriter {
    endpoint: Arc<dyn Endpoint>,
    transcript: Option<Arc<Transcript>>,
    in_flight: Option<(usize, BoxFuture<'static, io::Result<()>>)>,
}

impl EndpointWriter {
    pub fn new(endpoint: Arc<dyn Endpoint>, transcript: Option<Arc<Transcript>>) -> Self {
        Self {
            endpoint,
            transcript,
            in_flight: None,
        }
    }

    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let Some((len, fut)) = self.in_flight.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let len = *len;
        match fut.poll_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.in_flight = None;
                Poll::Ready(result.map(|()| len))
            }
        }
    }
}

impl AsyncWrite for EndpointWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.in_flight.is_none() {
            let endpoint = Arc::clone(&this.endpoint);
            let transcript = this.transcript.clone();
            let data = Bytes::copy_from_slice(buf);
            let fut = async move {
                if let Some(t) = transcript {
                    t.record_output(&data).await;
                }
                endpoint
                    .data(data)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
            };
            this.in_flight = Some((buf.len(), Box::pin(fut)));
        }
        this.poll_in_flight(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_in_flight(cx).map_ok(|_| ())
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
