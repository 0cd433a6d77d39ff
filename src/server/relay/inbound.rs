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

//! The client-facing side of a relay.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};

use super::link::Endpoint;
use super::request::{ChannelRequest, RequestKind};

/// Session channel on the inbound connection, driven through its handle.
pub struct InboundEndpoint {
    handle: Handle,
    channel: ChannelId,
}

impl InboundEndpoint {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }

    /// Handle of the inbound connection.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

fn gone() -> anyhow::Error {
    anyhow!("inbound channel is closed")
}

#[async_trait]
impl Endpoint for InboundEndpoint {
    async fn data(&self, data: Bytes) -> Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(&data))
            .await
            .map_err(|_| gone())
    }

    async fn extended_data(&self, code: u32, data: Bytes) -> Result<()> {
        self.handle
            .extended_data(self.channel, code, CryptoVec::from_slice(&data))
            .await
            .map_err(|_| gone())
    }

    async fn request(&self, request: ChannelRequest) -> Result<()> {
        match request.kind {
            RequestKind::ExitStatus(code) => self
                .handle
                .exit_status_request(self.channel, code)
                .await
                .map_err(|_| gone()),
            RequestKind::ExitSignal {
                signal,
                core_dumped,
                message,
                lang,
            } => self
                .handle
                .exit_signal_request(self.channel, signal, core_dumped, message, lang)
                .await
                .map_err(|_| gone()),
            RequestKind::XonXoff(client_can_do) => self
                .handle
                .xon_xoff_request(self.channel, client_can_do)
                .await
                .map_err(|_| gone()),
            other => {
                tracing::debug!(request = other.name(), "Request not relayable to client, dropped");
                Ok(())
            }
        }
    }

    async fn reply(&self, success: bool) -> Result<()> {
        let sent = if success {
            self.handle.channel_success(self.channel).await
        } else {
            self.handle.channel_failure(self.channel).await
        };
        sent.map_err(|_| gone())
    }

    async fn eof(&self) -> Result<()> {
        self.handle.eof(self.channel).await.map_err(|_| gone())
    }

    async fn close(&self) {
        let _ = self.handle.close(self.channel).await;
    }
}
