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

//! Audit logging for the relay.
//!
//! # Overview
//!
//! - [`AuditEvent`]: connection, authentication, relay and security events
//! - [`AuditExporter`]: destinations for events
//! - [`AuditManager`]: collects events and hands them to exporters from a
//!   background worker
//! - [`transcript`]: per-session transcripts keyed by relay target
//!
//! # Example
//!
//! ```no_run
//! use bastion_relay::server::audit::{AuditManager, AuditConfig, event::{AuditEvent, EventType}};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AuditConfig::new().with_enabled(true);
//! let manager = AuditManager::new(&config)?;
//!
//! let event = AuditEvent::new(
//!     EventType::ConnectionStart,
//!     "alice".to_string(),
//!     "session-1".to_string(),
//! );
//!
//! manager.log(event).await;
//! # Ok(())
//! # }
//! ```

pub mod event;
pub mod exporter;
pub mod file;
pub mod transcript;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub use event::{AuditEvent, EventResult, EventType};
pub use exporter::{AuditExporter, MemoryExporter, NullExporter};
pub use file::FileExporter;
pub use transcript::{
    DiscardTranscriptStore, FsTranscriptStore, Transcript, TranscriptSink, TranscriptStore,
};

/// Configuration for the audit system.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Whether audit logging is enabled
    pub enabled: bool,

    /// Buffer size for the event channel
    pub buffer_size: usize,

    /// Maximum events to buffer before flushing
    pub batch_size: usize,

    /// Interval for automatic flush of buffered events
    pub flush_interval_secs: u64,

    /// Exporters to use
    pub exporters: Vec<AuditExporterConfig>,
}

/// Configuration for an audit exporter.
#[derive(Debug, Clone)]
pub enum AuditExporterConfig {
    /// Null exporter (discards events)
    Null,
    /// JSON-lines file exporter
    File {
        /// Path to the audit log file
        path: PathBuf,
    },
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            buffer_size: 1000,
            batch_size: 100,
            flush_interval_secs: 5,
            exporters: vec![AuditExporterConfig::Null],
        }
    }
}

impl AuditConfig {
    /// Create a new audit configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable audit logging.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the buffer size.
    ///
    /// # Panics
    ///
    /// Panics if size is 0.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        assert!(size >= 1, "buffer_size must be at least 1");
        self.buffer_size = size;
        self
    }

    /// Set the batch size.
    ///
    /// # Panics
    ///
    /// Panics if size is 0.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        assert!(size >= 1, "batch_size must be at least 1");
        self.batch_size = size;
        self
    }

    /// Set the flush interval.
    ///
    /// # Panics
    ///
    /// Panics if secs is 0.
    pub fn with_flush_interval(mut self, secs: u64) -> Self {
        assert!(secs >= 1, "flush_interval_secs must be at least 1");
        self.flush_interval_secs = secs;
        self
    }

    /// Set the exporters.
    pub fn with_exporters(mut self, exporters: Vec<AuditExporterConfig>) -> Self {
        self.exporters = exporters;
        self
    }
}

enum WorkerMessage {
    Event(Box<AuditEvent>),
    Sync(oneshot::Sender<()>),
}

/// Manages audit logging with multiple exporters.
///
/// Events are queued to a background worker which batches them and hands
/// them to every exporter.
pub struct AuditManager {
    exporters: Vec<Arc<dyn AuditExporter>>,
    sender: mpsc::Sender<WorkerMessage>,
    enabled: bool,
    worker_handle: Option<JoinHandle<()>>,
}

impl AuditManager {
    /// Create a new audit manager with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any exporter fails to initialize.
    pub fn new(config: &AuditConfig) -> Result<Self> {
        let mut exporters: Vec<Arc<dyn AuditExporter>> = Vec::new();

        for exporter_config in &config.exporters {
            let exporter: Arc<dyn AuditExporter> = match exporter_config {
                AuditExporterConfig::Null => Arc::new(NullExporter::new()),
                AuditExporterConfig::File { path } => Arc::new(FileExporter::new(path)?),
            };
            exporters.push(exporter);
        }

        Ok(Self::with_exporters(config, exporters))
    }

    /// Create a manager around already constructed exporters.
    pub fn with_exporters(config: &AuditConfig, exporters: Vec<Arc<dyn AuditExporter>>) -> Self {
        let (sender, receiver) = mpsc::channel(config.buffer_size);

        let worker_handle = if config.enabled {
            let batch_size = config.batch_size;
            let flush_interval = Duration::from_secs(config.flush_interval_secs);
            Some(tokio::spawn(Self::worker(
                receiver,
                exporters.clone(),
                batch_size,
                flush_interval,
            )))
        } else {
            None
        };

        Self {
            exporters,
            sender,
            enabled: config.enabled,
            worker_handle,
        }
    }

    /// A manager that drops every event.
    pub fn disabled() -> Self {
        Self::with_exporters(&AuditConfig::default(), Vec::new())
    }

    /// Log an audit event.
    ///
    /// If auditing is disabled, this is a no-op.
    pub async fn log(&self, event: AuditEvent) {
        if !self.enabled {
            return;
        }

        if let Err(e) = self.sender.send(WorkerMessage::Event(Box::new(event))).await {
            tracing::warn!("Failed to send audit event: {}", e);
        }
    }

    /// Wait until every event logged before this call reached the exporters.
    pub async fn sync(&self) {
        if !self.enabled {
            return;
        }

        let (tx, rx) = oneshot::channel();
        if self.sender.send(WorkerMessage::Sync(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn worker(
        mut receiver: mpsc::Receiver<WorkerMessage>,
        exporters: Vec<Arc<dyn AuditExporter>>,
        batch_size: usize,
        flush_interval: Duration,
    ) {
        let mut buffer = Vec::with_capacity(batch_size);
        let mut flush_timer = tokio::time::interval(flush_interval);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                message = receiver.recv() => {
                    match message {
                        Some(WorkerMessage::Event(event)) => {
                            buffer.push(*event);
                            if buffer.len() >= batch_size {
                                Self::flush_buffer(&exporters, &mut buffer).await;
                            }
                        }
                        Some(WorkerMessage::Sync(done)) => {
                            Self::flush_buffer(&exporters, &mut buffer).await;
                            let _ = done.send(());
                        }
                        None => {
                            if !buffer.is_empty() {
                                Self::flush_buffer(&exporters, &mut buffer).await;
                            }
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    if !buffer.is_empty() {
                        Self::flush_buffer(&exporters, &mut buffer).await;
                    }
                }
            }
        }

        for exporter in &exporters {
            if let Err(e) = exporter.close().await {
                tracing::error!("Failed to close exporter: {}", e);
            }
        }
    }

    async fn flush_buffer(exporters: &[Arc<dyn AuditExporter>], buffer: &mut Vec<AuditEvent>) {
        if buffer.is_empty() {
            return;
        }
        for exporter in exporters {
            if let Err(e) = exporter.export_batch(buffer).await {
                tracing::error!("Audit export failed: {}", e);
            }
        }
        buffer.clear();
    }

    /// Flush all exporters.
    pub async fn flush(&self) {
        self.sync().await;
        for exporter in &self.exporters {
            if let Err(e) = exporter.flush().await {
                tracing::error!("Audit flush failed: {}", e);
            }
        }
    }

    /// Check if audit logging is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Gracefully shut down the audit manager, draining queued events.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker task panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        drop(self.sender);

        if let Some(handle) = self.worker_handle.take() {
            handle
                .await
                .map_err(|e| anyhow::anyhow!("Worker task panicked: {}", e))?;
        }

        Ok(())
    }
}
