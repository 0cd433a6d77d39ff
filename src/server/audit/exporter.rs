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

//! Audit event exporters.
//!
//! Exporters receive batches from the [`AuditManager`](super::AuditManager)
//! worker. [`NullExporter`] discards everything and [`MemoryExporter`]
//! keeps events in memory so callers can inspect what was recorded.

use super::event::{AuditEvent, EventType};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Trait for audit log exporters.
///
/// Exporters must be thread-safe and should handle errors gracefully;
/// a failing exporter never blocks the relay.
#[async_trait]
pub trait AuditExporter: Send + Sync {
    /// Export a single audit event.
    async fn export(&self, event: AuditEvent) -> Result<()>;

    /// Export multiple events in a batch.
    ///
    /// The default implementation calls `export()` for each event.
    async fn export_batch(&self, events: &[AuditEvent]) -> Result<()> {
        for event in events {
            self.export(event.clone()).await?;
        }
        Ok(())
    }

    /// Flush any buffered events.
    async fn flush(&self) -> Result<()>;

    /// Close the exporter and release resources.
    async fn close(&self) -> Result<()>;
}

/// Null exporter that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NullExporter;

impl NullExporter {
    /// Create a new null exporter.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditExporter for NullExporter {
    async fn export(&self, _event: AuditEvent) -> Result<()> {
        Ok(())
    }

    async fn export_batch(&self, _events: &[AuditEvent]) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Exporter that retains every event in memory.
///
/// Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryExporter {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryExporter {
    /// Create an empty exporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events in arrival order.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Number of recorded events of the given type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| e.event_type == event_type).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl AuditExporter for MemoryExporter {
    async fn export(&self, event: AuditEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("memory exporter lock poisoned"))?
            .push(event);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::audit::event::EventResult;

    #[tokio::test]
    async fn test_null_exporter_discards() {
        let exporter = NullExporter::new();
        let events = vec![
            AuditEvent::new(
                EventType::AuthSuccess,
                "user1".to_string(),
                "session-1".to_string(),
            ),
            AuditEvent::new(
                EventType::AuthFailure,
                "user2".to_string(),
                "session-2".to_string(),
            )
            .with_result(EventResult::Failure),
        ];

        assert!(exporter.export_batch(&events).await.is_ok());
        assert!(exporter.flush().await.is_ok());
        assert!(exporter.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_exporter_records_in_order() {
        let exporter = MemoryExporter::new();
        let shared = exporter.clone();

        exporter
            .export(AuditEvent::new(
                EventType::RelayConnected,
                "alice".to_string(),
                "session-1".to_string(),
            ))
            .await
            .unwrap();
        exporter
            .export_batch(&[AuditEvent::new(
                EventType::RelayDisconnected,
                "alice".to_string(),
                "session-1".to_string(),
            )])
            .await
            .unwrap();

        let events = shared.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RelayConnected);
        assert_eq!(events[1].event_type, EventType::RelayDisconnected);
        assert_eq!(shared.count(EventType::RelayConnected), 1);
        assert_eq!(shared.count(EventType::AuthFailure), 0);
    }
}
