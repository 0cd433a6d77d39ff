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

//! Refresh Scheduler: serialized, backed-off directory rebuilds.
//!
//! A single task consumes [`RefreshRequest`]s. The periodic timer feeds the
//! same path as explicit requests, so at most one rebuild ever runs and the
//! backoff state has exactly one owner.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::DirectoryRegistry;

/// Base refresh interval.
pub const BASE_INTERVAL: Duration = Duration::from_secs(120);

/// Largest backoff multiplier.
pub const MAX_MULTIPLIER: u32 = 8;

/// Exponential backoff for scheduled rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    multiplier: u32,
    cap: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BASE_INTERVAL, MAX_MULTIPLIER)
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: u32) -> Self {
        Self {
            base,
            multiplier: 1,
            cap: cap.max(1),
        }
    }

    /// A rebuild succeeded.
    pub fn on_success(&mut self) {
        self.multiplier = 1;
    }

    /// A rebuild failed.
    pub fn on_failure(&mut self) {
        self.multiplier = (self.multiplier * 2).min(self.cap);
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    /// Time until the next scheduled rebuild.
    pub fn interval(&self) -> Duration {
        self.base * self.multiplier
    }
}

/// Why an explicit refresh did not fully succeed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("refresh scheduler is not running")]
    Stopped,

    #[error("directory rebuild incomplete ({0} fault(s)), previous entries kept")]
    Incomplete(usize),
}

/// One queued rebuild and its completion notifier.
#[derive(Debug)]
pub struct RefreshRequest {
    done: Option<oneshot::Sender<Result<(), RefreshError>>>,
}

/// Cloneable handle for requesting rebuilds.
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    requests: mpsc::Sender<RefreshRequest>,
}

impl RefreshHandle {
    /// Request a rebuild and wait until it has been published.
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(RefreshRequest { done: Some(tx) })
            .await
            .map_err(|_| RefreshError::Stopped)?;
        rx.await.map_err(|_| RefreshError::Stopped)?
    }
}

/// The background rebuild task.
pub struct RefreshScheduler {
    registry: Arc<DirectoryRegistry>,
    backoff: Backoff,
    requests: mpsc::Receiver<RefreshRequest>,
    shutdown: CancellationToken,
    primed: bool,
}

impl RefreshScheduler {
    /// Create the scheduler and its request handle. Nothing runs until
    /// [`Self::spawn`].
    pub fn new(
        registry: Arc<DirectoryRegistry>,
        backoff: Backoff,
        shutdown: CancellationToken,
    ) -> (Self, RefreshHandle) {
        let (tx, rx) = mpsc::channel(16);
        let scheduler = Self {
            registry,
            backoff,
            requests: rx,
            shutdown,
            primed: false,
        };
        (scheduler, RefreshHandle { requests: tx })
    }

    /// Perform the first rebuild in place, so the directory is published
    /// before anything reads it. The spawned loop then starts with the
    /// timer instead of rebuilding again.
    pub async fn prime(&mut self) -> Result<(), RefreshError> {
        let (tx, rx) = oneshot::channel();
        self.handle(RefreshRequest { done: Some(tx) }).await;
        self.primed = true;
        rx.await.map_err(|_| RefreshError::Stopped)?
    }

    /// Run the loop on a background task. Unless [`Self::prime`] already
    /// ran, the first rebuild happens immediately.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!("Refresh scheduler started");
        if !self.primed {
            self.handle(RefreshRequest { done: None }).await;
        }

        loop {
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = tokio::time::sleep(self.backoff.interval()) => {
                    tracing::debug!("Scheduled directory refresh");
                    RefreshRequest { done: None }
                }
            };
            self.handle(request).await;
        }

        tracing::info!("Refresh scheduler stopped");
    }

    async fn handle(&mut self, request: RefreshRequest) {
        let result = match self.registry.rebuild().await {
            Ok(_) => {
                self.backoff.on_success();
                Ok(())
            }
            Err(e) => {
                self.backoff.on_failure();
                for fault in &e.faults {
                    tracing::warn!("{}", fault);
                }
                tracing::warn!(
                    next_in_secs = self.backoff.interval().as_secs(),
                    "Directory refresh failed, backing off"
                );
                Err(RefreshError::Incomplete(e.faults.len()))
            }
        };

        if let Some(done) = request.done {
            // The requester may have gone away.
            let _ = done.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::registry::tests::{group, instance, FakeInventory};
    use super::*;

    #[test]
    fn test_backoff_progression() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.interval(), Duration::from_secs(120));

        backoff.on_failure();
        assert_eq!(backoff.interval(), Duration::from_secs(240));
        backoff.on_failure();
        assert_eq!(backoff.interval(), Duration::from_secs(480));
        backoff.on_failure();
        assert_eq!(backoff.interval(), Duration::from_secs(960));
        backoff.on_failure();
        assert_eq!(backoff.multiplier(), 8);
        assert_eq!(backoff.interval(), Duration::from_secs(960));

        backoff.on_success();
        assert_eq!(backoff.interval(), BASE_INTERVAL);
    }

    fn registry(inventory: Arc<FakeInventory>) -> Arc<DirectoryRegistry> {
        Arc::new(
            DirectoryRegistry::builder()
                .group(group("web", "", &["r1"], inventory))
                .build(),
        )
    }

    #[tokio::test]
    async fn test_explicit_refresh_publishes_before_returning() {
        let inventory = Arc::new(FakeInventory::default());
        let registry = registry(inventory.clone());
        let shutdown = CancellationToken::new();
        let (scheduler, handle) =
            RefreshScheduler::new(registry.clone(), Backoff::default(), shutdown.clone());
        let task = scheduler.spawn();

        handle.refresh().await.unwrap();
        assert!(registry.group_members("web").await.is_empty());

        inventory.set("r1", vec![instance("a", Some("10.0.0.1"), Some("1.1.1.1"))]);
        handle.refresh().await.unwrap();
        assert_eq!(registry.group_members("web").await.len(), 1);

        inventory.fail("r1", true);
        assert_eq!(handle.refresh().await, Err(RefreshError::Incomplete(1)));
        assert_eq!(registry.group_members("web").await.len(), 1);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(handle.refresh().await, Err(RefreshError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_triggers_rebuild() {
        let inventory = Arc::new(FakeInventory::default());
        let registry = registry(inventory.clone());
        let shutdown = CancellationToken::new();
        let (scheduler, _handle) =
            RefreshScheduler::new(registry.clone(), Backoff::default(), shutdown.clone());
        let task = scheduler.spawn();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(registry.snapshot().await.is_some());
        assert!(registry.group_members("web").await.is_empty());

        inventory.set("r1", vec![instance("a", Some("10.0.0.1"), Some("1.1.1.1"))]);
        tokio::time::sleep(BASE_INTERVAL).await;
        assert_eq!(registry.group_members("web").await.len(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prime_publishes_before_spawn() {
        let inventory = Arc::new(FakeInventory::default());
        inventory.set("r1", vec![instance("a", Some("10.0.0.1"), Some("1.1.1.1"))]);
        let registry = registry(inventory.clone());
        let shutdown = CancellationToken::new();
        let (mut scheduler, _handle) =
            RefreshScheduler::new(registry.clone(), Backoff::default(), shutdown.clone());

        assert!(registry.snapshot().await.is_none());
        scheduler.prime().await.unwrap();
        assert_eq!(registry.group_members("web").await.len(), 1);

        // No second rebuild at start; the next one waits for the timer.
        inventory.set("r1", Vec::new());
        let task = scheduler.spawn();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.group_members("web").await.len(), 1);

        tokio::time::sleep(BASE_INTERVAL).await;
        assert!(registry.group_members("web").await.is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_prime_failure_backs_off() {
        let inventory = Arc::new(FakeInventory::default());
        inventory.fail("r1", true);
        let registry = registry(inventory);
        let (mut scheduler, _handle) =
            RefreshScheduler::new(registry.clone(), Backoff::default(), CancellationToken::new());

        assert_eq!(scheduler.prime().await, Err(RefreshError::Incomplete(1)));
        assert!(registry.snapshot().await.is_some());
        assert_eq!(scheduler.backoff.multiplier(), 2);
    }
}
