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

//! Integration tests for the server directory: snapshot atomicity under
//! concurrent rebuilds, deterministic choice lists, and refresh backoff.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bastion_relay::server::config::{AclEntry, ServerEntry, UserEntry};
use bastion_relay::server::directory::{
    AccessControl, AccessPolicy, Backoff, DirectoryRegistry, DynamicGroup, Instance, Inventory,
    RefreshError, RefreshScheduler,
};
use regex::Regex;
use tokio_util::sync::CancellationToken;

/// Inventory whose instance set changes on every call, with a pause to
/// widen the window a reader could observe a half-built directory in.
struct ChurningInventory {
    calls: AtomicUsize,
    fail_every: Option<usize>,
}

impl ChurningInventory {
    fn new(fail_every: Option<usize>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_every,
        }
    }
}

fn instance(name: &str, private_ip: &str, public_ip: &str) -> Instance {
    Instance {
        id: format!("i-{name}"),
        tags: BTreeMap::from([("Name".to_string(), name.to_string())]),
        private_ip: Some(private_ip.to_string()),
        public_ip: Some(public_ip.to_string()),
    }
}

#[async_trait]
impl Inventory for ChurningInventory {
    async fn regions(&self) -> Result<Vec<String>> {
        Ok(vec!["us-east-1".to_string(), "eu-west-1".to_string()])
    }

    async fn running_instances(&self, region: &str) -> Result<Vec<Instance>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(n) = self.fail_every {
            if call % n == n - 1 {
                anyhow::bail!("throttled");
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        let count = 1 + call % 4;
        Ok((0..count)
            .map(|i| {
                instance(
                    &format!("web-{region}-{i}"),
                    &format!("10.0.{}.{i}", call % 200),
                    &format!("54.0.{}.{i}", call % 200),
                )
            })
            .collect())
    }
}

fn group(name: &str, inventory: Arc<dyn Inventory>) -> DynamicGroup {
    DynamicGroup {
        name: name.to_string(),
        template: ServerEntry {
            connect_path: "privateip:22".to_string(),
            ..Default::default()
        },
        filter: Regex::new("^web-").unwrap(),
        regions: Vec::new(),
        inventory,
    }
}

fn static_servers(names: &[&str]) -> BTreeMap<String, ServerEntry> {
    names
        .iter()
        .map(|name| {
            (
                name.to_string(),
                ServerEntry {
                    connect_path: format!("{name}.internal:22"),
                    ..Default::default()
                },
            )
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_observe_partial_rebuild() {
    let inventory: Arc<dyn Inventory> = Arc::new(ChurningInventory::new(Some(5)));
    let registry = Arc::new(
        DirectoryRegistry::builder()
            .static_servers(static_servers(&["bastion-a", "bastion-b"]))
            .group(group("web", Arc::clone(&inventory)))
            .region_source(inventory)
            .build(),
    );
    let _ = registry.rebuild().await;

    let writer = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for _ in 0..40 {
                let _ = registry.rebuild().await;
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let registry = Arc::clone(&registry);
        readers.push(tokio::spawn(async move {
            let mut checked = 0;
            for _ in 0..400 {
                let Some(snapshot) = registry.snapshot().await else {
                    continue;
                };
                let members = snapshot.group_members("web");
                for key in &members {
                    assert!(snapshot.lookup(key).is_some(), "member {key} missing from lookup");
                }
                for record in snapshot.records() {
                    if record.origin.as_ref().is_some_and(|o| o.group == "web") {
                        assert!(members.contains(&record.key), "{} not listed", record.key);
                    }
                }
                checked += 1;
                tokio::task::yield_now().await;
            }
            checked
        }));
    }

    writer.await.unwrap();
    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
}

#[tokio::test]
async fn test_choices_are_static_then_sorted_group_members() {
    let inventory: Arc<dyn Inventory> = Arc::new(ChurningInventory::new(None));
    let registry = DirectoryRegistry::builder()
        .static_servers(static_servers(&["zeta", "alpha"]))
        .group(group("web", Arc::clone(&inventory)))
        .region_source(inventory)
        .build();
    registry.rebuild().await.unwrap();

    let policy = AccessPolicy {
        allow_list: vec!["zeta".to_string(), "alpha".to_string()],
        dynamic_groups: vec!["web".to_string()],
    };

    let first = policy.choices(&registry).await;
    let again = policy.choices(&registry).await;
    assert_eq!(first, again);

    assert_eq!(&first[..2], &["zeta".to_string(), "alpha".to_string()]);
    let members = &first[2..];
    assert!(!members.is_empty());
    let mut sorted = members.to_vec();
    sorted.sort();
    assert_eq!(members, sorted.as_slice());
    assert!(members.iter().all(|k| k.contains(" |***| web-")));
}

#[test]
fn test_access_control_resolves_users() {
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
                acl: "missing".to_string(),
                ..Default::default()
            },
        ),
    ]);
    let acls = BTreeMap::from([(
        "ops".to_string(),
        AclEntry {
            allow_list: vec!["hostA".to_string()],
            aws_allow_list: Vec::new(),
        },
    )]);
    let access = AccessControl::new(&users, &acls);

    assert_eq!(access.policy_for("alice").unwrap().allow_list, vec!["hostA"]);
    assert!(access.policy_for("bob").is_err());
    assert!(access.policy_for("mallory").is_err());
}

#[test]
fn test_backoff_doubles_to_cap_and_resets() {
    let mut backoff = Backoff::default();
    assert_eq!(backoff.interval(), Duration::from_secs(120));

    let expected = [240, 480, 960, 960];
    for secs in expected {
        backoff.on_failure();
        assert_eq!(backoff.interval(), Duration::from_secs(secs));
    }
    assert_eq!(backoff.multiplier(), 8);

    backoff.on_success();
    assert_eq!(backoff.interval(), Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_reports_incomplete_refresh() {
    let inventory: Arc<dyn Inventory> = Arc::new(ChurningInventory::new(Some(1)));
    let registry = Arc::new(
        DirectoryRegistry::builder()
            .static_servers(static_servers(&["hostA"]))
            .group(group("web", Arc::clone(&inventory)))
            .region_source(inventory)
            .build(),
    );
    let shutdown = CancellationToken::new();
    let (scheduler, refresh) =
        RefreshScheduler::new(Arc::clone(&registry), Backoff::default(), shutdown.clone());
    let task = scheduler.spawn();

    assert_eq!(refresh.refresh().await, Err(RefreshError::Incomplete(2)));
    // Static entries are still published.
    assert!(registry.lookup("hostA").await.is_some());

    shutdown.cancel();
    task.await.unwrap();
    assert_eq!(refresh.refresh().await, Err(RefreshError::Stopped));
}
