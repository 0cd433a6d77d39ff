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

//! Directory Registry: selection keys to connection parameters.
//!
//! A rebuild assembles a complete [`Snapshot`] privately, without holding
//! any lock across inventory calls, and then publishes it with a single
//! pointer swap. Readers therefore see either the previous snapshot or the
//! new one, never a mixture.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use super::inventory::{Instance, Inventory, RegionCache};
use crate::server::config::{RelayFileConfig, ServerEntry};

/// Where a discovered record came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    /// Dynamic group name.
    pub group: String,
    /// Region the instance was enumerated in.
    pub region: String,
}

/// Connection parameters for one selectable server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    /// Selection key shown to users.
    pub key: String,
    /// `host:port` to dial.
    pub connect_path: String,
    /// Remote login name override.
    pub login_user: Option<String>,
    /// Private key for logging in to the target.
    pub login_privatekey: Option<PathBuf>,
    /// Host key files the target must match.
    pub host_pubkeys: Vec<PathBuf>,
    /// Dynamic group and region, for discovered records.
    pub origin: Option<Origin>,
}

impl ServerRecord {
    /// Record for a statically configured server.
    pub fn from_entry(key: impl Into<String>, entry: &ServerEntry) -> Self {
        Self {
            key: key.into(),
            connect_path: entry.connect_path.clone(),
            login_user: entry.login_user.clone().filter(|u| !u.is_empty()),
            login_privatekey: entry.login_privatekey.clone(),
            host_pubkeys: entry.host_pubkeys.clone(),
            origin: None,
        }
    }
}

/// Immutable view of the directory.
#[derive(Debug, Default)]
pub struct Snapshot {
    servers: HashMap<String, Arc<ServerRecord>>,
    groups: HashMap<String, Vec<String>>,
}

impl Snapshot {
    /// Point lookup.
    pub fn lookup(&self, key: &str) -> Option<Arc<ServerRecord>> {
        self.servers.get(key).cloned()
    }

    /// Members of a dynamic group, sorted.
    pub fn group_members(&self, group: &str) -> Vec<String> {
        self.groups.get(group).cloned().unwrap_or_default()
    }

    /// Names of all dynamic groups in this snapshot.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Every record, in unspecified order.
    pub fn records(&self) -> impl Iterator<Item = &Arc<ServerRecord>> {
        self.servers.values()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether the snapshot has no records.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// A dynamic group definition.
pub struct DynamicGroup {
    /// Group name referenced by ACLs.
    pub name: String,
    /// Template applied to every matching instance.
    pub template: ServerEntry,
    /// Pattern matched against the instance display name.
    pub filter: Regex,
    /// Explicit regions; empty means the cached global list.
    pub regions: Vec<String>,
    /// Inventory for this group's account.
    pub inventory: Arc<dyn Inventory>,
}

impl std::fmt::Debug for DynamicGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicGroup")
            .field("name", &self.name)
            .field("filter", &self.filter.as_str())
            .field("regions", &self.regions)
            .finish()
    }
}

/// One part of a rebuild that could not be completed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryFault {
    /// The global region list was unavailable for a group without
    /// explicit regions.
    #[error("group {group}: region list unavailable: {error}")]
    Regions { group: String, error: String },

    /// Enumerating one region failed.
    #[error("group {group}: enumeration failed in {region}: {error}")]
    Enumeration {
        group: String,
        region: String,
        error: String,
    },
}

/// A rebuild that published a snapshot with stale parts.
#[derive(Debug, Error)]
#[error("directory rebuild incomplete ({} fault(s))", faults.len())]
pub struct RebuildError {
    /// What could not be refreshed.
    pub faults: Vec<DirectoryFault>,
}

/// Selection key for a discovered instance.
///
/// The shape is relied upon by operators and must stay stable.
pub fn instance_key(region: &str, name: &str, private_ip: &str, public_ip: &str) -> String {
    format!("{region} |***| {name} |***| privateip:{private_ip}, publicip:{public_ip}")
}

/// Apply `template` to `instance`, or `None` if the instance is not relayable.
fn instance_record(
    group: &DynamicGroup,
    region: &str,
    instance: &Instance,
) -> Option<ServerRecord> {
    let name = instance.display_name();
    if !group.filter.is_match(name) {
        return None;
    }

    // Instances can be reported as running before an address is assigned.
    let Some(private_ip) = instance.private_ip.as_deref() else {
        tracing::debug!(instance = %instance.id, group = %group.name, "Instance has no private ip yet");
        return None;
    };

    let Some(public_ip) = instance.public_ip.as_deref() else {
        tracing::info!(instance = %instance.id, group = %group.name, "Instance has no public ip, skipping");
        return None;
    };

    let connect_path = group
        .template
        .connect_path
        .replace("privateip", private_ip)
        .replace("publicip", public_ip);

    let mut record = ServerRecord::from_entry(
        instance_key(region, name, private_ip, public_ip),
        &group.template,
    );
    record.connect_path = connect_path;
    record.origin = Some(Origin {
        group: group.name.clone(),
        region: region.to_string(),
    });
    Some(record)
}

/// Builder for [`DirectoryRegistry`].
#[derive(Default)]
pub struct DirectoryRegistryBuilder {
    static_servers: BTreeMap<String, ServerEntry>,
    groups: Vec<DynamicGroup>,
    region_source: Option<Arc<dyn Inventory>>,
}

impl DirectoryRegistryBuilder {
    /// Set the statically configured servers.
    pub fn static_servers(mut self, servers: BTreeMap<String, ServerEntry>) -> Self {
        self.static_servers = servers;
        self
    }

    /// Add a dynamic group.
    pub fn group(mut self, group: DynamicGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Inventory used to list regions for groups without explicit ones.
    pub fn region_source(mut self, inventory: Arc<dyn Inventory>) -> Self {
        self.region_source = Some(inventory);
        self
    }

    /// Build the registry. No snapshot exists until the first rebuild.
    pub fn build(self) -> DirectoryRegistry {
        DirectoryRegistry {
            static_servers: self.static_servers,
            groups: self.groups,
            region_source: self.region_source,
            region_cache: RegionCache::new(),
            current: RwLock::new(None),
            rebuild_lock: Mutex::new(()),
        }
    }
}

/// The authoritative server directory.
pub struct DirectoryRegistry {
    static_servers: BTreeMap<String, ServerEntry>,
    groups: Vec<DynamicGroup>,
    region_source: Option<Arc<dyn Inventory>>,
    region_cache: RegionCache,
    current: RwLock<Option<Arc<Snapshot>>>,
    rebuild_lock: Mutex<()>,
}

impl DirectoryRegistry {
    /// Start building a registry.
    pub fn builder() -> DirectoryRegistryBuilder {
        DirectoryRegistryBuilder::default()
    }

    /// Registry for a loaded configuration.
    ///
    /// Dynamic groups need cloud inventory support; configuring them in a
    /// build without it is a startup error.
    pub fn from_config(config: &RelayFileConfig) -> anyhow::Result<Self> {
        let builder = Self::builder().static_servers(config.servers.clone());

        if config.awsinstances.is_empty() {
            return Ok(builder.build());
        }

        #[cfg(feature = "aws")]
        {
            use super::inventory::Ec2Inventory;
            use anyhow::Context;

            let mut builder = builder.region_source(Arc::new(Ec2Inventory::from_env()));
            for (name, entry) in &config.awsinstances {
                let filter = Regex::new(&entry.regex)
                    .with_context(|| format!("Invalid regex for dynamic group {name}"))?;
                let inventory: Arc<dyn Inventory> = match entry.static_credentials() {
                    Some((id, secret)) => Arc::new(Ec2Inventory::with_static_credentials(id, secret)),
                    None => Arc::new(Ec2Inventory::from_env()),
                };
                builder = builder.group(DynamicGroup {
                    name: name.clone(),
                    template: entry.server.clone(),
                    filter,
                    regions: entry.regions.clone(),
                    inventory,
                });
            }
            Ok(builder.build())
        }

        #[cfg(not(feature = "aws"))]
        {
            let _ = builder;
            anyhow::bail!(
                "{} dynamic group(s) configured but cloud inventory support is not compiled in (enable the `aws` feature)",
                config.awsinstances.len()
            )
        }
    }

    /// The current snapshot, `None` before the first rebuild.
    pub async fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.current.read().await.clone()
    }

    /// Point lookup against the current snapshot.
    pub async fn lookup(&self, key: &str) -> Option<Arc<ServerRecord>> {
        self.current.read().await.as_ref()?.lookup(key)
    }

    /// Sorted members of a dynamic group in the current snapshot.
    pub async fn group_members(&self, group: &str) -> Vec<String> {
        match self.current.read().await.as_ref() {
            Some(snapshot) => snapshot.group_members(group),
            None => Vec::new(),
        }
    }

    /// Re-derive the whole directory and publish it.
    ///
    /// The new snapshot is always published. Parts that could not be
    /// refreshed keep the entries they had in the previous snapshot and are
    /// reported through [`RebuildError`]. Returns the number of records on
    /// full success.
    pub async fn rebuild(&self) -> Result<usize, RebuildError> {
        let _guard = self.rebuild_lock.lock().await;
        tracing::info!("Directory rebuild started");

        let previous = self.snapshot().await;
        let mut faults = Vec::new();
        let mut servers: HashMap<String, Arc<ServerRecord>> = HashMap::new();
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();

        for (key, entry) in &self.static_servers {
            servers.insert(key.clone(), Arc::new(ServerRecord::from_entry(key, entry)));
        }

        for group in &self.groups {
            let members = groups.entry(group.name.clone()).or_default();

            let regions = if !group.regions.is_empty() {
                group.regions.clone()
            } else {
                match self.global_regions().await {
                    Ok(regions) => regions,
                    Err(error) => {
                        tracing::warn!(group = %group.name, error = %error, "Region list unavailable, keeping previous entries");
                        carry_over(previous.as_deref(), &mut servers, members, |o| {
                            o.group == group.name
                        });
                        faults.push(DirectoryFault::Regions {
                            group: group.name.clone(),
                            error,
                        });
                        continue;
                    }
                }
            };

            for region in &regions {
                match group.inventory.running_instances(region).await {
                    Ok(instances) => {
                        for instance in &instances {
                            if let Some(record) = instance_record(group, region, instance) {
                                insert_record(&mut servers, members, record);
                            }
                        }
                    }
                    Err(e) => {
                        let error = format!("{e:#}");
                        tracing::warn!(group = %group.name, region = %region, error = %error, "Instance enumeration failed, keeping previous entries");
                        carry_over(previous.as_deref(), &mut servers, members, |o| {
                            o.group == group.name && &o.region == region
                        });
                        faults.push(DirectoryFault::Enumeration {
                            group: group.name.clone(),
                            region: region.clone(),
                            error,
                        });
                    }
                }
            }
        }

        for members in groups.values_mut() {
            members.sort();
            members.dedup();
        }

        let count = servers.len();
        let snapshot = Arc::new(Snapshot { servers, groups });
        *self.current.write().await = Some(snapshot);

        tracing::info!(servers = count, faults = faults.len(), "Directory rebuild finished");

        if faults.is_empty() {
            Ok(count)
        } else {
            Err(RebuildError { faults })
        }
    }

    async fn global_regions(&self) -> Result<Vec<String>, String> {
        let source = self
            .region_source
            .as_ref()
            .ok_or_else(|| "no region source configured".to_string())?;
        self.region_cache
            .get_or_fetch(source.as_ref())
            .await
            .map_err(|e| format!("{e:#}"))
    }
}

fn insert_record(
    servers: &mut HashMap<String, Arc<ServerRecord>>,
    members: &mut Vec<String>,
    record: ServerRecord,
) {
    let key = record.key.clone();
    if servers.insert(key.clone(), Arc::new(record)).is_some() {
        tracing::warn!(key = %key, "Duplicate selection key, keeping the latest");
    }
    members.push(key);
}

fn carry_over(
    previous: Option<&Snapshot>,
    servers: &mut HashMap<String, Arc<ServerRecord>>,
    members: &mut Vec<String>,
    matches: impl Fn(&Origin) -> bool,
) {
    let Some(previous) = previous else {
        return;
    };
    for record in previous.records() {
        if record.origin.as_ref().is_some_and(&matches) {
            servers.insert(record.key.clone(), Arc::clone(record));
            members.push(record.key.clone());
        }
    }
}
