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

//! Access Policy: which servers a user may choose from.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use super::registry::{DirectoryRegistry, Snapshot};
use crate::server::config::{AclEntry, UserEntry};

/// Named set of permitted servers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    /// Static selection keys, in configured order.
    pub allow_list: Vec<String>,
    /// Dynamic groups whose members are all permitted.
    pub dynamic_groups: Vec<String>,
}

impl From<&AclEntry> for AccessPolicy {
    fn from(entry: &AclEntry) -> Self {
        Self {
            allow_list: entry.allow_list.clone(),
            dynamic_groups: entry.aws_allow_list.clone(),
        }
    }
}

impl AccessPolicy {
    /// Ordered choice list: the allow list as configured, then each dynamic
    /// group's members in sorted order. Deterministic for a given snapshot.
    pub fn server_choices(&self, snapshot: Option<&Snapshot>) -> Vec<String> {
        let mut choices = self.allow_list.clone();
        if let Some(snapshot) = snapshot {
            for group in &self.dynamic_groups {
                choices.extend(snapshot.group_members(group));
            }
        }
        choices
    }

    /// [`Self::server_choices`] against the registry's current snapshot.
    pub async fn choices(&self, registry: &DirectoryRegistry) -> Vec<String> {
        let snapshot = registry.snapshot().await;
        self.server_choices(snapshot.as_deref())
    }
}

/// Why a user has no usable policy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// The user is not configured at all.
    #[error("User has no permitted remote hosts.")]
    UnknownUser,

    /// The user references an ACL that does not exist.
    #[error("Error processing server selection (Invalid ACL).")]
    UnknownAcl { user: String, acl: String },
}

/// Users to ACL names, ACL names to policies.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    users: BTreeMap<String, String>,
    acls: BTreeMap<String, Arc<AccessPolicy>>,
}

impl AccessControl {
    pub fn new(users: &BTreeMap<String, UserEntry>, acls: &BTreeMap<String, AclEntry>) -> Self {
        Self {
            users: users
                .iter()
                .map(|(name, entry)| (name.clone(), entry.acl.clone()))
                .collect(),
            acls: acls
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::new(AccessPolicy::from(entry))))
                .collect(),
        }
    }

    /// Resolve the policy for `user`.
    pub fn policy_for(&self, user: &str) -> Result<Arc<AccessPolicy>, PolicyError> {
        let acl = self.users.get(user).ok_or(PolicyError::UnknownUser)?;
        match self.acls.get(acl) {
            Some(policy) => Ok(Arc::clone(policy)),
            None => {
                tracing::error!(user = %user, acl = %acl, "Invalid ACL detected for user {}.", user);
                Err(PolicyError::UnknownAcl {
                    user: user.to_string(),
                    acl: acl.clone(),
                })
            }
        }
    }
}
