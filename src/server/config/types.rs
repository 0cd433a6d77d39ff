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

//! Configuration types for the relay.
//!
//! The schema keeps the key names used by existing bastion deployments so
//! that a config file written for them loads unchanged.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root of the YAML configuration file.
///
/// # Example YAML
///
/// ```yaml
/// global:
///   listen_path: "0.0.0.0:2222"
///   host_keys:
///     - /etc/bastion-relay/ssh_host_ed25519_key
///   auth_type: ad
///   ldap_server: ldaps://dc1.example.com:636
///   ldap_domain: example.com
///   pass_password: true
///
/// servers:
///   db01:
///     connect_path: "10.0.0.5:22"
///     host_pubkeys: ["/etc/bastion-relay/hostkeys/db01.pub"]
///
/// awsinstances:
///   web:
///     connect_path: "privateip:22"
///     regex: "^web-"
///     regions: ["us-east-1"]
///
/// acls:
///   ops:
///     allow_list: ["db01"]
///     aws_allow_list: ["web"]
///
/// users:
///   alice:
///     acl: ops
///     authorized_keys_file: /etc/bastion-relay/keys/alice
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RelayFileConfig {
    /// Process-wide settings.
    pub global: GlobalSettings,

    /// Statically configured servers keyed by selection key.
    pub servers: BTreeMap<String, ServerEntry>,

    /// Dynamic groups expanded from the cloud inventory, keyed by group name.
    #[serde(alias = "aws_instances")]
    pub awsinstances: BTreeMap<String, DynamicGroupEntry>,

    /// Access lists keyed by ACL name.
    pub acls: BTreeMap<String, AclEntry>,

    /// Known users keyed by login name.
    pub users: BTreeMap<String, UserEntry>,
}

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Path of the message-of-the-day file shown after login.
    pub motd_path: Option<PathBuf>,

    /// Directory receiving per-session transcripts.
    pub log_path: Option<PathBuf>,

    /// Host private keys presented to clients.
    pub host_keys: Vec<PathBuf>,

    /// Password backend selection. `ad` binds against the directory server.
    pub auth_type: String,

    /// Directory server URL, e.g. `ldaps://dc1.example.com:636`.
    pub ldap_server: String,

    /// Domain appended to the login name for directory binds.
    pub ldap_domain: String,

    /// Reuse the inbound password when authenticating to the target.
    pub pass_password: bool,

    /// Address to listen on.
    ///
    /// Default: "0.0.0.0:2222"
    pub listen_path: String,

    /// JSON-lines audit log file.
    pub audit_log: Option<PathBuf>,

    /// Maximum authentication attempts per connection.
    ///
    /// Default: 6
    pub max_auth_attempts: u32,

    /// Maximum number of concurrent inbound connections.
    ///
    /// Default: 256
    pub max_connections: usize,

    /// Inactivity timeout for inbound connections in seconds, 0 disables it.
    pub inactivity_timeout_secs: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            motd_path: None,
            log_path: None,
            host_keys: Vec::new(),
            auth_type: String::new(),
            ldap_server: String::new(),
            ldap_domain: String::new(),
            pass_password: false,
            listen_path: default_listen_path(),
            audit_log: None,
            max_auth_attempts: 6,
            max_connections: 256,
            inactivity_timeout_secs: 0,
        }
    }
}

fn default_listen_path() -> String {
    "0.0.0.0:2222".to_string()
}

impl GlobalSettings {
    /// Whether password verification goes to the directory server.
    pub fn uses_directory_auth(&self) -> bool {
        self.auth_type.eq_ignore_ascii_case("ad") || self.auth_type.eq_ignore_ascii_case("ldap")
    }
}

/// Connection parameters for one target server.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ServerEntry {
    /// Public key files the target must present. Empty accepts any host key.
    #[serde(rename = "host_pubkeys")]
    pub host_pubkeys: Vec<PathBuf>,

    /// `host:port` to dial. Dynamic groups may use the `privateip` and
    /// `publicip` placeholders.
    pub connect_path: String,

    /// Remote login name. Defaults to the inbound user.
    pub login_user: Option<String>,

    /// Private key used to log in to the target.
    #[serde(rename = "login_privatekey")]
    pub login_privatekey: Option<PathBuf>,
}

/// A dynamic group: a server template applied to every matching instance.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DynamicGroupEntry {
    /// Template for every discovered instance.
    #[serde(flatten)]
    pub server: ServerEntry,

    /// Pattern matched against the instance `Name` tag.
    pub regex: String,

    /// Regions to enumerate. Empty means every region.
    pub regions: Vec<String>,

    /// Static access key for this group's account.
    #[serde(rename = "AWS_ACCESS_KEY_ID", skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,

    /// Static secret key for this group's account.
    #[serde(
        rename = "AWS_SECRET_ACCESS_KEY",
        skip_serializing_if = "Option::is_none"
    )]
    pub secret_access_key: Option<String>,
}

impl DynamicGroupEntry {
    /// Static credentials, when both halves are configured.
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                Some((id.as_str(), secret.as_str()))
            }
            _ => None,
        }
    }
}

/// An access list.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AclEntry {
    /// Statically allowed selection keys, in display order.
    pub allow_list: Vec<String>,

    /// Dynamic groups whose current members are allowed.
    pub aws_allow_list: Vec<String>,
}

/// A known user.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct UserEntry {
    /// Name of the ACL governing this user.
    pub acl: String,

    /// OpenSSH authorized_keys file for public key logins.
    pub authorized_keys_file: Option<PathBuf>,

    /// Cloud identity whose registered SSH keys are also accepted.
    pub awsuser: Option<String>,
}
