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

//! Configuration loader for the relay.
//!
//! Configuration is resolved with the following precedence (highest to lowest):
//! 1. Environment variables (`BASTION_*`)
//! 2. Configuration file (YAML)
//! 3. Default values

use super::types::RelayFileConfig;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Load configuration from file and environment.
///
/// If `config_path` is `None`, the first existing file among
/// [`default_config_paths`] is used; without one the defaults apply.
///
/// # Environment Variables
///
/// - `BASTION_LISTEN` - Listen address (e.g., "0.0.0.0:2222")
/// - `BASTION_HOST_KEYS` - Comma-separated host key paths
/// - `BASTION_MOTD_PATH` - Message-of-the-day file
/// - `BASTION_LOG_PATH` - Transcript directory
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if
/// validation fails.
pub fn load_config(config_path: Option<&Path>) -> Result<RelayFileConfig> {
    let mut config = RelayFileConfig::default();

    if let Some(path) = config_path {
        config = load_config_file(path).context("Failed to load configuration file")?;
        tracing::info!(path = %path.display(), "Loaded configuration from file");
    } else {
        for path in default_config_paths() {
            if path.exists() {
                config = load_config_file(&path).context("Failed to load configuration file")?;
                tracing::info!(path = %path.display(), "Loaded configuration from file");
                break;
            }
        }
    }

    config = apply_env_overrides(config);
    validate_config(&config)?;

    Ok(config)
}

/// Generate a documented configuration template.
pub fn generate_config_template() -> String {
    let mut yaml = String::new();

    yaml.push_str("# bastion-relay configuration file\n");
    yaml.push_str("#\n");
    yaml.push_str("# Environment variables (BASTION_LISTEN, BASTION_HOST_KEYS,\n");
    yaml.push_str("# BASTION_MOTD_PATH, BASTION_LOG_PATH) override values below.\n\n");
    yaml.push_str(TEMPLATE_BODY);

    yaml
}

const TEMPLATE_BODY: &str = r#"global:
  listen_path: "0.0.0.0:2222"
  host_keys:
    - /etc/bastion-relay/ssh_host_ed25519_key
  motd_path: /etc/bastion-relay/motd
  # Per-session transcripts are written below this directory.
  log_path: /var/log/bastion-relay
  # JSON-lines audit events.
  audit_log: /var/log/bastion-relay/audit.jsonl
  # "ad" verifies passwords with a directory bind of user@ldap_domain.
  auth_type: ad
  ldap_server: ldaps://dc1.example.com:636
  ldap_domain: example.com
  # Reuse the login password when the target asks for one.
  pass_password: false
  max_auth_attempts: 6
  max_connections: 256

servers:
  db01:
    connect_path: "10.0.0.5:22"
    host_pubkeys:
      - /etc/bastion-relay/hostkeys/db01.pub
    login_user: admin
    login_privatekey: /etc/bastion-relay/keys/db01

awsinstances:
  web:
    # "privateip" and "publicip" are replaced with the instance addresses.
    connect_path: "privateip:22"
    regex: "^web-"
    # Leave empty to enumerate every region.
    regions: [us-east-1]

acls:
  ops:
    allow_list: [db01]
    aws_allow_list: [web]

users:
  alice:
    acl: ops
    authorized_keys_file: /etc/bastion-relay/authorized_keys/alice
"#;

fn load_config_file(path: &Path) -> Result<RelayFileConfig> {
    let content =
        std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;

    serde_yaml::from_str(&content).context(format!("Failed to parse {}", path.display()))
}

/// Default configuration file search paths.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("./bastion-relay.yaml"),
        PathBuf::from("/etc/bastion-relay/config.yaml"),
    ];

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("bastion-relay/config.yaml"));
    }

    paths
}

fn apply_env_overrides(mut config: RelayFileConfig) -> RelayFileConfig {
    if let Ok(addr) = std::env::var("BASTION_LISTEN") {
        tracing::debug!(address = %addr, "Applied BASTION_LISTEN override");
        config.global.listen_path = addr;
    }

    if let Ok(keys) = std::env::var("BASTION_HOST_KEYS") {
        config.global.host_keys = keys
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        tracing::debug!(
            key_count = config.global.host_keys.len(),
            "Applied BASTION_HOST_KEYS override"
        );
    }

    if let Ok(path) = std::env::var("BASTION_MOTD_PATH") {
        tracing::debug!(path = %path, "Applied BASTION_MOTD_PATH override");
        config.global.motd_path = Some(PathBuf::from(path));
    }

    if let Ok(path) = std::env::var("BASTION_LOG_PATH") {
        tracing::debug!(path = %path, "Applied BASTION_LOG_PATH override");
        config.global.log_path = Some(PathBuf::from(path));
    }

    config
}

/// Validate configuration for correctness.
///
/// Problems that only affect individual sessions (a user naming an unknown
/// ACL, an ACL naming an unknown group) are reported as warnings because
/// they are handled per session.
pub fn validate_config(config: &RelayFileConfig) -> Result<()> {
    if config.global.host_keys.is_empty() {
        anyhow::bail!(
            "At least one host key must be configured (global.host_keys or BASTION_HOST_KEYS)"
        );
    }

    config
        .global
        .listen_path
        .parse::<SocketAddr>()
        .context(format!(
            "Invalid listen address in global.listen_path: {}",
            config.global.listen_path
        ))?;

    if config.global.max_connections == 0 {
        anyhow::bail!("global.max_connections must be greater than 0");
    }

    if config.global.uses_directory_auth()
        && (config.global.ldap_server.is_empty() || config.global.ldap_domain.is_empty())
    {
        anyhow::bail!("auth_type 'ad' requires global.ldap_server and global.ldap_domain");
    }

    for (name, group) in &config.awsinstances {
        regex::Regex::new(&group.regex)
            .context(format!("Invalid regex for dynamic group '{name}'"))?;
    }

    for (user, entry) in &config.users {
        if !config.acls.contains_key(&entry.acl) {
            tracing::warn!(user = %user, acl = %entry.acl, "User references an unknown ACL");
        }
    }

    for (acl, entry) in &config.acls {
        for group in &entry.aws_allow_list {
            if !config.awsinstances.contains_key(group) {
                tracing::warn!(acl = %acl, group = %group, "ACL references an unknown dynamic group");
            }
        }
    }

    tracing::info!("Configuration validation passed");
    Ok(())
}
