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

//! Inbound credential verification.
//!
//! Both checks are plain async functions from `(user, credential)` to
//! `Result<Permission, AuthFailure>`. The transport handler decides what a
//! failure means for the connection.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use russh::keys::ssh_key::PublicKey;
use thiserror::Error;
use zeroize::Zeroizing;

use super::authorized_keys::{self, keys_match};
use super::directory::DirectoryBind;
use super::identity::IdentityKeySource;
use crate::server::config::UserEntry;

/// How the inbound user authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethodTag {
    /// Directory password bind.
    Password,
    /// Public key.
    PublicKey,
}

impl AuthMethodTag {
    /// Tag as written to logs and audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethodTag::Password => "password",
            AuthMethodTag::PublicKey => "pk",
        }
    }
}

impl fmt::Display for AuthMethodTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful authentication.
///
/// Password logins carry the password so it can be offered to the target
/// when reuse is enabled. The secret is wiped on drop and never printed.
#[derive(Clone)]
pub struct Permission {
    method: AuthMethodTag,
    secret: Option<Zeroizing<String>>,
}

impl Permission {
    /// Permission granted by a password bind.
    pub fn password(secret: &str) -> Self {
        Self {
            method: AuthMethodTag::Password,
            secret: Some(Zeroizing::new(secret.to_string())),
        }
    }

    /// Permission granted by a public key.
    pub fn public_key() -> Self {
        Self {
            method: AuthMethodTag::PublicKey,
            secret: None,
        }
    }

    /// Method used.
    pub fn method(&self) -> AuthMethodTag {
        self.method
    }

    /// Password supplied at login, for password logins only.
    pub fn reusable_password(&self) -> Option<&str> {
        match self.method {
            AuthMethodTag::Password => self.secret.as_ref().map(|s| s.as_str()),
            AuthMethodTag::PublicKey => None,
        }
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permission")
            .field("method", &self.method)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Why an authentication attempt failed.
#[derive(Debug, Error)]
pub enum AuthFailure {
    /// The user is not configured.
    #[error("unknown user")]
    UnknownUser,

    /// Empty passwords are refused before reaching the directory.
    #[error("empty password")]
    EmptyPassword,

    /// No password backend is configured.
    #[error("password authentication is not available")]
    PasswordUnavailable,

    /// The directory refused the bind or could not be reached.
    #[error("{0}")]
    Directory(#[from] super::directory::DirectoryError),

    /// A key source contained an unparsable entry.
    #[error("malformed authorized key: {0}")]
    MalformedKey(#[from] authorized_keys::KeyParseError),

    /// No candidate key matched.
    #[error("No PKs Match")]
    NoMatch,
}

/// Checks inbound credentials against the configured identity sources.
#[derive(Clone)]
pub struct CredentialVerifier {
    users: Arc<BTreeMap<String, UserEntry>>,
    directory: Option<(Arc<dyn DirectoryBind>, String)>,
    identity_keys: Option<Arc<dyn IdentityKeySource>>,
}

impl CredentialVerifier {
    /// Create a verifier for the given users with no backends attached.
    pub fn new(users: BTreeMap<String, UserEntry>) -> Self {
        Self {
            users: Arc::new(users),
            directory: None,
            identity_keys: None,
        }
    }

    /// Verify passwords by binding to `directory` as `user@domain`.
    pub fn with_directory(mut self, directory: Arc<dyn DirectoryBind>, domain: impl Into<String>) -> Self {
        self.directory = Some((directory, domain.into()));
        self
    }

    /// Also accept keys registered for the user's cloud identity.
    pub fn with_identity_keys(mut self, source: Arc<dyn IdentityKeySource>) -> Self {
        self.identity_keys = Some(source);
        self
    }

    /// Whether password authentication can succeed at all.
    pub fn supports_password(&self) -> bool {
        self.directory.is_some()
    }

    /// Look up a configured user.
    pub fn identity(&self, user: &str) -> Option<&UserEntry> {
        self.users.get(user)
    }

    /// Verify a password login.
    pub async fn verify_password(&self, user: &str, password: &str) -> Result<Permission, AuthFailure> {
        if !self.users.contains_key(user) {
            return Err(AuthFailure::UnknownUser);
        }

        // Some directories treat an empty password as an anonymous bind
        // and report success.
        if password.is_empty() {
            return Err(AuthFailure::EmptyPassword);
        }

        let (directory, domain) = self
            .directory
            .as_ref()
            .ok_or(AuthFailure::PasswordUnavailable)?;

        directory.bind(&format!("{user}@{domain}"), password).await?;

        Ok(Permission::password(password))
    }

    /// Verify a public key login.
    ///
    /// Candidates come from the user's authorized keys file followed by the
    /// keys registered for their cloud identity. A source that cannot be
    /// read is logged and skipped, so the other still applies. The first
    /// match wins; a malformed candidate reached before any match fails the
    /// attempt.
    pub async fn verify_publickey(&self, user: &str, key: &PublicKey) -> Result<Permission, AuthFailure> {
        let identity = self.users.get(user).ok_or(AuthFailure::UnknownUser)?;

        let mut candidates = String::new();

        if let Some(path) = &identity.authorized_keys_file {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    candidates.push_str(&content);
                    candidates.push('\n');
                }
                Err(e) => tracing::warn!(
                    user = %user,
                    path = %path.display(),
                    error = %e,
                    "Unable to read authorized keys file"
                ),
            }
        }

        if let (Some(cloud_user), Some(source)) = (&identity.awsuser, &self.identity_keys) {
            match source.public_keys(cloud_user).await {
                Ok(keys) => {
                    for line in keys {
                        candidates.push_str(&line);
                        candidates.push('\n');
                    }
                }
                Err(e) => tracing::warn!(
                    user = %user,
                    identity = %cloud_user,
                    error = %format!("{e:#}"),
                    "Unable to read authorized keys for cloud identity"
                ),
            }
        }

        for entry in authorized_keys::entries(&candidates) {
            if keys_match(&entry?.key, key) {
                return Ok(Permission::public_key());
            }
        }

        Err(AuthFailure::NoMatch)
    }
}

#[cfg(test)]
mod tests {
    use super::super::authorized_keys::tests::{key, ED25519_A, ED25519_B};
    use super::super::directory::DirectoryError;
    use super::*;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    #[derive(Default)]
    struct RecordingDirectory {
        accept: bool,
        principals: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DirectoryBind for RecordingDirectory {
        async fn bind(&self, principal: &str, _password: &str) -> Result<(), DirectoryError> {
            self.principals.lock().unwrap().push(principal.to_string());
            if self.accept {
                Ok(())
            } else {
                Err(DirectoryError::Rejected("invalid credentials".to_string()))
            }
        }
    }

    struct StaticKeys(Vec<String>);

    #[async_trait]
    impl IdentityKeySource for StaticKeys {
        async fn public_keys(&self, _identity: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    fn users(entries: &[(&str, UserEntry)]) -> BTreeMap<String, UserEntry> {
        entries
            .iter()
            .map(|(name, entry)| (name.to_string(), entry.clone()))
            .collect()
    }

    fn key_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_password_binds_with_domain() {
        let directory = Arc::new(RecordingDirectory {
            accept: true,
            ..Default::default()
        });
        let verifier = CredentialVerifier::new(users(&[("alice", UserEntry::default())]))
            .with_directory(directory.clone(), "corp.example.com");

        let permission = verifier.verify_password("alice", "s3cret").await.unwrap();

        assert_eq!(permission.method(), AuthMethodTag::Password);
        assert_eq!(permission.reusable_password(), Some("s3cret"));
        assert_eq!(
            *directory.principals.lock().unwrap(),
            vec!["alice@corp.example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_password_rejections() {
        let directory = Arc::new(RecordingDirectory::default());
        let verifier = CredentialVerifier::new(users(&[("alice", UserEntry::default())]))
            .with_directory(directory.clone(), "corp");

        assert!(matches!(
            verifier.verify_password("mallory", "pw").await,
            Err(AuthFailure::UnknownUser)
        ));
        assert!(matches!(
            verifier.verify_password("alice", "").await,
            Err(AuthFailure::EmptyPassword)
        ));
        assert!(matches!(
            verifier.verify_password("alice", "wrong").await,
            Err(AuthFailure::Directory(DirectoryError::Rejected(_)))
        ));
        // Unknown user and empty password never reach the directory
        assert_eq!(directory.principals.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_password_without_backend() {
        let verifier = CredentialVerifier::new(users(&[("alice", UserEntry::default())]));
        assert!(!verifier.supports_password());
        assert!(matches!(
            verifier.verify_password("alice", "pw").await,
            Err(AuthFailure::PasswordUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_publickey_from_file() {
        let file = key_file(&format!("# alice\n{ED25519_A} alice@laptop\n"));
        let entry = UserEntry {
            authorized_keys_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let verifier = CredentialVerifier::new(users(&[("alice", entry)]));

        let permission = verifier
            .verify_publickey("alice", &key(ED25519_A))
            .await
            .unwrap();
        assert_eq!(permission.method(), AuthMethodTag::PublicKey);
        assert!(permission.reusable_password().is_none());

        assert!(matches!(
            verifier.verify_publickey("alice", &key(ED25519_B)).await,
            Err(AuthFailure::NoMatch)
        ));
    }

    #[tokio::test]
    async fn test_publickey_from_cloud_identity() {
        let entry = UserEntry {
            awsuser: Some("alice.iam".to_string()),
            ..Default::default()
        };
        let verifier = CredentialVerifier::new(users(&[("alice", entry)]))
            .with_identity_keys(Arc::new(StaticKeys(vec![ED25519_B.to_string()])));

        assert!(verifier
            .verify_publickey("alice", &key(ED25519_B))
            .await
            .is_ok());
    }

    struct UnreachableKeys;

    #[async_trait]
    impl IdentityKeySource for UnreachableKeys {
        async fn public_keys(&self, _identity: &str) -> anyhow::Result<Vec<String>> {
            anyhow::bail!("iam throttled")
        }
    }

    #[tokio::test]
    async fn test_cloud_key_outage_falls_back_to_local_keys() {
        let file = key_file(&format!("{ED25519_A}\n"));
        let entry = UserEntry {
            authorized_keys_file: Some(file.path().to_path_buf()),
            awsuser: Some("alice.iam".to_string()),
            ..Default::default()
        };
        let verifier = CredentialVerifier::new(users(&[("alice", entry)]))
            .with_identity_keys(Arc::new(UnreachableKeys));

        let permission = verifier
            .verify_publickey("alice", &key(ED25519_A))
            .await
            .unwrap();
        assert_eq!(permission.method(), AuthMethodTag::PublicKey);

        assert!(matches!(
            verifier.verify_publickey("alice", &key(ED25519_B)).await,
            Err(AuthFailure::NoMatch)
        ));
    }

    #[tokio::test]
    async fn test_missing_key_file_falls_back_to_cloud_keys() {
        let entry = UserEntry {
            authorized_keys_file: Some("/nonexistent/authorized_keys".into()),
            awsuser: Some("alice.iam".to_string()),
            ..Default::default()
        };
        let verifier = CredentialVerifier::new(users(&[("alice", entry)]))
            .with_identity_keys(Arc::new(StaticKeys(vec![ED25519_B.to_string()])));

        assert!(verifier
            .verify_publickey("alice", &key(ED25519_B))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_malformed_candidate_fails_hard() {
        let file = key_file(&format!("ssh-ed25519 garbage!!\n{ED25519_A}\n"));
        let entry = UserEntry {
            authorized_keys_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let verifier = CredentialVerifier::new(users(&[("alice", entry)]));

        assert!(matches!(
            verifier.verify_publickey("alice", &key(ED25519_A)).await,
            Err(AuthFailure::MalformedKey(_))
        ));
    }

    #[tokio::test]
    async fn test_publickey_no_candidates() {
        let verifier = CredentialVerifier::new(users(&[("alice", UserEntry::default())]));
        assert!(matches!(
            verifier.verify_publickey("alice", &key(ED25519_A)).await,
            Err(AuthFailure::NoMatch)
        ));
        assert!(matches!(
            verifier.verify_publickey("bob", &key(ED25519_A)).await,
            Err(AuthFailure::UnknownUser)
        ));
    }

    #[test]
    fn test_permission_debug_redacts_secret() {
        let permission = Permission::password("hunter2");
        let rendered = format!("{permission:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("redacted"));
    }
}
