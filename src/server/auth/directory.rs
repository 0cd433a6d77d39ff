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

//! Directory (LDAP / Active Directory) password verification.

use async_trait::async_trait;
use thiserror::Error;

/// Why a directory bind did not succeed.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The directory answered and refused the credentials.
    #[error("bind rejected: {0}")]
    Rejected(String),

    /// The directory could not be reached or answered unexpectedly.
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// A directory service that can check a password with a simple bind.
#[async_trait]
pub trait DirectoryBind: Send + Sync {
    /// Bind as `principal` (already qualified, e.g. `alice@corp.example.com`).
    async fn bind(&self, principal: &str, password: &str) -> Result<(), DirectoryError>;
}

#[cfg(feature = "ldap")]
pub use self::ldap::LdapBind;

#[cfg(feature = "ldap")]
mod ldap {
    use super::{DirectoryBind, DirectoryError};
    use async_trait::async_trait;
    use ldap3::{LdapConnAsync, LdapConnSettings};
    use std::time::Duration;

    /// Simple-bind verifier backed by `ldap3`.
    #[derive(Debug, Clone)]
    pub struct LdapBind {
        url: String,
        timeout: Duration,
    }

    impl LdapBind {
        /// Create a verifier for the directory at `url`.
        pub fn new(url: impl Into<String>) -> Self {
            Self {
                url: url.into(),
                timeout: Duration::from_secs(10),
            }
        }
    }

    #[async_trait]
    impl DirectoryBind for LdapBind {
        async fn bind(&self, principal: &str, password: &str) -> Result<(), DirectoryError> {
            let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
            let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.url)
                .await
                .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            ldap3::drive!(conn);

            let outcome = ldap
                .simple_bind(principal, password)
                .await
                .map_err(|e| DirectoryError::Unavailable(e.to_string()))?
                .success()
                .map(|_| ())
                .map_err(|e| DirectoryError::Rejected(e.to_string()));

            if let Err(e) = ldap.unbind().await {
                tracing::debug!(error = %e, "LDAP unbind failed");
            }

            outcome
        }
    }
}
