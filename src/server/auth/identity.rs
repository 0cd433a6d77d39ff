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

//! Public keys registered for a user with the cloud provider.

use anyhow::Result;
use async_trait::async_trait;

/// Source of SSH public keys registered for a cloud identity.
#[async_trait]
pub trait IdentityKeySource: Send + Sync {
    /// Keys registered for `identity`, one `authorized_keys` line each.
    async fn public_keys(&self, identity: &str) -> Result<Vec<String>>;
}

#[cfg(feature = "aws")]
pub use self::iam::IamKeySource;

#[cfg(feature = "aws")]
mod iam {
    use super::IdentityKeySource;
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use aws_sdk_iam::types::EncodingType;

    /// Lists keys uploaded to IAM for a user.
    #[derive(Debug, Clone)]
    pub struct IamKeySource {
        client: aws_sdk_iam::Client,
    }

    impl IamKeySource {
        /// Build a source using the ambient AWS credential chain.
        pub async fn from_env() -> Self {
            let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .load()
                .await;
            Self {
                client: aws_sdk_iam::Client::new(&config),
            }
        }
    }

    #[async_trait]
    impl IdentityKeySource for IamKeySource {
        async fn public_keys(&self, identity: &str) -> Result<Vec<String>> {
            let listed = self
                .client
                .list_ssh_public_keys()
                .user_name(identity)
                .send()
                .await
                .with_context(|| format!("Failed to list IAM SSH keys for {identity}"))?;

            let mut keys = Vec::new();
            for meta in listed.ssh_public_keys() {
                let fetched = self
                    .client
                    .get_ssh_public_key()
                    .user_name(identity)
                    .ssh_public_key_id(meta.ssh_public_key_id())
                    .encoding(EncodingType::Ssh)
                    .send()
                    .await;

                // One unreadable key does not hide the others.
                match fetched {
                    Ok(fetched) => {
                        if let Some(key) = fetched.ssh_public_key() {
                            keys.push(key.ssh_public_key_body().to_string());
                        }
                    }
                    Err(e) => tracing::warn!(
                        identity = %identity,
                        key_id = %meta.ssh_public_key_id(),
                        error = %e,
                        "Failed to fetch IAM SSH key"
                    ),
                }
            }

            tracing::debug!(identity = %identity, count = keys.len(), "Fetched IAM SSH keys");
            Ok(keys)
        }
    }
}
