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

//! Cloud inventory: regions and running instances.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::OnceCell;

/// A running instance as reported by the inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instance {
    /// Provider instance identifier.
    pub id: String,
    /// Instance tags.
    pub tags: BTreeMap<String, String>,
    /// Private address, absent until the provider assigns one.
    pub private_ip: Option<String>,
    /// Public address, if any.
    pub public_ip: Option<String>,
}

impl Instance {
    /// Display name taken from the `Name` tag, empty when untagged.
    pub fn display_name(&self) -> &str {
        self.tags.get("Name").map(String::as_str).unwrap_or("")
    }
}

/// Enumerates regions and the running instances in them.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Every region visible to this account.
    async fn regions(&self) -> Result<Vec<String>>;

    /// Running instances in `region`.
    async fn running_instances(&self, region: &str) -> Result<Vec<Instance>>;
}

/// Region list fetched once and then reused.
///
/// A failed fetch is not cached, so the next rebuild retries it.
#[derive(Debug, Default)]
pub struct RegionCache {
    regions: OnceCell<Vec<String>>,
}

impl RegionCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached regions, fetching them from `inventory` on first use.
    pub async fn get_or_fetch(&self, inventory: &dyn Inventory) -> Result<Vec<String>> {
        self.regions
            .get_or_try_init(|| async {
                let regions = inventory.regions().await?;
                tracing::info!(count = regions.len(), "Cached region list");
                Ok::<_, anyhow::Error>(regions)
            })
            .await
            .cloned()
    }
}

#[cfg(feature = "aws")]
pub use self::ec2::Ec2Inventory;

#[cfg(feature = "aws")]
mod ec2 {
    use super::{Instance, Inventory};
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use aws_config::{BehaviorVersion, Region};
    use aws_sdk_ec2::config::Credentials;
    use aws_sdk_ec2::types::Filter;

    /// Region used for account-wide calls such as listing regions.
    const HOME_REGION: &str = "us-west-2";

    /// EC2-backed inventory for one account.
    #[derive(Debug, Clone, Default)]
    pub struct Ec2Inventory {
        credentials: Option<(String, String)>,
    }

    impl Ec2Inventory {
        /// Inventory using the ambient AWS credential chain.
        pub fn from_env() -> Self {
            Self { credentials: None }
        }

        /// Inventory using a static key pair.
        pub fn with_static_credentials(
            access_key_id: impl Into<String>,
            secret_access_key: impl Into<String>,
        ) -> Self {
            Self {
                credentials: Some((access_key_id.into(), secret_access_key.into())),
            }
        }

        async fn client(&self, region: &str) -> aws_sdk_ec2::Client {
            let mut loader =
                aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));

            if let Some((id, secret)) = &self.credentials {
                loader = loader.credentials_provider(Credentials::new(
                    id.clone(),
                    secret.clone(),
                    None,
                    None,
                    "bastion-relay",
                ));
            }

            aws_sdk_ec2::Client::new(&loader.load().await)
        }
    }

    #[async_trait]
    impl Inventory for Ec2Inventory {
        async fn regions(&self) -> Result<Vec<String>> {
            let output = self
                .client(HOME_REGION)
                .await
                .describe_regions()
                .send()
                .await
                .context("DescribeRegions failed")?;

            Ok(output
                .regions()
                .iter()
                .filter_map(|r| r.region_name().map(str::to_string))
                .collect())
        }

        async fn running_instances(&self, region: &str) -> Result<Vec<Instance>> {
            let client = self.client(region).await;
            let mut instances = Vec::new();
            let mut next_token: Option<String> = None;

            loop {
                let output = client
                    .describe_instances()
                    .filters(
                        Filter::builder()
                            .name("instance-state-name")
                            .values("running")
                            .build(),
                    )
                    .set_next_token(next_token.take())
                    .send()
                    .await
                    .with_context(|| format!("DescribeInstances failed in {region}"))?;

                for reservation in output.reservations() {
                    for instance in reservation.instances() {
                        instances.push(Instance {
                            id: instance.instance_id().unwrap_or_default().to_string(),
                            tags: instance
                                .tags()
                                .iter()
                                .filter_map(|t| {
                                    Some((t.key()?.to_string(), t.value()?.to_string()))
                                })
                                .collect(),
                            private_ip: instance.private_ip_address().map(str::to_string),
                            public_ip: instance.public_ip_address().map(str::to_string),
                        });
                    }
                }

                match output.next_token() {
                    Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                    _ => break,
                }
            }

            Ok(instances)
        }
    }
}
