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

//! Server directory: registry, access policy, and background refresh.
//!
//! The [`DirectoryRegistry`] is the only state shared across connections.
//! It is rebuilt exclusively by the [`RefreshScheduler`] and read by any
//! number of sessions through [`AccessPolicy`] and point lookups.

pub mod inventory;
pub mod policy;
pub mod refresh;
pub mod registry;

pub use inventory::{Instance, Inventory, RegionCache};
pub use policy::{AccessControl, AccessPolicy, PolicyError};
pub use refresh::{Backoff, RefreshError, RefreshHandle, RefreshRequest, RefreshScheduler};
pub use registry::{
    instance_key, DirectoryFault, DirectoryRegistry, DirectoryRegistryBuilder, DynamicGroup,
    Origin, RebuildError, ServerRecord, Snapshot,
};

#[cfg(feature = "aws")]
pub use inventory::Ec2Inventory;
