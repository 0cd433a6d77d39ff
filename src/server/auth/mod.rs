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

//! Inbound authentication.
//!
//! - [`CredentialVerifier`]: password and public key checks
//! - [`authorized_keys`]: strict OpenSSH `authorized_keys` parsing
//! - [`DirectoryBind`]: directory password backend (`ldap3` behind the
//!   `ldap` feature)
//! - [`IdentityKeySource`]: keys registered with the cloud provider (IAM
//!   behind the `aws` feature)

pub mod authorized_keys;
pub mod directory;
pub mod identity;
pub mod verifier;

pub use directory::{DirectoryBind, DirectoryError};
pub use identity::IdentityKeySource;
pub use verifier::{AuthFailure, AuthMethodTag, CredentialVerifier, Permission};

#[cfg(feature = "ldap")]
pub use directory::LdapBind;

#[cfg(feature = "aws")]
pub use identity::IamKeySource;
