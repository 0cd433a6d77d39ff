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

//! Pinned host keys for relay targets.

use std::path::{Path, PathBuf};

use russh::keys::PublicKey;

use crate::server::auth::authorized_keys::{entries, keys_match};

/// Host keys a relay target must present.
///
/// A target with no key files configured accepts any host key. That keeps
/// such targets reachable but offers no protection against an interposed
/// host, so pinning should be configured for every production target.
#[derive(Debug, Clone, Default)]
pub struct PinnedHostKeys {
    keys: Vec<(PathBuf, PublicKey)>,
    configured: bool,
}

impl PinnedHostKeys {
    /// Load the first key from each file.
    ///
    /// Files that cannot be read or parsed are skipped with a warning, so a
    /// broken file narrows the accepted set instead of widening it. If every
    /// file is broken, nothing is accepted.
    pub fn load(paths: &[PathBuf], remote: &str) -> Self {
        let mut keys = Vec::new();
        for path in paths {
            match load_key(path) {
                Ok(key) => keys.push((path.clone(), key)),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    remote = %remote,
                    error = %e,
                    "Skipping unusable host key file"
                ),
            }
        }
        Self {
            keys,
            configured: !paths.is_empty(),
        }
    }

    pub fn from_keys(keys: impl IntoIterator<Item = PublicKey>) -> Self {
        let keys: Vec<_> = keys.into_iter().map(|k| (PathBuf::new(), k)).collect();
        Self {
            configured: !keys.is_empty(),
            keys,
        }
    }

    /// Whether host key checking applies.
    pub fn is_pinned(&self) -> bool {
        self.configured
    }

    /// Whether `presented` is acceptable.
    pub fn accepts(&self, presented: &PublicKey) -> bool {
        if !self.configured {
            return true;
        }
        match self.keys.iter().find(|(_, key)| keys_match(key, presented)) {
            Some((path, _)) => {
                tracing::debug!(path = %path.display(), "Accepted pinned host key");
                true
            }
            None => false,
        }
    }
}

fn load_key(path: &Path) -> anyhow::Result<PublicKey> {
    let content = std::fs::read_to_string(path)?;
    let entry = entries(&content)
        .next()
        .ok_or_else(|| anyhow::anyhow!("no key found"))??;
    Ok(entry.key)
}
