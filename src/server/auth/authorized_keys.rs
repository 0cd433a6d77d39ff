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

//! OpenSSH `authorized_keys` parsing.
//!
//! Parsing is strict: a malformed line is an error rather than being
//! skipped, because a broken key file is a configuration problem that
//! should not silently narrow who can log in.

use russh::keys::ssh_key::PublicKey;
use thiserror::Error;

/// A line that could not be parsed.
#[derive(Debug, Error)]
#[error("line {line}: {reason}")]
pub struct KeyParseError {
    /// 1-based line number within the parsed text.
    pub line: usize,
    /// What was wrong with it.
    pub reason: String,
}

/// One parsed `authorized_keys` entry.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    /// The public key.
    pub key: PublicKey,
    /// Trailing comment, if present.
    pub comment: Option<String>,
}

/// Iterate over the entries of `content`, skipping blank and `#` lines.
///
/// Entries are parsed lazily so callers can stop at the first match.
pub fn entries(content: &str) -> impl Iterator<Item = Result<AuthorizedKey, KeyParseError>> + '_ {
    content
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                None
            } else {
                Some(parse_line(line).map_err(|reason| KeyParseError {
                    line: index + 1,
                    reason,
                }))
            }
        })
}

/// Parse one `[options] key-type base64 [comment]` line.
fn parse_line(line: &str) -> Result<AuthorizedKey, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    // Options may contain quoted spaces, so locate the key type instead of
    // assuming it sits at index 0 or 1.
    let type_idx = parts
        .iter()
        .position(|part| is_key_type(part))
        .ok_or_else(|| "no recognised key type".to_string())?;

    let key_data = parts
        .get(type_idx + 1)
        .ok_or_else(|| "missing key data".to_string())?;

    let key = russh::keys::parse_public_key_base64(key_data)
        .map_err(|e| format!("invalid {} key: {e}", parts[type_idx]))?;

    let comment = if parts.len() > type_idx + 2 {
        Some(parts[type_idx + 2..].join(" "))
    } else {
        None
    };

    Ok(AuthorizedKey { key, comment })
}

/// Compare two keys by algorithm and encoded key material.
///
/// Comments are ignored.
pub fn keys_match(a: &PublicKey, b: &PublicKey) -> bool {
    a.algorithm() == b.algorithm() && a.key_data() == b.key_data()
}

/// Check if a string looks like a key type.
fn is_key_type(s: &str) -> bool {
    matches!(
        s,
        "ssh-rsa"
            | "ssh-dss"
            | "ssh-ed25519"
            | "ssh-ed448"
            | "ecdsa-sha2-nistp256"
            | "ecdsa-sha2-nistp384"
            | "ecdsa-sha2-nistp521"
            | "sk-ssh-ed25519@openssh.com"
            | "sk-ecdsa-sha2-nistp256@openssh.com"
    )
}
