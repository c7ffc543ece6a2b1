//! Credentials sink (spec.md §4.10, §6 (ii)).
//!
//! Consumed by `AuthFilter` (HTTP Basic auth) and both SOCKS engines
//! (SOCKS4 `userExists`, SOCKS5 RFC 1929 user/pass). Password comparison
//! is constant-time over UTF-8 bytes so a timing side channel can't leak
//! how many leading bytes of a guess were correct.

use std::collections::HashMap;
use std::sync::RwLock;

use base64::Engine as _;

pub trait CredentialsSink: Send + Sync {
    /// Validates an HTTP `Authorization: Basic <b64>` header value
    /// (the full header including the `Basic ` prefix).
    fn authenticate_basic(&self, header: &str) -> bool;
    fn authenticate(&self, user: &str, pass: &str) -> bool;
    fn user_exists(&self, user: &str) -> bool;
}

/// Built from any of the three sources spec.md §6 names: an inline list,
/// a directory of one-file-per-user, or a `u1:p1,u2:p2` environment
/// variable. Reload is an atomic swap of the whole map so a reader never
/// observes a half-updated table.
pub struct StaticCredentials {
    users: RwLock<HashMap<String, String>>,
}

impl StaticCredentials {
    pub fn from_map(users: HashMap<String, String>) -> Self {
        StaticCredentials {
            users: RwLock::new(users),
        }
    }

    /// Loads `{username -> password}` from a directory where each
    /// filename is a username and the file's content is the password.
    /// Dotfiles are ignored.
    pub fn from_directory(dir: &std::path::Path) -> std::io::Result<Self> {
        let mut users = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let password = std::fs::read_to_string(entry.path())?;
            users.insert(name.trim_end().to_string(), password.trim_end().to_string());
        }
        Ok(StaticCredentials::from_map(users))
    }

    /// Parses `u1:p1,u2:p2,...` from an environment variable's value.
    pub fn from_env_value(value: &str) -> Self {
        let mut users = HashMap::new();
        for pair in value.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            if let Some((user, pass)) = pair.split_once(':') {
                users.insert(user.to_string(), pass.to_string());
            }
        }
        StaticCredentials::from_map(users)
    }

    /// Atomically replaces the whole credentials table.
    pub fn reload(&self, users: HashMap<String, String>) {
        *self.users.write().unwrap() = users;
    }
}

impl CredentialsSink for StaticCredentials {
    fn authenticate_basic(&self, header: &str) -> bool {
        let Some(encoded) = header.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, pass)) = decoded.split_once(':') else {
            return false;
        };
        self.authenticate(user, pass)
    }

    fn authenticate(&self, user: &str, pass: &str) -> bool {
        let users = self.users.read().unwrap();
        match users.get(user) {
            Some(expected) => constant_time_eq(expected.as_bytes(), pass.as_bytes()),
            None => false,
        }
    }

    fn user_exists(&self, user: &str) -> bool {
        self.users.read().unwrap().contains_key(user)
    }
}

/// Constant-time byte comparison: always walks the longer of the two
/// lengths so the only thing measurable from timing is that the lengths
/// were read, never which byte differed.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let max = a.len().max(b.len());
    let mut diff: u8 = (a.len() != b.len()) as u8;
    for i in 0..max {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}
