//! Direct public-key trust, `known_hosts` style.
//!
//! Roles are bound to exact encoded keys. A key that is not in the store is a
//! `guest`: lookups never reject on their own, the handler decides what a guest
//! may do. Certificate metadata (SAN, CN) plays no part in authorization.
//!
//! ## Authorized keys file
//!
//! ```text
//! # role   key                                                              comment
//! admin    8c0d1f...e3                                                      laptop
//! upstream 04a1b2...ff
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::MeshError;
use crate::identity::EncodedKey;

const GUEST: &str = "guest";

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn guest() -> Self {
        Self(GUEST.to_string())
    }

    pub fn is_guest(&self) -> bool {
        self.0 == GUEST
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Role({})", self.0)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
pub struct TrustStore {
    entries: RwLock<HashMap<EncodedKey, Role>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `key` to `role`, replacing any previous binding.
    pub fn trust(&self, key: EncodedKey, role: Role) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        debug!(key = ?key, role = %role, "trusting key");
        entries.insert(key, role);
    }

    /// Exact key match, `guest` otherwise.
    pub fn authorize(&self, key: &EncodedKey) -> Role {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned().unwrap_or_else(Role::guest)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add every entry from an authorized-keys file. Returns the number added.
    pub fn load(&self, path: &Path) -> Result<usize, MeshError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| MeshError::Config(format!("{}: {}", path.display(), e)))?;
        let parsed = parse_authorized_keys(&contents)
            .map_err(|e| MeshError::Config(format!("{}: {}", path.display(), e)))?;
        let count = parsed.len();
        for (key, role) in parsed {
            self.trust(key, role);
        }
        info!(path = %path.display(), entries = count, "loaded authorized keys");
        Ok(count)
    }
}

impl fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustStore")
            .field("entries", &self.len())
            .finish()
    }
}

/// Parse the authorized-keys text format. The whole input is rejected on the
/// first malformed line.
pub fn parse_authorized_keys(contents: &str) -> Result<Vec<(EncodedKey, Role)>, String> {
    let mut entries = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(role), Some(key)) = (fields.next(), fields.next()) else {
            return Err(format!("line {}: expected `<role> <key>`", index + 1));
        };
        let key = EncodedKey::from_hex(key)
            .map_err(|e| format!("line {}: bad key: {}", index + 1, e))?;
        entries.push((key, Role::new(role)));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn unknown_key_is_guest() {
        let store = TrustStore::new();
        let key = Keypair::generate().encoded_key();
        let role = store.authorize(&key);
        assert_eq!(role, Role::guest());
        assert!(role.is_guest());
    }

    #[test]
    fn exact_key_match_returns_role() {
        let store = TrustStore::new();
        let admin = Keypair::generate().encoded_key();
        let other = Keypair::generate().encoded_key();
        store.trust(admin.clone(), Role::new("admin"));

        assert_eq!(store.authorize(&admin).as_str(), "admin");
        assert!(store.authorize(&other).is_guest());

        store.trust(admin.clone(), Role::new("upstream"));
        assert_eq!(store.authorize(&admin).as_str(), "upstream");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let a = Keypair::generate().encoded_key();
        let b = Keypair::generate().encoded_key();
        let text = format!(
            "# header\n\nadmin {} laptop key\n  upstream {}\n",
            a.to_hex(),
            b.to_hex()
        );
        let entries = parse_authorized_keys(&text).unwrap();
        assert_eq!(
            entries,
            vec![(a, Role::new("admin")), (b, Role::new("upstream"))]
        );
    }

    #[test]
    fn parse_reports_line_number() {
        let err = parse_authorized_keys("# ok\nadmin\n").unwrap_err();
        assert!(err.starts_with("line 2"), "{err}");

        let err = parse_authorized_keys("admin nothex\n").unwrap_err();
        assert!(err.starts_with("line 1"), "{err}");
    }

    #[test]
    fn load_from_file() {
        let key = Keypair::generate().encoded_key();
        let path = std::env::temp_dir().join(format!("meshgate-keys-{}", std::process::id()));
        std::fs::write(&path, format!("admin {}\n", key.to_hex())).unwrap();

        let store = TrustStore::new();
        assert_eq!(store.load(&path).unwrap(), 1);
        assert_eq!(store.authorize(&key).as_str(), "admin");
        let _ = std::fs::remove_file(&path);

        assert!(matches!(store.load(&path), Err(MeshError::Config(_))));
    }
}
