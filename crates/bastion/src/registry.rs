//! Process-wide token -> guard map and scope handles.

use std::fmt;
use std::sync::Arc;

use bastion_contracts::GUARD_TOKEN_LEN;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

use crate::guard::{ResourceGuard, ResourceLimits};

static GUARDS: Lazy<DashMap<GuardToken, Arc<ResourceGuard>>> = Lazy::new(DashMap::new);

/// Identifies one rewritten program and therefore one guard.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuardToken([u8; GUARD_TOKEN_LEN]);

impl GuardToken {
    pub fn from_bytes(bytes: [u8; GUARD_TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// First bytes of a SHA-256 over the given parts, each length-prefixed.
    pub fn derive(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; GUARD_TOKEN_LEN];
        bytes.copy_from_slice(&digest[..GUARD_TOKEN_LEN]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; GUARD_TOKEN_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(GUARD_TOKEN_LEN * 2);
        for b in self.0 {
            out.push(char::from(HEX[usize::from(b >> 4)]));
            out.push(char::from(HEX[usize::from(b & 0x0f)]));
        }
        out
    }

    /// Parses the lowercase or uppercase hex form; `None` on any malformed input.
    pub fn parse_hex(text: &str) -> Option<Self> {
        let raw = text.as_bytes();
        if raw.len() != GUARD_TOKEN_LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; GUARD_TOKEN_LEN];
        for (i, pair) in raw.chunks_exact(2).enumerate() {
            bytes[i] = (nibble(pair[0])? << 4) | nibble(pair[1])?;
        }
        Some(Self(bytes))
    }

    /// The guard for this token, created on first use.
    pub fn guard(&self) -> Arc<ResourceGuard> {
        if let Some(existing) = GUARDS.get(self) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            GUARDS
                .entry(*self)
                .or_insert_with(|| Arc::new(ResourceGuard::new()))
                .value(),
        )
    }

    /// Activates the guard with fresh counters until the returned scope is dropped.
    pub fn open_scope(&self, limits: ResourceLimits) -> GuardScope {
        let guard = self.guard();
        guard.activate(limits);
        GuardScope {
            token: *self,
            guard,
        }
    }
}

const HEX: &[u8; 16] = b"0123456789abcdef";

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for GuardToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for GuardToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuardToken({})", self.to_hex())
    }
}

/// Open scope for one token. Dropping it deactivates the guard and disposes tracked items.
///
/// Scopes for the same token must not overlap: opening a second one resets the counters
/// the first relies on.
#[must_use = "the guard is deactivated as soon as the scope is dropped"]
pub struct GuardScope {
    token: GuardToken,
    guard: Arc<ResourceGuard>,
}

impl GuardScope {
    pub fn token(&self) -> GuardToken {
        self.token
    }

    pub fn guard(&self) -> &Arc<ResourceGuard> {
        &self.guard
    }
}

impl Drop for GuardScope {
    fn drop(&mut self) {
        self.guard.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardError;

    #[test]
    fn hex_round_trip_and_rejects_garbage() {
        let token = GuardToken::derive(&[b"program", b"settings"]);
        let hex = token.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(GuardToken::parse_hex(&hex), Some(token));
        assert_eq!(GuardToken::parse_hex(&hex.to_uppercase()), Some(token));
        assert_eq!(GuardToken::parse_hex("zz"), None);
        assert_eq!(GuardToken::parse_hex(&"g".repeat(32)), None);
    }

    #[test]
    fn derivation_separates_parts() {
        let a = GuardToken::derive(&[b"ab", b"c"]);
        let b = GuardToken::derive(&[b"a", b"bc"]);
        assert_ne!(a, b);
        assert_eq!(a, GuardToken::derive(&[b"ab", b"c"]));
    }

    #[test]
    fn same_token_yields_same_guard() {
        let token = GuardToken::derive(&[b"registry-identity"]);
        assert!(Arc::ptr_eq(&token.guard(), &token.guard()));
    }

    #[test]
    fn scope_drop_deactivates() {
        let token = GuardToken::derive(&[b"registry-scope"]);
        {
            let scope = token.open_scope(ResourceLimits::default());
            assert!(scope.guard().is_active());
            scope.guard().on_entry().expect("active");
        }
        assert_eq!(token.guard().on_entry(), Err(GuardError::NoActiveScope));

        let scope = token.open_scope(ResourceLimits {
            allocations: 5,
            ..ResourceLimits::default()
        });
        scope.guard().charge(5).expect("fresh counters");
        assert_eq!(scope.token(), token);
    }
}
