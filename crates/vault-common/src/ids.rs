//! Identifier and locator types (spec §3, §4.1)
//!
//! `IndexId` is the semantic recipe for an identifier — the tagged role
//! plus whatever parameters that role needs (a slot number, a content
//! hash, a path). Deriving an `IndexId` through the keyed function in
//! `vault-crypto::Generator` yields the fixed-size opaque `Identifier`
//! the rest of the system actually stores and compares. `Locator` is the
//! further derivation of `(Identifier, replication)` that addresses one
//! blob on the transport.

use derive_more::{AsRef, Display, From};
use std::fmt;

/// A fixed-size opaque identifier, stable across sessions and machines
/// given the same credentials.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, AsRef, From)]
pub struct Identifier(pub [u8; 32]);

impl Identifier {
    #[must_use]
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({}…)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A transport-level address: one blob on the wire. Each locator maps to
/// at most one blob; different replications of the same identifier
/// address independent copies.
#[derive(Clone, Copy, PartialEq, Eq, Hash, AsRef, From)]
pub struct Locator(pub [u8; 32]);

impl Locator {
    #[must_use]
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Locator({}…)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A content-addressed hash, e.g. `SHA256(plaintext chunk)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, AsRef, From, Display)]
#[display("{}", hex::encode(_0))]
pub struct PlainHash(pub [u8; 32]);

impl fmt::Debug for PlainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlainHash({}…)", &hex::encode(self.0)[..8])
    }
}

/// The semantic recipe for an identifier: role plus role-specific
/// parameters. This is what gets fed to the keyed derivation function;
/// it is never itself sent over the wire or stored verbatim (its
/// `Identifier` derivation is what's stored).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexId {
    /// The i-th assurance log slot, i >= 0.
    Assurance(u32),
    /// A content-addressed data or parity blob of hash h.
    RawOrParity(PlainHash),
    /// The i-th meta record belonging to a file path.
    MetaFile(u32, String),
    /// The i-th meta record belonging to a folder path.
    MetaFolder(u32, String),
}

impl IndexId {
    /// Stable byte encoding fed into the keyed derivation function.
    /// Distinct roles/params must never collide, so every variant is
    /// prefixed with a one-byte domain tag.
    #[must_use]
    pub fn domain_bytes(&self) -> Vec<u8> {
        match self {
            Self::Assurance(i) => {
                let mut buf = Vec::with_capacity(5);
                buf.push(0u8);
                buf.extend_from_slice(&i.to_be_bytes());
                buf
            }
            Self::RawOrParity(hash) => {
                let mut buf = Vec::with_capacity(33);
                buf.push(1u8);
                buf.extend_from_slice(hash.as_ref());
                buf
            }
            Self::MetaFile(i, path) => {
                let mut buf = Vec::with_capacity(5 + path.len());
                buf.push(2u8);
                buf.extend_from_slice(&i.to_be_bytes());
                buf.extend_from_slice(path.as_bytes());
                buf
            }
            Self::MetaFolder(i, path) => {
                let mut buf = Vec::with_capacity(5 + path.len());
                buf.push(3u8);
                buf.extend_from_slice(&i.to_be_bytes());
                buf.extend_from_slice(path.as_bytes());
                buf
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_bytes_distinguish_roles_with_same_numeric_param() {
        let a = IndexId::Assurance(7).domain_bytes();
        let b = IndexId::MetaFile(7, String::new()).domain_bytes();
        assert_ne!(a, b);
    }

    #[test]
    fn identifier_debug_does_not_panic_on_short_hex() {
        let id = Identifier([0u8; 32]);
        let _ = format!("{id:?}");
    }
}
