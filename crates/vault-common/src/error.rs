//! Vault error taxonomy (spec §7)

use thiserror::Error;

/// Errors surfaced by any vault component.
///
/// Kinds, not type names: each variant corresponds to one of the failure
/// kinds named in the design ("TransportError", "NotFound", ...). Call
/// sites match on the variant, not on its `Display` text.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The transport raised an error. Fatal for the current operation;
    /// never reinterpreted as "not found".
    #[error("transport error: {0}")]
    Transport(String),

    /// No blob at the requested locator, or no assurance exists for the
    /// requested index id. Retryable by the caller after future writes.
    #[error("not found")]
    NotFound,

    /// Ciphertext failed authentication or was keyed for a different
    /// locator.
    #[error("decryption failed")]
    Decryption,

    /// A record failed to decode (bad framing, bad padding, bad wire
    /// format).
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Parity repair did not have enough surviving shards.
    #[error("not enough parity shards to repair: {available} of {required} required")]
    NotEnoughParity { available: usize, required: usize },

    /// All replication attempts refused the locator.
    #[error("upload exhausted after {attempts} replication attempts")]
    UploadExhausted { attempts: u32 },

    /// Fewer than `AssuranceReplicationDefaultCount` valid replications
    /// were confirmed for one assurance slot.
    #[error("insufficient assurance replication: {confirmed} of {required} required")]
    InsufficientAssuranceReplication { confirmed: u32, required: u32 },

    /// A meta push would violate WORM or namespace-disjointness.
    #[error("meta entry overwrite: {0}")]
    MetaEntryOverwrite(String),

    /// Input path failed the format rules.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Local catalog (redb) failure.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Internal invariant violation — should not happen in correct use.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    #[must_use]
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    #[must_use]
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }

    #[must_use]
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    #[must_use]
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller is expected to be able to retry later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::InsufficientAssuranceReplication { .. }
        )
    }

    /// Whether this is the fatal "transport is actually broken" kind,
    /// as opposed to "transport answered but the content was absent or
    /// unusable" — see the propagation policy in spec §7.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
