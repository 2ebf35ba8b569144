//! Password-based key derivation (spec §4.1, §6 Credentials).

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use vault_common::{Error, Result};

/// Fixed, deterministic Argon2id parameters. Identical credentials must
/// derive the identical master key on any machine, so these are never
/// randomized or tuned per-invocation.
const ARGON2_M_COST_KIB: u32 = 19_456;
const ARGON2_T_COST: u32 = 2;
const ARGON2_P_COST: u32 = 1;
const MASTER_KEY_LEN: usize = 32;

/// The 256-bit secret deterministically derived from `(storageCode,
/// password)`. Identical credentials on any machine yield an identical
/// master key, and therefore an identical keyspace.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey(pub [u8; 32]);

impl MasterKey {
    /// A deterministic fingerprint of the key, used to name the vault's
    /// local directory (spec §6 "Persisted state layout") without
    /// revealing the key itself.
    #[must_use]
    pub fn public_hash(&self) -> String {
        hex::encode(Sha256::digest(self.0))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// Never print the raw key material; show only its public fingerprint,
// the way a leaked debug log should not be able to reconstruct secrets.
impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey(sha256={}…)", &self.public_hash()[..12])
    }
}

/// Derives the master key from `(storageCode, password)` via Argon2id
/// with fixed parameters. The salt is itself deterministically derived
/// from `storage_code` (not randomly generated) so that re-deriving the
/// key from the same credentials always reproduces the same value.
pub fn derive_master_key(storage_code: &str, password: &str) -> Result<MasterKey> {
    let salt = Sha256::digest(storage_code.as_bytes());
    let params = Params::new(
        ARGON2_M_COST_KIB,
        ARGON2_T_COST,
        ARGON2_P_COST,
        Some(MASTER_KEY_LEN),
    )
    .map_err(|e| Error::internal(format!("invalid argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; MASTER_KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), &salt[..16], &mut out)
        .map_err(|e| Error::internal(format!("argon2 derivation failed: {e}")))?;
    Ok(MasterKey(out))
}

/// Generates a fresh storage code: 32 random bytes from a CSPRNG,
/// hex-encoded (spec §6: `GenerateStorageCode`).
#[must_use]
pub fn generate_storage_code() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_credentials_derive_same_key() {
        let code = generate_storage_code();
        let k1 = derive_master_key(&code, "hunter2").unwrap();
        let k2 = derive_master_key(&code, "hunter2").unwrap();
        assert_eq!(k1.0, k2.0);
        assert_eq!(k1.public_hash(), k2.public_hash());
    }

    #[test]
    fn different_passwords_derive_different_keys() {
        let code = generate_storage_code();
        let k1 = derive_master_key(&code, "hunter2").unwrap();
        let k2 = derive_master_key(&code, "hunter3").unwrap();
        assert_ne!(k1.0, k2.0);
    }

    #[test]
    fn different_storage_codes_derive_different_keys() {
        let k1 = derive_master_key(&generate_storage_code(), "hunter2").unwrap();
        let k2 = derive_master_key(&generate_storage_code(), "hunter2").unwrap();
        assert_ne!(k1.0, k2.0);
    }

    #[test]
    fn generated_storage_codes_are_32_bytes_hex() {
        let code = generate_storage_code();
        assert_eq!(code.len(), 64);
        assert!(hex::decode(&code).is_ok());
    }

    #[test]
    fn debug_impl_does_not_print_key_material() {
        let key = derive_master_key(&generate_storage_code(), "hunter2").unwrap();
        let printed = format!("{key:?}");
        assert!(!printed.contains(&hex::encode(key.0)));
    }
}
