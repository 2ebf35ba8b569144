//! Per-locator authenticated symmetric encryption (spec §4.2).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use vault_common::{Error, Locator, Result};

use crate::generator::Generator;

type HmacSha256 = Hmac<Sha256>;

const SUBKEY_DOMAIN: &[u8] = b"vault.segment-key.v1";
const NONCE_LEN: usize = 12;

/// Derives the per-locator AES-256 key: the master key mixed with the
/// locator. Identical plaintext written to different locators yields
/// unrelated ciphertexts because the key itself differs.
fn derive_segment_key(generator: &Generator, locator: Locator) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(generator.master_key().as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(SUBKEY_DOMAIN);
    mac.update(locator.as_ref());
    mac.finalize().into_bytes().into()
}

/// Encrypts `plaintext` under the key derived for `locator`. The nonce
/// is drawn fresh from a CSPRNG for every call and prepended to the
/// returned ciphertext, since the same locator must never be encrypted
/// twice under the same nonce.
pub fn encrypt(generator: &Generator, locator: Locator, plaintext: &[u8]) -> Vec<u8> {
    let key_bytes = derive_segment_key(generator, locator);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-256-GCM encryption of a bounded in-memory segment cannot fail");

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypts a blob produced by [`encrypt`] for the same `locator`.
/// Fails with [`Error::Decryption`] when the ciphertext is corrupt or
/// was keyed for a different locator.
pub fn decrypt(generator: &Generator, locator: Locator, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(Error::Decryption);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

    let key_bytes = derive_segment_key(generator, locator);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::derive_master_key;

    fn generator() -> Generator {
        Generator::new(derive_master_key("deadbeef", "hunter2").unwrap())
    }

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let g = generator();
        let locator = g.derive_locator(g.assurance_id(0), 0);
        let plaintext = b"deterministic vault segment payload";
        let ciphertext = encrypt(&g, locator, plaintext);
        let recovered = decrypt(&g, locator, &ciphertext).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn same_plaintext_different_locators_yield_unrelated_ciphertexts() {
        let g = generator();
        let loc_a = g.derive_locator(g.assurance_id(0), 0);
        let loc_b = g.derive_locator(g.assurance_id(1), 0);
        let plaintext = b"identical payload";
        let ct_a = encrypt(&g, loc_a, plaintext);
        let ct_b = encrypt(&g, loc_b, plaintext);
        assert_ne!(ct_a, ct_b);
    }

    #[test]
    fn decrypting_with_wrong_locator_fails() {
        let g = generator();
        let loc_a = g.derive_locator(g.assurance_id(0), 0);
        let loc_b = g.derive_locator(g.assurance_id(1), 0);
        let ciphertext = encrypt(&g, loc_a, b"payload");
        assert!(matches!(decrypt(&g, loc_b, &ciphertext), Err(Error::Decryption)));
    }

    #[test]
    fn corrupt_ciphertext_fails_decryption() {
        let g = generator();
        let locator = g.derive_locator(g.assurance_id(0), 0);
        let mut ciphertext = encrypt(&g, locator, b"payload");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(matches!(decrypt(&g, locator, &ciphertext), Err(Error::Decryption)));
    }

    #[test]
    fn truncated_blob_fails_decryption() {
        let g = generator();
        let locator = g.derive_locator(g.assurance_id(0), 0);
        assert!(matches!(decrypt(&g, locator, &[0u8; 4]), Err(Error::Decryption)));
    }
}
