//! Vault Crypto — key derivation, identifier generation and per-locator
//! authenticated encryption (spec §4.1, §4.2).

pub mod aead;
pub mod generator;
pub mod kdf;

pub use generator::Generator;
pub use kdf::{derive_master_key, MasterKey};
