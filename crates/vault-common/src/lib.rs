//! Vault Common - shared types, identifiers and configuration
//!
//! This crate provides the identifier/locator newtypes, the vault-wide
//! error taxonomy and the engine configuration record shared across all
//! vault components.

pub mod config;
pub mod error;
pub mod ids;

pub use config::VaultConfig;
pub use error::{Error, Result};
pub use ids::{Identifier, IndexId, Locator, PlainHash};
