//! Vault engine (spec §4.8–§4.11, §6): the `Engine` type and the
//! upload, assurance-load, download and meta operations implemented
//! over `vault-catalog`, `vault-crypto`, `vault-codec`, `vault-erasure`
//! and `vault-transport`.

pub mod cache;
pub mod download;
pub mod engine;
pub mod load;
pub mod meta;
pub mod upload;

pub use engine::Engine;
pub use meta::{FileOrigin, FolderEntry, MetaNode};
