//! Vault Catalog — the local persistent catalog (spec §3, §4.5).
//!
//! Backed by `redb`, an embedded transactional key-value store chosen
//! for exactly this role. One `redb::Database` file per vault (named by
//! `PublicHash`, see
//! `vault-crypto::Generator::public_hash`), opened once at `Engine`
//! construction.

pub mod catalog;

pub use catalog::{
    AssuranceRow, Catalog, CatalogConfig, FlushState, ParityMemberRow, PathKind, PendingCommand,
};
