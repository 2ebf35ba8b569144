//! Vault Erasure — the parity codec (spec §4.4): a fixed N data shards,
//! M parity shards erasure code over byte strings of varying length.

pub mod codec;

pub use codec::{ErasureError, ParityCodec, ShardSlot};
