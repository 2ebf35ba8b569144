//! Vault Codec — the segment codec pipeline and the two wire-stable
//! record formats (spec §4.3, §6).

pub mod segment;
pub mod wire;

pub use segment::{decode_plaintext, encode_plaintext, max_plain_chunk_size};
pub use wire::{AssuranceEntry, AssuranceSegment, Command, MetaSegment, ParityRelationEntry};
