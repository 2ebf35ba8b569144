//! The two wire-stable record formats, `AssuranceSegment` and
//! `MetaSegment` (spec §3, §6), plus the `ToListOfByteArrays` splitting
//! rule that bounds either one to `SegmentSize`-sized pieces.

use serde::{Deserialize, Serialize};
use vault_common::Error;

/// One row of an `AssuranceSegment`: a blob known to exist at
/// `(index_id, replication)`, with the hash and length needed to verify
/// and repair it later.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssuranceEntry {
    pub index_id: [u8; 32],
    pub replication: u32,
    pub plain_hash: [u8; 32],
    pub length: u32,
}

/// One row describing membership in a parity collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParityRelationEntry {
    pub collection_id: u64,
    pub plain_hash: [u8; 32],
    pub is_parity: bool,
    /// Index within this row's own role (0..N for data, 0..M for
    /// parity), the order `ParityCodec` used at creation time. Needed
    /// on the wire so a fresh client that only ever fetches the
    /// assurance log (never performed the original upload) can still
    /// rebuild the exact shard ordering `RepairWithParity` requires.
    pub position: u32,
}

/// The assurance log's unit of serialization: a batch of newly-known
/// blobs plus the parity relation memberships created alongside them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AssuranceSegment {
    pub segments: Vec<AssuranceEntry>,
    pub parity_relations: Vec<ParityRelationEntry>,
}

/// A virtual-filesystem command. Commands for a path accumulate
/// monotonically: later commands extend, never modify, earlier ones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// A child folder reference inside a folder path.
    AddFolder { name: String },
    /// A child file reference inside a folder path.
    AddFile { name: String, size: u64 },
    /// An extent of a file path's content.
    AddBlock {
        hash: [u8; 32],
        size: u64,
        start: u64,
    },
}

/// The meta log's unit of serialization: an ordered list of commands
/// for one path.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetaSegment {
    pub commands: Vec<Command>,
}

/// Greedily packs items into segments whose `bincode`-encoded size never
/// exceeds `segment_size`, preserving order both within and across
/// segments (`ToListOfByteArrays`, spec §6).
fn pack<T, S>(
    items: &[T],
    segment_size: u32,
    wrap: impl Fn(Vec<T>) -> S,
) -> vault_common::Result<Vec<S>>
where
    T: Clone + Serialize,
    S: Serialize,
{
    let budget = segment_size as usize;
    let mut out = Vec::new();
    let mut current: Vec<T> = Vec::new();

    for item in items {
        let mut candidate = current.clone();
        candidate.push(item.clone());
        let encoded_len = bincode::serialized_size(&wrap(candidate.clone()))
            .map_err(|e| Error::internal(format!("measure segment size: {e}")))?
            as usize;

        if encoded_len > budget {
            if current.is_empty() {
                return Err(Error::invalid_format(
                    "a single entry exceeds segment_size and cannot be split further".to_string(),
                ));
            }
            out.push(wrap(std::mem::take(&mut current)));
            current.push(item.clone());
        } else {
            current = candidate;
        }
    }

    if !current.is_empty() || out.is_empty() {
        out.push(wrap(current));
    }
    Ok(out)
}

impl AssuranceSegment {
    /// Splits `self` into one or more segments each bounded by
    /// `segment_size` once `bincode`-encoded. Parity relations travel
    /// alongside whichever piece also carries at least one of the
    /// segment entries from the same collection when possible, but for
    /// simplicity (and because relations are small, fixed-size rows)
    /// they are packed independently in the same pass as the segment
    /// entries, then merged pairwise into their final segments.
    pub fn to_list_of_byte_arrays(
        &self,
        segment_size: u32,
    ) -> vault_common::Result<Vec<Vec<u8>>> {
        let segment_pieces = pack(&self.segments, segment_size, |segments| AssuranceSegment {
            segments,
            parity_relations: Vec::new(),
        })?;
        let relation_pieces = pack(&self.parity_relations, segment_size, |parity_relations| {
            AssuranceSegment {
                segments: Vec::new(),
                parity_relations,
            }
        })?;

        let total = segment_pieces.len().max(relation_pieces.len());
        let mut out = Vec::with_capacity(total);
        for i in 0..total {
            let piece = AssuranceSegment {
                segments: segment_pieces.get(i).map(|p| p.segments.clone()).unwrap_or_default(),
                parity_relations: relation_pieces
                    .get(i)
                    .map(|p| p.parity_relations.clone())
                    .unwrap_or_default(),
            };
            out.push(bincode::serialize(&piece).map_err(|e| Error::internal(e.to_string()))?);
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> vault_common::Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::invalid_format(e.to_string()))
    }
}

impl MetaSegment {
    pub fn to_list_of_byte_arrays(&self, segment_size: u32) -> vault_common::Result<Vec<Vec<u8>>> {
        let pieces = pack(&self.commands, segment_size, |commands| MetaSegment { commands })?;
        pieces
            .iter()
            .map(|p| bincode::serialize(p).map_err(|e| Error::internal(e.to_string())))
            .collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> vault_common::Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::invalid_format(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: u8) -> AssuranceEntry {
        AssuranceEntry {
            index_id: [i; 32],
            replication: 0,
            plain_hash: [i; 32],
            length: 1024,
        }
    }

    #[test]
    fn small_assurance_segment_fits_in_one_piece() {
        let seg = AssuranceSegment {
            segments: vec![entry(1), entry(2)],
            parity_relations: vec![],
        };
        let pieces = seg.to_list_of_byte_arrays(4096).unwrap();
        assert_eq!(pieces.len(), 1);
        let decoded = AssuranceSegment::from_bytes(&pieces[0]).unwrap();
        assert_eq!(decoded.segments.len(), 2);
    }

    #[test]
    fn large_assurance_segment_splits_and_preserves_order() {
        let entries: Vec<_> = (0..200u8).map(entry).collect();
        let seg = AssuranceSegment {
            segments: entries.clone(),
            parity_relations: vec![],
        };
        let pieces = seg.to_list_of_byte_arrays(512).unwrap();
        assert!(pieces.len() > 1);

        let mut recovered = Vec::new();
        for piece in &pieces {
            recovered.extend(AssuranceSegment::from_bytes(piece).unwrap().segments);
        }
        assert_eq!(recovered, entries);
    }

    #[test]
    fn meta_segment_roundtrips_and_splits() {
        let commands: Vec<_> = (0..500u64)
            .map(|i| Command::AddBlock {
                hash: [0u8; 32],
                size: 1024,
                start: i * 1024,
            })
            .collect();
        let seg = MetaSegment { commands: commands.clone() };
        let pieces = seg.to_list_of_byte_arrays(1024).unwrap();
        assert!(pieces.len() > 1);

        let mut recovered = Vec::new();
        for piece in &pieces {
            recovered.extend(MetaSegment::from_bytes(piece).unwrap().commands);
        }
        assert_eq!(recovered, commands);
    }

    #[test]
    fn empty_meta_segment_yields_one_empty_piece() {
        let seg = MetaSegment::default();
        let pieces = seg.to_list_of_byte_arrays(1024).unwrap();
        assert_eq!(pieces.len(), 1);
        assert!(MetaSegment::from_bytes(&pieces[0]).unwrap().commands.is_empty());
    }
}
