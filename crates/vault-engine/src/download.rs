//! Download path (spec §4.10): content-addressed, deduplicated,
//! cache-first fetch with optional parity repair on a soft miss.

use sha2::{Digest, Sha256};
use vault_catalog::ParityMemberRow;
use vault_codec::segment;
use vault_common::{Error, Identifier, PlainHash, Result};
use vault_erasure::{ErasureError, ShardSlot};

use crate::engine::Engine;

impl Engine {
    /// `DownloadChunk(indexID, parityAware)` (spec §4.10): cache-first,
    /// single-flight per `indexID`. On a soft miss (no transport
    /// error, just nothing usable at any replication) with
    /// `parity_aware`, falls back to parity repair.
    pub async fn download_chunk(&self, id: Identifier, parity_aware: bool) -> Result<Vec<u8>> {
        if let Some((_, plaintext)) = self.cache.get(id) {
            return Ok(plaintext);
        }

        let engine = self.clone();
        self.download_dedup
            .run(id, move || async move { engine.download_chunk_inner(id, parity_aware).await })
            .await
    }

    async fn download_chunk_inner(&self, id: Identifier, parity_aware: bool) -> Result<Vec<u8>> {
        let Some(assurance) = self.catalog.find_assurance_by_index_id(id)? else {
            return Err(Error::NotFound);
        };
        let expected_hash = PlainHash(assurance.plain_hash);

        if let Some(compressed) = self.try_basic_download(id).await? {
            let plain = segment::decompress(&compressed)?;
            self.cache.insert(id, expected_hash, plain.clone());
            return Ok(plain);
        }

        if !parity_aware {
            return Err(Error::NotFound);
        }

        let plain = self.repair_chunk(expected_hash).await?;
        self.cache.insert(id, expected_hash, plain.clone());
        Ok(plain)
    }

    /// A single, non-recursive basic-download attempt keyed purely by
    /// `IndexID`: looks up the assurance row for its recorded
    /// replication and fetches that one locator. Used both for the
    /// primary lookup and, during repair, for sibling shards — neither
    /// re-enters the dedup/cache/repair machinery, which is what keeps
    /// `repair_chunk` from recursing back into `download_chunk_inner`.
    pub(crate) async fn try_basic_download(&self, id: Identifier) -> Result<Option<Vec<u8>>> {
        let Some(assurance) = self.catalog.find_assurance_by_index_id(id)? else {
            return Ok(None);
        };
        self.download_chunk_basic(id, assurance.replication).await
    }

    /// Gathers one data sibling's erasure-coding input: the still-cached
    /// `tmp_data_compressed` if its collection hasn't closed yet,
    /// otherwise a direct basic fetch of its own compressed bytes.
    async fn gather_data_sibling(&self, member: &ParityMemberRow) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = &member.tmp_data_compressed {
            return Ok(Some(bytes.clone()));
        }
        let id = self.generator.raw_or_parity_id(PlainHash(member.plain_hash));
        self.try_basic_download(id).await
    }

    /// Gathers one parity sibling's erasure-coding input: its own raw
    /// uploaded bytes, with no further decompression layer. Data
    /// members' erasure domain is their zstd-compressed bytes; parity
    /// members' erasure domain is their raw bytes as produced by
    /// `ParityCodec::create_parity`.
    async fn gather_parity_sibling(&self, member: &ParityMemberRow) -> Result<Option<Vec<u8>>> {
        let id = self.generator.raw_or_parity_id(PlainHash(member.plain_hash));
        self.try_basic_download(id).await
    }

    fn real_length_of(&self, hash: PlainHash) -> Result<usize> {
        let id = self.generator.raw_or_parity_id(hash);
        Ok(self
            .catalog
            .find_assurance_by_index_id(id)?
            .map_or(0, |a| a.length as usize))
    }

    /// `DownloadChunk`'s parity-repair fallback (spec §4.10): locates
    /// the N+M collection containing `expected_hash`, gathers every
    /// sibling it can, reconstructs with `ParityCodec`, and verifies
    /// the recovered plaintext's hash before returning it.
    async fn repair_chunk(&self, expected_hash: PlainHash) -> Result<Vec<u8>> {
        let members = self.catalog.get_parity_relations_for_hash(expected_hash)?;
        let n = self.config.parity.data_shards as usize;
        let m = self.config.parity.parity_shards as usize;

        if members.is_empty() {
            return Err(Error::NotEnoughParity {
                available: 0,
                required: n,
            });
        }

        let mut data_slots: Vec<Option<ParityMemberRow>> = vec![None; n];
        let mut parity_slots: Vec<Option<ParityMemberRow>> = vec![None; m];
        for member in members {
            let position = member.position as usize;
            if member.is_parity {
                if position < m {
                    parity_slots[position] = Some(member);
                }
            } else if position < n {
                data_slots[position] = Some(member);
            }
        }

        let mut data_info = Vec::with_capacity(n);
        for slot in &data_slots {
            let Some(member) = slot else {
                return Err(Error::internal(
                    "parity collection is missing a data member row",
                ));
            };
            let real_length = self.real_length_of(PlainHash(member.plain_hash))?;
            if member.plain_hash == expected_hash.0 {
                data_info.push(ShardSlot::broken(real_length));
                continue;
            }
            data_info.push(match self.gather_data_sibling(member).await? {
                Some(bytes) => ShardSlot::present(bytes, real_length),
                None => ShardSlot::broken(real_length),
            });
        }

        let mut parity_info = Vec::with_capacity(m);
        for slot in &parity_slots {
            let Some(member) = slot else {
                // Collection hasn't closed yet: no parity shards exist
                // at all, so there is nothing to repair from.
                let available = data_info.iter().filter(|s| !s.is_broken()).count();
                return Err(Error::NotEnoughParity { available, required: n });
            };
            let real_length = self.real_length_of(PlainHash(member.plain_hash))?;
            if member.plain_hash == expected_hash.0 {
                parity_info.push(ShardSlot::broken(real_length));
                continue;
            }
            parity_info.push(match self.gather_parity_sibling(member).await? {
                Some(bytes) => ShardSlot::present(bytes, real_length),
                None => ShardSlot::broken(real_length),
            });
        }

        self.codec
            .repair_with_parity(&mut data_info, &mut parity_info)
            .map_err(|e| match e {
                ErasureError::NotEnoughParity { available, required } => {
                    Error::NotEnoughParity { available, required }
                }
                other => Error::internal(other.to_string()),
            })?;

        let ours_is_data = data_slots
            .iter()
            .any(|s| s.as_ref().is_some_and(|r| r.plain_hash == expected_hash.0));

        let recovered = if ours_is_data {
            let pos = data_slots
                .iter()
                .position(|s| s.as_ref().is_some_and(|r| r.plain_hash == expected_hash.0))
                .expect("checked above");
            let compressed = data_info[pos]
                .data
                .clone()
                .expect("repair_with_parity fills every broken slot or errors");
            segment::decompress(&compressed)?
        } else {
            let pos = parity_slots
                .iter()
                .position(|s| s.as_ref().is_some_and(|r| r.plain_hash == expected_hash.0))
                .ok_or_else(|| Error::internal("repaired collection did not contain the requested hash"))?;
            parity_info[pos]
                .data
                .clone()
                .expect("repair_with_parity fills every broken slot or errors")
        };

        let actual_hash = PlainHash(Sha256::digest(&recovered).into());
        if actual_hash != expected_hash {
            return Err(Error::NotEnoughParity {
                available: n + m - 1,
                required: n,
            });
        }
        Ok(recovered)
    }
}
