//! Upload path (spec §4.8): `UploadFile`, chunk-level dedup/idempotence,
//! parity collection flush, and assurance log flush.

use std::path::Path;

use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use vault_codec::segment;
use vault_common::{Error, Identifier, PlainHash, Result};

use crate::engine::Engine;
use crate::meta::FileOrigin;

impl Engine {
    /// `UploadFile(localPath, remotePath)` (spec §4.8): reads the file,
    /// splits it into fixed-size chunks, uploads each (bounded by
    /// `UploadConcurrency`), then pushes the resulting origins to the
    /// meta path.
    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| Error::internal(format!("read {}: {e}", local_path.display())))?;
        self.upload_file_bytes(&bytes, remote_path).await
    }

    /// `UploadFileChunk` generalized to a whole in-memory buffer: splits
    /// `bytes` on chunk boundaries, uploads each chunk, then pushes the
    /// file's meta entry. Chunks are sized by
    /// [`segment::max_plain_chunk_size`], not `SegmentSize` itself —
    /// compressing an incompressible chunk can expand it, and framing
    /// adds further overhead on top, so a raw chunk the size of
    /// `SegmentSize` would not reliably fit back into one segment.
    pub async fn upload_file_bytes(&self, bytes: &[u8], remote_path: &str) -> Result<()> {
        let file_size = bytes.len() as u64;
        let chunk_size = segment::max_plain_chunk_size(self.config.segment_size)?;
        if chunk_size == 0 && !bytes.is_empty() {
            return Err(Error::invalid_format(format!(
                "segment_size ({}) cannot hold any chunk content once compressed and framed",
                self.config.segment_size
            )));
        }
        let chunks: Vec<(u64, &[u8])> = if bytes.is_empty() {
            Vec::new()
        } else {
            bytes
                .chunks(chunk_size)
                .scan(0u64, |start, chunk| {
                    let this_start = *start;
                    *start += chunk.len() as u64;
                    Some((this_start, chunk))
                })
                .collect()
        };

        let concurrency = self.config.upload_concurrency();
        let origins = stream::iter(chunks.into_iter().map(|(start, chunk)| async move {
            self.upload_file_chunk(chunk, start).await
        }))
        .buffered(concurrency)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<FileOrigin>>>()?;

        self.push_file_to_meta(Some(origins), file_size, remote_path, false)
            .await
    }

    /// `UploadFileChunk(bytes, hash?)` (spec §4.8): uploads one chunk
    /// (content-addressed, deduplicated) and returns the origin record
    /// `push_file_to_meta` needs to emit an `AddBlock` command for it.
    pub async fn upload_file_chunk(&self, bytes: &[u8], start: u64) -> Result<FileOrigin> {
        let hash = PlainHash(Sha256::digest(bytes).into());
        let id = self.generator.raw_or_parity_id(hash);
        self.upload_chunk(bytes.to_vec(), hash, id).await?;
        Ok(FileOrigin {
            hash,
            size: bytes.len() as u64,
            start,
        })
    }

    /// `uploadChunk(bytes, hash, indexID)` (spec §4.8): content-keyed
    /// single-flight upload, with a non-forced `flushParity` swept in
    /// beforehand so parity collections don't grow unboundedly across
    /// many concurrent uploads.
    pub(crate) async fn upload_chunk(
        &self,
        bytes: Vec<u8>,
        hash: PlainHash,
        id: Identifier,
    ) -> Result<()> {
        self.flush_parity(false).await?;

        let engine = self.clone();
        self.upload_dedup
            .run(id, move || async move { engine.upload_chunk_inner(bytes, hash, id).await })
            .await
    }

    /// `_uploadChunk` (spec §4.8): idempotent (checks the catalog by
    /// plain hash first), replicates up to `ReplicationAttemptCount`
    /// times, and records the assurance with the compressed length for
    /// data blobs but the decompressed length for parity blobs, since
    /// parity repair needs the decompressed length to size its shards.
    async fn upload_chunk_inner(&self, bytes: Vec<u8>, hash: PlainHash, id: Identifier) -> Result<()> {
        if self.catalog.find_assurance_by_plain_hash(hash)?.is_some() {
            return Ok(());
        }

        let compressed = segment::compress(&bytes)?;

        for replication in 0..self.config.replication_attempt_count {
            if self.upload_chunk_basic(&compressed, id, replication).await? {
                self.catalog.add_new_assurance_and_tmp_data(
                    id,
                    replication,
                    hash,
                    compressed.len() as u32,
                    compressed,
                    self.config.parity.data_shards,
                )?;
                return Ok(());
            }
        }
        Err(Error::UploadExhausted {
            attempts: self.config.replication_attempt_count,
        })
    }

    /// `ForceFlushParity` (spec §4.8): forces the currently-open partial
    /// parity collection ready, then processes every ready collection.
    pub async fn force_flush_parity(&self) -> Result<()> {
        self.flush_parity(true).await
    }

    /// `flushParity(force)` (spec §4.8): serialized against itself and
    /// `FlushAssurances` by `flush_parity_sem`. When `force`, the
    /// current partial collection is closed regardless of size; either
    /// way, every ready collection is turned into M parity shards and
    /// closed.
    pub(crate) async fn flush_parity(&self, force: bool) -> Result<()> {
        let _guard = self.flush_parity_sem.lock().await;

        if force {
            self.catalog.force_parity_processing_state()?;
        }

        for (collection_id, members) in self.catalog.get_processing_parity_relations()? {
            let mut ordered = members;
            ordered.sort_by_key(|m| m.position);
            let data: Vec<Vec<u8>> = ordered
                .iter()
                .map(|m| {
                    m.tmp_data_compressed.clone().ok_or_else(|| {
                        Error::internal(format!(
                            "parity collection {collection_id} missing tmp_data_compressed"
                        ))
                    })
                })
                .collect::<Result<_>>()?;

            let parity_shards = self
                .codec
                .create_parity(&data)
                .map_err(|e| Error::internal(e.to_string()))?;

            let mut parity_hashes = Vec::with_capacity(parity_shards.len());
            for shard in &parity_shards {
                let hash = PlainHash(Sha256::digest(shard).into());
                let id = self.generator.raw_or_parity_id(hash);
                self.upload_parity_shard(shard, id).await?;
                parity_hashes.push(hash);
            }

            self.catalog.close_parity_relations(
                collection_id,
                self.config.parity.data_shards,
                &parity_hashes,
            )?;
        }
        Ok(())
    }

    /// Uploads a parity shard's own replication set directly (no
    /// collection/tmp-data bookkeeping — parity shards never join
    /// another parity collection).
    async fn upload_parity_shard(&self, bytes: &[u8], id: Identifier) -> Result<()> {
        let hash = PlainHash(Sha256::digest(bytes).into());
        if self.catalog.find_assurance_by_plain_hash(hash)?.is_some() {
            return Ok(());
        }
        for replication in 0..self.config.replication_attempt_count {
            if self.upload_chunk_basic(bytes, id, replication).await? {
                self.catalog
                    .add_new_assurance(id, replication, hash, bytes.len() as u32)?;
                return Ok(());
            }
        }
        Err(Error::UploadExhausted {
            attempts: self.config.replication_attempt_count,
        })
    }

    /// `FlushAssurances` (spec §4.8): aggregates every not-yet-flushed
    /// assurance row and parity relation membership into one logical
    /// segment, splits it into `SegmentSize`-bounded pieces, and writes
    /// each piece to the next assurance log slot(s) with a
    /// replication-search loop that tolerates a bounded number of
    /// invalid/missing replications per slot.
    pub async fn flush_assurances(&self) -> Result<()> {
        let _guard = self.flush_parity_sem.lock().await;

        let Some((segment, pending_ids, pending_relation_keys, flush_state)) =
            self.catalog.new_aggregated_assurance_segment_with_flush_state()?
        else {
            return Ok(());
        };

        let pieces = segment.to_list_of_byte_arrays(self.config.segment_size)?;
        let mut next_slot = flush_state.last_fetched_assurance_id.map_or(0, |s| s + 1);
        let min_slot = next_slot;

        self.catalog.begin_pending_flush(min_slot, min_slot + pieces.len() as u64 - 1)?;

        let mut invalid_count: u32 = 0;
        for piece in &pieces {
            let id = self.generator.assurance_id(next_slot as u32);

            let search_cap = self
                .config
                .assurance_replication_search_count
                .min(self.config.assurance_replication_default_count + invalid_count);

            let mut confirmed = 0u32;
            for replication in 0..search_cap {
                match self.upload_chunk_basic(piece, id, replication).await {
                    Ok(true) => confirmed += 1,
                    Ok(false) => {
                        // Something else already occupies this
                        // replication; read it back to see whether it's
                        // actually our own piece (a retried flush) or
                        // genuinely foreign.
                        match self.download_chunk_basic(id, replication).await {
                            Ok(Some(existing)) if existing == *piece => confirmed += 1,
                            Ok(_) => invalid_count += 1,
                            Err(e) if e.is_transport() => return Err(e),
                            Err(_) => invalid_count += 1,
                        }
                    }
                    Err(e) if e.is_transport() => return Err(e),
                    Err(_) => invalid_count += 1,
                }
            }

            if confirmed < self.config.assurance_replication_default_count {
                return Err(Error::InsufficientAssuranceReplication {
                    confirmed,
                    required: self.config.assurance_replication_default_count,
                });
            }

            self.catalog.increment_flushed_count()?;
            next_slot += 1;
        }

        self.catalog
            .mark_aggregation_flushed(&pending_ids, &pending_relation_keys, next_slot - 1)?;
        Ok(())
    }
}
