//! `Engine` (spec §6): the vault's public surface, composing the
//! catalog, generator, codec and transport pool behind the upload,
//! load, download and meta operations implemented in the sibling
//! modules of this crate.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use vault_catalog::{Catalog, CatalogConfig};
use vault_codec::segment;
use vault_common::{Error, Identifier, Locator, Result, VaultConfig};
use vault_crypto::{derive_master_key, Generator};
use vault_erasure::ParityCodec;
use vault_transport::{Chunk, ConnectionPool, PoolLimits, ServiceFactory};

use crate::cache::ChunkCache;

/// The deterministic vault engine. One instance per open vault;
/// `Clone` is cheap (every field is an `Arc` or `Copy` value) so
/// concurrent callers share one engine across tasks.
#[derive(Clone)]
pub struct Engine {
    pub(crate) generator: Arc<Generator>,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) codec: Arc<ParityCodec>,
    pub(crate) cache: Arc<ChunkCache>,
    pub(crate) config: VaultConfig,
    pub(crate) upload_dedup: Arc<vault_transport::DedupContext<()>>,
    pub(crate) download_dedup: Arc<vault_transport::DedupContext<Vec<u8>>>,
    /// Serializes `push_file_to_meta`/`new_directory` against
    /// `flush_meta` (spec §5: "metaSem is a binary semaphore").
    pub(crate) meta_sem: Arc<AsyncMutex<()>>,
    /// Serializes `flush_parity`/`flush_assurances` against each other
    /// (spec §5: "flushParitySem is a binary semaphore").
    pub(crate) flush_parity_sem: Arc<AsyncMutex<()>>,
}

impl Engine {
    /// Opens (creating if absent) the vault directory named by the
    /// credentials' `PublicHash`, rooted under `base_dir` (spec §6
    /// "Persisted state layout": "one directory per vault, named by
    /// `PublicHash`").
    pub fn open(
        base_dir: &Path,
        storage_code: &str,
        password: &str,
        config: VaultConfig,
        factory: Arc<dyn ServiceFactory>,
    ) -> Result<Self> {
        config.validate().map_err(Error::internal)?;

        let master_key = derive_master_key(storage_code, password)?;
        let generator = Generator::new(master_key);
        let vault_dir = base_dir.join(generator.public_hash());

        let catalog = Catalog::open(
            &vault_dir.join("catalog.redb"),
            CatalogConfig {
                parity_data_shards: config.parity.data_shards,
            },
        )?;
        let codec = ParityCodec::new(config.parity.data_shards, config.parity.parity_shards)
            .map_err(|e| Error::internal(e.to_string()))?;
        let pool = ConnectionPool::new(
            factory,
            PoolLimits {
                total: config.pool.total,
                upload: config.pool.upload,
            },
        )?;

        Ok(Self {
            generator: Arc::new(generator),
            catalog: Arc::new(catalog),
            pool,
            codec: Arc::new(codec),
            cache: Arc::new(ChunkCache::new(config.chunk_cache_capacity)),
            config,
            upload_dedup: Arc::new(vault_transport::DedupContext::new()),
            download_dedup: Arc::new(vault_transport::DedupContext::new()),
            meta_sem: Arc::new(AsyncMutex::new(())),
            flush_parity_sem: Arc::new(AsyncMutex::new(())),
        })
    }

    #[must_use]
    pub fn public_hash(&self) -> String {
        self.generator.public_hash()
    }

    #[must_use]
    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub(crate) fn vault_dir(base_dir: &Path, generator: &Generator) -> PathBuf {
        base_dir.join(generator.public_hash())
    }

    /// `_uploadChunkBasic` (spec §4.8): encrypt-and-send one replication
    /// attempt of `plain` at `(id, replication)`, no idempotence
    /// check, no assurance bookkeeping. Returns `true` if this call's
    /// bytes are the ones now stored at the locator.
    pub(crate) async fn upload_chunk_basic(
        &self,
        plain: &[u8],
        id: Identifier,
        replication: u32,
    ) -> Result<bool> {
        let locator = self.generator.derive_locator(id, replication);
        let padded = segment::frame_and_pad(plain.to_vec(), self.config.segment_size)?;
        let ciphertext = vault_crypto::aead::encrypt(&self.generator, locator, &padded);
        let session = self.pool.acquire_upload().await?;
        session
            .upload(Chunk::new(locator, ciphertext))
            .await
            .map_err(|e| Error::transport(e.to_string()))
    }

    /// `_downloadChunkBasic` (spec §4.10): fetch and authenticate one
    /// replication attempt, returning the still-compressed bytes
    /// (caller decompresses). `Ok(None)` models "nothing at this
    /// locator, or it failed to decode/decrypt" — a soft miss, not a
    /// transport failure.
    pub(crate) async fn download_chunk_basic(
        &self,
        id: Identifier,
        replication: u32,
    ) -> Result<Option<Vec<u8>>> {
        let locator = self.generator.derive_locator(id, replication);
        self.download_chunk_basic_at(locator).await
    }

    pub(crate) async fn download_chunk_basic_at(&self, locator: Locator) -> Result<Option<Vec<u8>>> {
        let session = self.pool.acquire_download().await?;
        let blob = session
            .get_body(locator)
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        let Some(blob) = blob else {
            return Ok(None);
        };
        let padded = match vault_crypto::aead::decrypt(&self.generator, locator, &blob) {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        match segment::unframe(&padded) {
            Ok(compressed) => Ok(Some(compressed)),
            Err(_) => Ok(None),
        }
    }

    pub(crate) fn meta_id(&self, kind: vault_catalog::PathKind, index: u32, path: &str) -> Identifier {
        match kind {
            vault_catalog::PathKind::File => self.generator.meta_file_id(index, path),
            vault_catalog::PathKind::Folder => self.generator.meta_folder_id(index, path),
        }
    }
}
