//! Vault configuration (spec §9: "Global state ... becomes an explicit
//! configuration record threaded through the engine at construction").

use serde::{Deserialize, Serialize};

/// Connection pool sizing. `upload <= total`, `upload >= 1`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Total concurrent transport sessions (downloads + uploads).
    pub total: u32,
    /// Of `total`, how many may be held for uploads at once. Honored
    /// exactly as given by the caller, never silently overridden.
    pub upload: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            total: 16,
            upload: 4,
        }
    }
}

impl PoolConfig {
    /// Validates `total >= upload >= 1` (spec §4.7/§5's priority
    /// relationship `upload ⊆ total`).
    pub fn validate(&self) -> Result<(), String> {
        if self.upload == 0 {
            return Err("upload connection count must be >= 1".into());
        }
        if self.total < self.upload {
            return Err(format!(
                "total connections ({}) must be >= upload connections ({})",
                self.total, self.upload
            ));
        }
        Ok(())
    }
}

/// Parity shard counts: N data shards, M parity shards, fixed per vault.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ParityConfig {
    pub data_shards: u32,
    pub parity_shards: u32,
}

impl Default for ParityConfig {
    fn default() -> Self {
        Self {
            data_shards: 10,
            parity_shards: 3,
        }
    }
}

/// The vault's global configuration record. Threaded through `Engine` at
/// construction; the core never reads it from disk (the CLI binary does
/// that and passes the parsed value in).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Plaintext bytes per segment before encryption (spec §3:
    /// "typical order 512 KiB-1 MiB; implementer choice, fixed for the
    /// life of a vault").
    pub segment_size: u32,
    pub parity: ParityConfig,
    /// Replication attempts per data/parity chunk upload (spec §4.8).
    pub replication_attempt_count: u32,
    /// Minimum valid replications required per assurance slot (spec
    /// §4.8 FlushAssurances).
    pub assurance_replication_default_count: u32,
    /// Outer cap on replication attempts scanned per assurance slot
    /// during flush and during load (spec §4.8, §4.9).
    pub assurance_replication_search_count: u32,
    pub pool: PoolConfig,
    /// Capacity of the in-memory chunk cache (spec §5: "bounded at
    /// ~100 entries").
    pub chunk_cache_capacity: usize,
    /// Max concurrent meta-path downloads (spec §4.11: "concurrency
    /// <= 10").
    pub meta_download_concurrency: usize,
    /// Max in-flight bytes for `UploadFile` chunk scheduling (spec
    /// §4.8: "32 MiB / SegmentSize").
    pub upload_inflight_bytes: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            segment_size: 512 * 1024,
            parity: ParityConfig::default(),
            replication_attempt_count: 4,
            assurance_replication_default_count: 2,
            assurance_replication_search_count: 6,
            pool: PoolConfig::default(),
            chunk_cache_capacity: 100,
            meta_download_concurrency: 10,
            upload_inflight_bytes: 32 * 1024 * 1024,
        }
    }
}

impl VaultConfig {
    /// Max concurrent in-flight chunk uploads for a single `UploadFile`
    /// call (spec §4.8: `floor(32 MiB / SegmentSize)`, at least 1).
    #[must_use]
    pub fn upload_concurrency(&self) -> usize {
        ((self.upload_inflight_bytes / u64::from(self.segment_size)).max(1)) as usize
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.segment_size == 0 {
            return Err("segment_size must be > 0".into());
        }
        if self.parity.data_shards == 0 {
            return Err("parity.data_shards must be > 0".into());
        }
        if self.assurance_replication_default_count > self.assurance_replication_search_count {
            return Err(
                "assurance_replication_default_count must be <= assurance_replication_search_count"
                    .into(),
            );
        }
        self.pool.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        VaultConfig::default().validate().unwrap();
    }

    #[test]
    fn upload_concurrency_is_floor_division() {
        let mut cfg = VaultConfig::default();
        cfg.segment_size = 7 * 1024 * 1024;
        cfg.upload_inflight_bytes = 32 * 1024 * 1024;
        assert_eq!(cfg.upload_concurrency(), 4);
    }

    #[test]
    fn pool_config_rejects_upload_greater_than_total() {
        let pool = PoolConfig { total: 2, upload: 3 };
        assert!(pool.validate().is_err());
    }
}
