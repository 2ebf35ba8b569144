//! Assurance log load (spec §4.9): `Load` replays the remote assurance
//! log into the local catalog, slot by slot, until a slot's every
//! replication attempt comes back empty.

use vault_common::Result;

use crate::engine::Engine;

impl Engine {
    /// `Load` (spec §4.9): brings the local catalog up to date with the
    /// remote assurance log. A no-op once `AllAssurancesFetched` is
    /// already set (the vault never shrinks its own assurance log, so
    /// once every slot has been seen there is nothing left to learn).
    pub async fn load(&self) -> Result<()> {
        if self.catalog.get_all_assurances_fetched()? {
            return Ok(());
        }
        self.fetch_assurances().await
    }

    /// `_fetchAssurances` (spec §4.9): scans slots starting right after
    /// the last one already known, probing each slot's replications up
    /// to `AssuranceReplicationSearchCount` times. A slot where every
    /// attempt misses ends the scan (the remote log is append-only and
    /// contiguous, so a fully-empty slot means the log ends there).
    async fn fetch_assurances(&self) -> Result<()> {
        let mut slot = self.catalog.last_fetched_assurance_id()?.map_or(0, |s| s + 1);

        loop {
            let id = self.generator.assurance_id(slot as u32);
            let mut found = None;

            for replication in 0..self.config.assurance_replication_search_count {
                match self.download_chunk_basic(id, replication).await {
                    Ok(Some(bytes)) => {
                        found = Some(bytes);
                        break;
                    }
                    Ok(None) => continue,
                    Err(e) if e.is_transport() => return Err(e),
                    Err(_) => continue,
                }
            }

            match found {
                Some(bytes) => {
                    let segment = vault_codec::AssuranceSegment::from_bytes(&bytes)?;
                    self.catalog.add_fetched_assurances(&segment, slot)?;
                    slot += 1;
                }
                None => break,
            }
        }

        self.catalog.set_all_assurances_fetched()
    }
}
