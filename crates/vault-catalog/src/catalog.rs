//! `redb`-backed implementation of the tables and operations described
//! in spec §3 ("Local catalog (persistent)") and §4.5 ("Local catalog
//! (DB)").
//!
//! Table layout follows a key-prefix-scanning convention: every key is
//! a flat byte string, composite keys separate their components with
//! either a fixed width or a `0x00` byte that cannot appear inside a
//! path, so that a lexicographic range scan over the table recovers
//! exactly the rows for one logical group in insertion order.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vault_codec::Command;
use vault_common::{Error, Identifier, PlainHash, Result};

const ASSURANCES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("assurances");
const ASSURANCES_BY_HASH: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("assurances_by_hash");
const PARITY_MEMBERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("parity_members");
const PARITY_HASH_INDEX: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("parity_hash_index");
const PARITY_COLLECTION_META: TableDefinition<u64, &[u8]> =
    TableDefinition::new("parity_collection_meta");
const PARITY_READY_QUEUE: TableDefinition<u64, ()> = TableDefinition::new("parity_ready_queue");
const TRANSIENT_META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("transient_meta");
const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

const KV_FLUSH_STATE: &str = "flush_state";
const KV_CURRENT_COLLECTION: &str = "current_collection";
const KV_NEXT_COLLECTION_ID: &str = "next_collection_id";

/// One row of the `Assurances` table: a locally-known fact that a blob
/// exists remotely at `(index_id, replication)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssuranceRow {
    pub replication: u32,
    pub plain_hash: [u8; 32],
    pub length: u32,
    /// Assurance log slot this row was announced in, or `None` if it is
    /// known locally but not yet flushed to the remote assurance log.
    pub slot: Option<u64>,
}

/// One member of a parity relation collection: a data or parity shard
/// sharing `collection_id` with its N+M siblings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParityMemberRow {
    pub collection_id: u64,
    pub plain_hash: [u8; 32],
    pub is_parity: bool,
    /// Present for data members until their collection closes (spec
    /// §4.5 `CloseParityRelations`: "clears `tmp-data-compressed` on
    /// the N data rows").
    pub tmp_data_compressed: Option<Vec<u8>>,
    /// Index within this row's own role (0..N for data, 0..M for
    /// parity) at the moment it was created. The erasure codec's
    /// reconstruction math is keyed on this index, not on storage
    /// order — `PARITY_MEMBERS` keys sort by hash, which has no
    /// relation to the shard order `ParityCodec` used, so this field is
    /// what lets a caller rebuild the original shard ordering.
    pub position: u32,
    /// Whether this membership fact has already been announced in the
    /// remote assurance log. Mirrors `AssuranceRow::slot` but tracked
    /// separately since a data member's relation row can outlive the
    /// `AssuranceRow` flush (the data blob may be flushed before its
    /// collection closes).
    pub flushed: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct CollectionMeta {
    count: u32,
    closed: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct CurrentCollection {
    id: u64,
    count: u32,
}

/// `FlushState` (spec §3): progress of assurance log fetching and of
/// the currently in-flight assurance flush, if any.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct FlushState {
    pub last_fetched_assurance_id: Option<u64>,
    pub all_assurances_fetched: bool,
    pub pending_min_slot: Option<u64>,
    pub pending_max_slot: Option<u64>,
    pub flushed_count: u32,
}

/// Whether a path is currently known (by transient cache or assurance
/// catalog) to be a file or a folder. The two namespaces are disjoint
/// for the vault's lifetime (spec §3 invariant).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathKind {
    File,
    Folder,
}

/// One entry queued in the transient meta cache: a command not yet
/// written to the remote meta log for `path`, at local sequence
/// `index` within that path's eventual meta log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingCommand {
    pub path: String,
    pub index: u32,
    pub command: Command,
}

impl PendingCommand {
    #[must_use]
    pub fn kind(&self) -> PathKind {
        match &self.command {
            Command::AddBlock { .. } => PathKind::File,
            Command::AddFolder { .. } | Command::AddFile { .. } => PathKind::Folder,
        }
    }
}

#[derive(Clone, Copy)]
pub struct CatalogConfig {
    /// N: number of data shards that close a parity relation collection.
    pub parity_data_shards: u32,
}

/// The local persistent catalog. One instance per open vault.
pub struct Catalog {
    db: Arc<Database>,
}

fn transient_key(path: &str, index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(path.len() + 1 + 4);
    key.extend_from_slice(path.as_bytes());
    key.push(0);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn transient_path_bounds(path: &str) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(path.len() + 5);
    start.extend_from_slice(path.as_bytes());
    start.push(0);
    start.extend_from_slice(&0u32.to_be_bytes());
    let mut end = Vec::with_capacity(path.len() + 5);
    end.extend_from_slice(path.as_bytes());
    end.push(0);
    end.extend_from_slice(&u32::MAX.to_be_bytes());
    (start, end)
}

fn parity_member_key(collection_id: u64, hash: &[u8; 32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 32);
    key.extend_from_slice(&collection_id.to_be_bytes());
    key.extend_from_slice(hash);
    key
}

fn parity_collection_bounds(collection_id: u64) -> (Vec<u8>, Vec<u8>) {
    let mut start = collection_id.to_be_bytes().to_vec();
    start.extend_from_slice(&[0u8; 32]);
    let mut end = collection_id.to_be_bytes().to_vec();
    end.extend_from_slice(&[0xFFu8; 32]);
    (start, end)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::catalog(format!("decode: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::catalog(format!("encode: {e}")))
}

impl Catalog {
    /// Opens (creating if absent) the catalog database at `path`.
    pub fn open(path: &Path, _config: CatalogConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::catalog(format!("create catalog dir: {e}")))?;
        }
        let db = Database::create(path).map_err(|e| Error::catalog(e.to_string()))?;
        let catalog = Self { db: Arc::new(db) };
        catalog.ensure_tables()?;
        debug!(path = %path.display(), "opened vault catalog");
        Ok(catalog)
    }

    fn ensure_tables(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(|e| Error::catalog(e.to_string()))?;
        {
            let _ = txn.open_table(ASSURANCES).map_err(|e| Error::catalog(e.to_string()))?;
            let _ = txn
                .open_table(ASSURANCES_BY_HASH)
                .map_err(|e| Error::catalog(e.to_string()))?;
            let _ = txn
                .open_table(PARITY_MEMBERS)
                .map_err(|e| Error::catalog(e.to_string()))?;
            let _ = txn
                .open_table(PARITY_HASH_INDEX)
                .map_err(|e| Error::catalog(e.to_string()))?;
            let _ = txn
                .open_table(PARITY_COLLECTION_META)
                .map_err(|e| Error::catalog(e.to_string()))?;
            let _ = txn
                .open_table(PARITY_READY_QUEUE)
                .map_err(|e| Error::catalog(e.to_string()))?;
            let _ = txn
                .open_table(TRANSIENT_META)
                .map_err(|e| Error::catalog(e.to_string()))?;
            let _ = txn.open_table(KV).map_err(|e| Error::catalog(e.to_string()))?;
        }
        txn.commit().map_err(|e| Error::catalog(e.to_string()))?;
        Ok(())
    }

    fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&WriteTransaction) -> Result<T>,
    {
        let txn = self.db.begin_write().map_err(|e| Error::catalog(e.to_string()))?;
        let result = f(&txn)?;
        txn.commit().map_err(|e| Error::catalog(e.to_string()))?;
        Ok(result)
    }

    // ---- Assurances -----------------------------------------------

    pub fn find_assurance_by_index_id(&self, id: Identifier) -> Result<Option<AssuranceRow>> {
        let txn = self.db.begin_read().map_err(|e| Error::catalog(e.to_string()))?;
        let table = txn.open_table(ASSURANCES).map_err(|e| Error::catalog(e.to_string()))?;
        match table.get(id.as_ref().as_slice()).map_err(|e| Error::catalog(e.to_string()))? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn find_assurance_by_plain_hash(
        &self,
        hash: PlainHash,
    ) -> Result<Option<(Identifier, AssuranceRow)>> {
        let txn = self.db.begin_read().map_err(|e| Error::catalog(e.to_string()))?;
        let by_hash = txn
            .open_table(ASSURANCES_BY_HASH)
            .map_err(|e| Error::catalog(e.to_string()))?;
        let Some(id_bytes) = by_hash
            .get(hash.as_ref().as_slice())
            .map_err(|e| Error::catalog(e.to_string()))?
        else {
            return Ok(None);
        };
        let mut id = [0u8; 32];
        id.copy_from_slice(id_bytes.value());
        let table = txn.open_table(ASSURANCES).map_err(|e| Error::catalog(e.to_string()))?;
        let Some(row) = table.get(id.as_slice()).map_err(|e| Error::catalog(e.to_string()))? else {
            return Ok(None);
        };
        Ok(Some((Identifier(id), decode(row.value())?)))
    }

    fn insert_assurance_row(
        &self,
        txn: &WriteTransaction,
        id: Identifier,
        row: &AssuranceRow,
    ) -> Result<()> {
        let mut table = txn.open_table(ASSURANCES).map_err(|e| Error::catalog(e.to_string()))?;
        table
            .insert(id.as_ref().as_slice(), encode(row)?.as_slice())
            .map_err(|e| Error::catalog(e.to_string()))?;
        let mut by_hash = txn
            .open_table(ASSURANCES_BY_HASH)
            .map_err(|e| Error::catalog(e.to_string()))?;
        by_hash
            .insert(row.plain_hash.as_slice(), id.as_ref().as_slice())
            .map_err(|e| Error::catalog(e.to_string()))?;
        Ok(())
    }

    /// `AddNewAssurance` (spec §4.5): records a parity blob's existence.
    /// Does not enqueue a pending parity relation row — the collection
    /// it belongs to was already created by `CloseParityRelations`.
    pub fn add_new_assurance(
        &self,
        id: Identifier,
        replication: u32,
        hash: PlainHash,
        length: u32,
    ) -> Result<()> {
        self.run(|txn| {
            self.insert_assurance_row(
                txn,
                id,
                &AssuranceRow {
                    replication,
                    plain_hash: hash.0,
                    length,
                    slot: None,
                },
            )
        })
    }

    fn current_collection(&self, txn: &WriteTransaction) -> Result<CurrentCollection> {
        let kv = txn.open_table(KV).map_err(|e| Error::catalog(e.to_string()))?;
        if let Some(v) = kv.get(KV_CURRENT_COLLECTION).map_err(|e| Error::catalog(e.to_string()))? {
            return decode(v.value());
        }
        Ok(CurrentCollection { id: 0, count: 0 })
    }

    fn set_current_collection(&self, txn: &WriteTransaction, cur: CurrentCollection) -> Result<()> {
        let mut kv = txn.open_table(KV).map_err(|e| Error::catalog(e.to_string()))?;
        kv.insert(KV_CURRENT_COLLECTION, encode(&cur)?.as_slice())
            .map_err(|e| Error::catalog(e.to_string()))?;
        Ok(())
    }

    fn next_collection_id(&self, txn: &WriteTransaction) -> Result<u64> {
        let mut kv = txn.open_table(KV).map_err(|e| Error::catalog(e.to_string()))?;
        let next = match kv.get(KV_NEXT_COLLECTION_ID).map_err(|e| Error::catalog(e.to_string()))? {
            Some(v) => decode::<u64>(v.value())? + 1,
            None => 1,
        };
        kv.insert(KV_NEXT_COLLECTION_ID, encode(&next)?.as_slice())
            .map_err(|e| Error::catalog(e.to_string()))?;
        Ok(next)
    }

    /// `AddNewAssuranceAndTmpData` (spec §4.5): records a data blob's
    /// existence and enqueues it into the currently-open parity
    /// relation collection, force-closing that collection into the
    /// ready queue once it reaches N members.
    pub fn add_new_assurance_and_tmp_data(
        &self,
        id: Identifier,
        replication: u32,
        hash: PlainHash,
        length: u32,
        compressed_bytes: Vec<u8>,
        data_shards: u32,
    ) -> Result<()> {
        self.run(|txn| {
            self.insert_assurance_row(
                txn,
                id,
                &AssuranceRow {
                    replication,
                    plain_hash: hash.0,
                    length,
                    slot: None,
                },
            )?;

            let mut cur = self.current_collection(txn)?;
            if cur.id == 0 && cur.count == 0 {
                cur.id = self.next_collection_id(txn)?;
            }

            let mut members = txn
                .open_table(PARITY_MEMBERS)
                .map_err(|e| Error::catalog(e.to_string()))?;
            members
                .insert(
                    parity_member_key(cur.id, &hash.0).as_slice(),
                    encode(&ParityMemberRow {
                        collection_id: cur.id,
                        plain_hash: hash.0,
                        is_parity: false,
                        tmp_data_compressed: Some(compressed_bytes),
                        position: cur.count,
                        flushed: false,
                    })?
                    .as_slice(),
                )
                .map_err(|e| Error::catalog(e.to_string()))?;
            drop(members);

            let mut hash_index = txn
                .open_table(PARITY_HASH_INDEX)
                .map_err(|e| Error::catalog(e.to_string()))?;
            hash_index
                .insert(hash.0.as_slice(), cur.id.to_be_bytes().as_slice())
                .map_err(|e| Error::catalog(e.to_string()))?;
            drop(hash_index);

            cur.count += 1;
            let mut meta_table = txn
                .open_table(PARITY_COLLECTION_META)
                .map_err(|e| Error::catalog(e.to_string()))?;
            meta_table
                .insert(
                    cur.id,
                    encode(&CollectionMeta {
                        count: cur.count,
                        closed: false,
                    })?
                    .as_slice(),
                )
                .map_err(|e| Error::catalog(e.to_string()))?;
            drop(meta_table);

            if cur.count >= data_shards {
                let mut ready = txn
                    .open_table(PARITY_READY_QUEUE)
                    .map_err(|e| Error::catalog(e.to_string()))?;
                ready.insert(cur.id, ()).map_err(|e| Error::catalog(e.to_string()))?;
                self.set_current_collection(txn, CurrentCollection { id: 0, count: 0 })?;
            } else {
                self.set_current_collection(txn, cur)?;
            }
            Ok(())
        })
    }

    /// `GetProcessingParityRelations`: collections in the ready queue
    /// (size N reached, or force-marked ready), each with its N member
    /// rows.
    pub fn get_processing_parity_relations(&self) -> Result<Vec<(u64, Vec<ParityMemberRow>)>> {
        let txn = self.db.begin_read().map_err(|e| Error::catalog(e.to_string()))?;
        let ready = txn
            .open_table(PARITY_READY_QUEUE)
            .map_err(|e| Error::catalog(e.to_string()))?;
        let members_table = txn
            .open_table(PARITY_MEMBERS)
            .map_err(|e| Error::catalog(e.to_string()))?;

        let mut out = Vec::new();
        for entry in ready.iter().map_err(|e| Error::catalog(e.to_string()))? {
            let (id_guard, _) = entry.map_err(|e| Error::catalog(e.to_string()))?;
            let collection_id = id_guard.value();
            let (start, end) = parity_collection_bounds(collection_id);
            let mut rows = Vec::new();
            for row in members_table
                .range(start.as_slice()..=end.as_slice())
                .map_err(|e| Error::catalog(e.to_string()))?
            {
                let (_, v) = row.map_err(|e| Error::catalog(e.to_string()))?;
                rows.push(decode::<ParityMemberRow>(v.value())?);
            }
            out.push((collection_id, rows));
        }
        Ok(out)
    }

    /// `ForceParityProcessingState`: marks the current partial
    /// collection ready even if it has fewer than N members.
    pub fn force_parity_processing_state(&self) -> Result<()> {
        self.run(|txn| {
            let cur = self.current_collection(txn)?;
            if cur.id != 0 && cur.count > 0 {
                let mut ready = txn
                    .open_table(PARITY_READY_QUEUE)
                    .map_err(|e| Error::catalog(e.to_string()))?;
                ready.insert(cur.id, ()).map_err(|e| Error::catalog(e.to_string()))?;
                drop(ready);
                self.set_current_collection(txn, CurrentCollection { id: 0, count: 0 })?;
            }
            Ok(())
        })
    }

    /// `CloseParityRelations`: writes M parity rows for `collection_id`
    /// and clears `tmp_data_compressed` on its N data rows.
    pub fn close_parity_relations(
        &self,
        collection_id: u64,
        expected_data_shards: u32,
        parity_hashes: &[PlainHash],
    ) -> Result<()> {
        self.run(|txn| {
            let meta = txn
                .open_table(PARITY_COLLECTION_META)
                .map_err(|e| Error::catalog(e.to_string()))?;
            let Some(meta_value) = meta.get(collection_id).map_err(|e| Error::catalog(e.to_string()))?
            else {
                return Err(Error::catalog(format!(
                    "unknown parity collection {collection_id}"
                )));
            };
            let collection_meta: CollectionMeta = decode(meta_value.value())?;
            drop(meta_value);
            drop(meta);
            if collection_meta.count != expected_data_shards {
                return Err(Error::catalog(format!(
                    "parity collection {collection_id} has {} data members, expected {expected_data_shards}",
                    collection_meta.count
                )));
            }

            let mut members = txn
                .open_table(PARITY_MEMBERS)
                .map_err(|e| Error::catalog(e.to_string()))?;
            let mut hash_index = txn
                .open_table(PARITY_HASH_INDEX)
                .map_err(|e| Error::catalog(e.to_string()))?;

            for (i, hash) in parity_hashes.iter().enumerate() {
                members
                    .insert(
                        parity_member_key(collection_id, &hash.0).as_slice(),
                        encode(&ParityMemberRow {
                            collection_id,
                            plain_hash: hash.0,
                            is_parity: true,
                            tmp_data_compressed: None,
                            position: i as u32,
                            flushed: false,
                        })?
                        .as_slice(),
                    )
                    .map_err(|e| Error::catalog(e.to_string()))?;
                hash_index
                    .insert(hash.0.as_slice(), collection_id.to_be_bytes().as_slice())
                    .map_err(|e| Error::catalog(e.to_string()))?;
            }

            let (start, end) = parity_collection_bounds(collection_id);
            let keys_to_clear: Vec<Vec<u8>> = members
                .range(start.as_slice()..=end.as_slice())
                .map_err(|e| Error::catalog(e.to_string()))?
                .filter_map(|r| r.ok())
                .filter_map(|(k, v)| {
                    let row: ParityMemberRow = decode(v.value()).ok()?;
                    (!row.is_parity).then(|| k.value().to_vec())
                })
                .collect();
            for key in keys_to_clear {
                if let Some(v) = members.get(key.as_slice()).map_err(|e| Error::catalog(e.to_string()))? {
                    let mut row: ParityMemberRow = decode(v.value())?;
                    drop(v);
                    row.tmp_data_compressed = None;
                    members
                        .insert(key.as_slice(), encode(&row)?.as_slice())
                        .map_err(|e| Error::catalog(e.to_string()))?;
                }
            }
            drop(members);
            drop(hash_index);

            let mut ready = txn
                .open_table(PARITY_READY_QUEUE)
                .map_err(|e| Error::catalog(e.to_string()))?;
            ready.remove(collection_id).map_err(|e| Error::catalog(e.to_string()))?;
            drop(ready);

            let mut meta_table = txn
                .open_table(PARITY_COLLECTION_META)
                .map_err(|e| Error::catalog(e.to_string()))?;
            meta_table
                .insert(
                    collection_id,
                    encode(&CollectionMeta {
                        count: collection_meta.count,
                        closed: true,
                    })?
                    .as_slice(),
                )
                .map_err(|e| Error::catalog(e.to_string()))?;
            Ok(())
        })
    }

    /// `GetParityRelationsForHash`: all N+M members of the collection
    /// containing `hash`.
    pub fn get_parity_relations_for_hash(&self, hash: PlainHash) -> Result<Vec<ParityMemberRow>> {
        let txn = self.db.begin_read().map_err(|e| Error::catalog(e.to_string()))?;
        let hash_index = txn
            .open_table(PARITY_HASH_INDEX)
            .map_err(|e| Error::catalog(e.to_string()))?;
        let Some(id_bytes) = hash_index
            .get(hash.as_ref().as_slice())
            .map_err(|e| Error::catalog(e.to_string()))?
        else {
            return Ok(Vec::new());
        };
        let mut id_buf = [0u8; 8];
        id_buf.copy_from_slice(id_bytes.value());
        let collection_id = u64::from_be_bytes(id_buf);

        let members_table = txn
            .open_table(PARITY_MEMBERS)
            .map_err(|e| Error::catalog(e.to_string()))?;
        let (start, end) = parity_collection_bounds(collection_id);
        let mut out = Vec::new();
        for row in members_table
            .range(start.as_slice()..=end.as_slice())
            .map_err(|e| Error::catalog(e.to_string()))?
        {
            let (_, v) = row.map_err(|e| Error::catalog(e.to_string()))?;
            out.push(decode::<ParityMemberRow>(v.value())?);
        }
        Ok(out)
    }

    // ---- Assurance log flush/fetch state ---------------------------

    pub fn flush_state(&self) -> Result<FlushState> {
        let txn = self.db.begin_read().map_err(|e| Error::catalog(e.to_string()))?;
        let kv = txn.open_table(KV).map_err(|e| Error::catalog(e.to_string()))?;
        match kv.get(KV_FLUSH_STATE).map_err(|e| Error::catalog(e.to_string()))? {
            Some(v) => decode(v.value()),
            None => Ok(FlushState::default()),
        }
    }

    fn write_flush_state(&self, txn: &WriteTransaction, state: &FlushState) -> Result<()> {
        let mut kv = txn.open_table(KV).map_err(|e| Error::catalog(e.to_string()))?;
        kv.insert(KV_FLUSH_STATE, encode(state)?.as_slice())
            .map_err(|e| Error::catalog(e.to_string()))?;
        Ok(())
    }

    pub fn last_fetched_assurance_id(&self) -> Result<Option<u64>> {
        Ok(self.flush_state()?.last_fetched_assurance_id)
    }

    pub fn get_all_assurances_fetched(&self) -> Result<bool> {
        Ok(self.flush_state()?.all_assurances_fetched)
    }

    pub fn set_all_assurances_fetched(&self) -> Result<()> {
        self.run(|txn| {
            let mut state = self.flush_state()?;
            state.all_assurances_fetched = true;
            self.write_flush_state(txn, &state)
        })
    }

    /// `AddFetchedAssurances`: records segments read back from the
    /// remote assurance log at `slot` (and `slot+1, slot+2, ...` for
    /// any later segments covering the continuation of the same
    /// aggregation — here one call corresponds to one slot).
    pub fn add_fetched_assurances(
        &self,
        segment: &vault_codec::AssuranceSegment,
        slot: u64,
    ) -> Result<()> {
        self.run(|txn| {
            for entry in &segment.segments {
                self.insert_assurance_row(
                    txn,
                    Identifier(entry.index_id),
                    &AssuranceRow {
                        replication: entry.replication,
                        plain_hash: entry.plain_hash,
                        length: entry.length,
                        slot: Some(slot),
                    },
                )?;
            }
            for relation in &segment.parity_relations {
                let mut members = txn
                    .open_table(PARITY_MEMBERS)
                    .map_err(|e| Error::catalog(e.to_string()))?;
                members
                    .insert(
                        parity_member_key(relation.collection_id, &relation.plain_hash).as_slice(),
                        encode(&ParityMemberRow {
                            collection_id: relation.collection_id,
                            plain_hash: relation.plain_hash,
                            is_parity: relation.is_parity,
                            tmp_data_compressed: None,
                            position: relation.position,
                            flushed: true,
                        })?
                        .as_slice(),
                    )
                    .map_err(|e| Error::catalog(e.to_string()))?;
                drop(members);
                let mut hash_index = txn
                    .open_table(PARITY_HASH_INDEX)
                    .map_err(|e| Error::catalog(e.to_string()))?;
                hash_index
                    .insert(
                        relation.plain_hash.as_slice(),
                        relation.collection_id.to_be_bytes().as_slice(),
                    )
                    .map_err(|e| Error::catalog(e.to_string()))?;
            }

            let mut state = self.flush_state()?;
            state.last_fetched_assurance_id = Some(slot);
            self.write_flush_state(txn, &state)
        })
    }

    /// `NewAggregatedAssuranceSegmentWithFlushState`: aggregates every
    /// not-yet-flushed (`slot == None`) assurance row, and every
    /// not-yet-flushed parity relation membership row (data *and*
    /// parity members alike — a fresh client that only ever replays the
    /// remote assurance log still needs to learn a data chunk's
    /// collection membership, not just a parity chunk's), into one
    /// logical `AssuranceSegment`. The caller (`vault-engine`) splits
    /// this into `SegmentSize`-bounded pieces via
    /// `AssuranceSegment::to_list_of_byte_arrays` and uploads them, then
    /// calls [`Self::mark_aggregation_flushed`] with the returned keys.
    /// Returns `None` when there is nothing pending.
    #[allow(clippy::type_complexity)]
    pub fn new_aggregated_assurance_segment_with_flush_state(
        &self,
    ) -> Result<Option<(vault_codec::AssuranceSegment, Vec<Identifier>, Vec<Vec<u8>>, FlushState)>> {
        let txn = self.db.begin_read().map_err(|e| Error::catalog(e.to_string()))?;
        let assurances = txn.open_table(ASSURANCES).map_err(|e| Error::catalog(e.to_string()))?;

        let mut entries = Vec::new();
        let mut pending_ids = Vec::new();
        for row in assurances.iter().map_err(|e| Error::catalog(e.to_string()))? {
            let (k, v) = row.map_err(|e| Error::catalog(e.to_string()))?;
            let assurance: AssuranceRow = decode(v.value())?;
            if assurance.slot.is_none() {
                let mut id = [0u8; 32];
                id.copy_from_slice(k.value());
                entries.push(vault_codec::wire::AssuranceEntry {
                    index_id: id,
                    replication: assurance.replication,
                    plain_hash: assurance.plain_hash,
                    length: assurance.length,
                });
                pending_ids.push(Identifier(id));
            }
        }

        let mut parity_relations = Vec::new();
        let mut pending_relation_keys = Vec::new();
        let members_table = txn
            .open_table(PARITY_MEMBERS)
            .map_err(|e| Error::catalog(e.to_string()))?;
        for row in members_table.iter().map_err(|e| Error::catalog(e.to_string()))? {
            let (k, v) = row.map_err(|e| Error::catalog(e.to_string()))?;
            let member: ParityMemberRow = decode(v.value())?;
            if !member.flushed {
                parity_relations.push(vault_codec::wire::ParityRelationEntry {
                    collection_id: member.collection_id,
                    plain_hash: member.plain_hash,
                    is_parity: member.is_parity,
                    position: member.position,
                });
                pending_relation_keys.push(k.value().to_vec());
            }
        }

        if entries.is_empty() && parity_relations.is_empty() {
            return Ok(None);
        }

        let state = self.flush_state()?;
        Ok(Some((
            vault_codec::AssuranceSegment {
                segments: entries,
                parity_relations,
            },
            pending_ids,
            pending_relation_keys,
            state,
        )))
    }

    /// Records how many of the `total` split pieces of the in-progress
    /// aggregation have been durably flushed so far.
    pub fn begin_pending_flush(&self, min_slot: u64, max_slot: u64) -> Result<()> {
        self.run(|txn| {
            let mut state = self.flush_state()?;
            state.pending_min_slot = Some(min_slot);
            state.pending_max_slot = Some(max_slot);
            state.flushed_count = 0;
            self.write_flush_state(txn, &state)
        })
    }

    pub fn increment_flushed_count(&self) -> Result<u32> {
        self.run(|txn| {
            let mut state = self.flush_state()?;
            state.flushed_count += 1;
            let count = state.flushed_count;
            self.write_flush_state(txn, &state)?;
            Ok(count)
        })
    }

    /// Marks the aggregation flushed: the pending rows (`pending_ids`)
    /// are stamped with `through_slot`, the pending parity relation
    /// rows (`pending_relation_keys`, as returned by
    /// [`Self::new_aggregated_assurance_segment_with_flush_state`]) are
    /// marked `flushed`, and the pending-range bookkeeping is cleared.
    pub fn mark_aggregation_flushed(
        &self,
        pending_ids: &[Identifier],
        pending_relation_keys: &[Vec<u8>],
        through_slot: u64,
    ) -> Result<()> {
        self.run(|txn| {
            let mut table = txn.open_table(ASSURANCES).map_err(|e| Error::catalog(e.to_string()))?;
            for id in pending_ids {
                if let Some(v) = table
                    .get(id.as_ref().as_slice())
                    .map_err(|e| Error::catalog(e.to_string()))?
                {
                    let mut row: AssuranceRow = decode(v.value())?;
                    drop(v);
                    row.slot = Some(through_slot);
                    table
                        .insert(id.as_ref().as_slice(), encode(&row)?.as_slice())
                        .map_err(|e| Error::catalog(e.to_string()))?;
                }
            }
            drop(table);

            let mut members = txn
                .open_table(PARITY_MEMBERS)
                .map_err(|e| Error::catalog(e.to_string()))?;
            for key in pending_relation_keys {
                if let Some(v) = members
                    .get(key.as_slice())
                    .map_err(|e| Error::catalog(e.to_string()))?
                {
                    let mut row: ParityMemberRow = decode(v.value())?;
                    drop(v);
                    row.flushed = true;
                    members
                        .insert(key.as_slice(), encode(&row)?.as_slice())
                        .map_err(|e| Error::catalog(e.to_string()))?;
                }
            }
            drop(members);

            let mut state = self.flush_state()?;
            state.pending_min_slot = None;
            state.pending_max_slot = None;
            state.flushed_count = 0;
            state.last_fetched_assurance_id = Some(
                state
                    .last_fetched_assurance_id
                    .map_or(through_slot, |prev| prev.max(through_slot)),
            );
            self.write_flush_state(txn, &state)
        })
    }

    // ---- Transient meta cache ---------------------------------------

    /// `CommandsInTransientCache`: all pending commands, optionally
    /// restricted to one path, ordered by `index` (and, if `path` is
    /// `None`, grouped by path in key order).
    pub fn commands_in_transient_cache(&self, path: Option<&str>) -> Result<Vec<PendingCommand>> {
        let txn = self.db.begin_read().map_err(|e| Error::catalog(e.to_string()))?;
        let table = txn
            .open_table(TRANSIENT_META)
            .map_err(|e| Error::catalog(e.to_string()))?;

        let mut out = Vec::new();
        match path {
            Some(p) => {
                let (start, end) = transient_path_bounds(p);
                for row in table
                    .range(start.as_slice()..=end.as_slice())
                    .map_err(|e| Error::catalog(e.to_string()))?
                {
                    let (_, v) = row.map_err(|e| Error::catalog(e.to_string()))?;
                    out.push(decode(v.value())?);
                }
            }
            None => {
                for row in table.iter().map_err(|e| Error::catalog(e.to_string()))? {
                    let (_, v) = row.map_err(|e| Error::catalog(e.to_string()))?;
                    out.push(decode(v.value())?);
                }
            }
        }
        Ok(out)
    }

    /// `MetaTypeAtPathInTransientCache`: the kind implied by the first
    /// cached command for `path`, if any.
    pub fn meta_type_at_path_in_transient_cache(&self, path: &str) -> Result<Option<PathKind>> {
        let commands = self.commands_in_transient_cache(Some(path))?;
        Ok(commands.first().map(PendingCommand::kind))
    }

    /// `AddCommandsToTransientCache`.
    pub fn add_commands_to_transient_cache(&self, commands: &[PendingCommand]) -> Result<()> {
        self.run(|txn| {
            let mut table = txn
                .open_table(TRANSIENT_META)
                .map_err(|e| Error::catalog(e.to_string()))?;
            for cmd in commands {
                table
                    .insert(
                        transient_key(&cmd.path, cmd.index).as_slice(),
                        encode(cmd)?.as_slice(),
                    )
                    .map_err(|e| Error::catalog(e.to_string()))?;
            }
            Ok(())
        })
    }

    /// `CommandsFlushedForPath`: removes every cached command for
    /// `path` whose index is `< index_smaller_than`, inside the given
    /// transaction (so callers can compose it with an assurance insert
    /// into one atomic unit — spec §4.11's `_inAssuranceAdditionTransaction`).
    pub fn commands_flushed_for_path_in_txn(
        &self,
        txn: &WriteTransaction,
        path: &str,
        index_smaller_than: u32,
    ) -> Result<()> {
        let (start, _) = transient_path_bounds(path);
        let end = transient_key(path, index_smaller_than.saturating_sub(1));
        let mut table = txn
            .open_table(TRANSIENT_META)
            .map_err(|e| Error::catalog(e.to_string()))?;
        if index_smaller_than == 0 {
            return Ok(());
        }
        let keys: Vec<Vec<u8>> = table
            .range(start.as_slice()..=end.as_slice())
            .map_err(|e| Error::catalog(e.to_string()))?
            .filter_map(|r| r.ok())
            .map(|(k, _)| k.value().to_vec())
            .collect();
        for key in keys {
            table.remove(key.as_slice()).map_err(|e| Error::catalog(e.to_string()))?;
        }
        Ok(())
    }

    pub fn commands_flushed_for_path(&self, path: &str, index_smaller_than: u32) -> Result<()> {
        self.run(|txn| self.commands_flushed_for_path_in_txn(txn, path, index_smaller_than))
    }

    /// Runs `f` inside one write transaction, committing on success.
    /// Used by `vault-engine::meta` to add an assurance row and clear
    /// the flushed transient commands atomically.
    pub fn in_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&WriteTransaction) -> Result<T>,
    {
        self.run(f)
    }

    /// Exposes the raw assurance-row insert for use inside a caller-held
    /// transaction (spec §4.11's atomic assurance-add + cache-clear).
    pub fn add_new_assurance_in_txn(
        &self,
        txn: &WriteTransaction,
        id: Identifier,
        replication: u32,
        hash: PlainHash,
        length: u32,
    ) -> Result<()> {
        self.insert_assurance_row(
            txn,
            id,
            &AssuranceRow {
                replication,
                plain_hash: hash.0,
                length,
                slot: None,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_codec::wire::AssuranceEntry;

    fn catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let cat = Catalog::open(
            &dir.path().join("catalog.redb"),
            CatalogConfig { parity_data_shards: 3 },
        )
        .unwrap();
        (dir, cat)
    }

    fn id(byte: u8) -> Identifier {
        Identifier([byte; 32])
    }

    fn hash(byte: u8) -> PlainHash {
        PlainHash([byte; 32])
    }

    #[test]
    fn find_by_index_id_round_trips() {
        let (_dir, cat) = catalog();
        cat.add_new_assurance(id(1), 0, hash(1), 1024).unwrap();
        let row = cat.find_assurance_by_index_id(id(1)).unwrap().unwrap();
        assert_eq!(row.replication, 0);
        assert_eq!(row.length, 1024);
        assert!(row.slot.is_none());
    }

    #[test]
    fn find_by_plain_hash_round_trips() {
        let (_dir, cat) = catalog();
        cat.add_new_assurance(id(2), 1, hash(2), 2048).unwrap();
        let (found_id, row) = cat.find_assurance_by_plain_hash(hash(2)).unwrap().unwrap();
        assert_eq!(found_id.0, id(2).0);
        assert_eq!(row.length, 2048);
    }

    #[test]
    fn data_assurance_closes_collection_at_n() {
        let (_dir, cat) = catalog();
        for i in 0..3u8 {
            cat.add_new_assurance_and_tmp_data(id(i), 0, hash(i), 10, vec![i; 10], 3)
                .unwrap();
        }
        let processing = cat.get_processing_parity_relations().unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].1.len(), 3);
        assert!(processing[0].1.iter().all(|m| !m.is_parity));
    }

    #[test]
    fn force_processing_closes_partial_collection() {
        let (_dir, cat) = catalog();
        cat.add_new_assurance_and_tmp_data(id(9), 0, hash(9), 10, vec![9; 10], 3)
            .unwrap();
        assert!(cat.get_processing_parity_relations().unwrap().is_empty());
        cat.force_parity_processing_state().unwrap();
        let processing = cat.get_processing_parity_relations().unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].1.len(), 1);
    }

    #[test]
    fn close_parity_relations_clears_tmp_data_and_adds_parity_rows() {
        let (_dir, cat) = catalog();
        for i in 0..3u8 {
            cat.add_new_assurance_and_tmp_data(id(i), 0, hash(i), 10, vec![i; 10], 3)
                .unwrap();
        }
        let (collection_id, _) = cat.get_processing_parity_relations().unwrap().into_iter().next().unwrap();
        cat.close_parity_relations(collection_id, 3, &[hash(100)]).unwrap();

        let members = cat.get_parity_relations_for_hash(hash(0)).unwrap();
        assert_eq!(members.len(), 4);
        assert!(members.iter().all(|m| !m.is_parity || m.plain_hash == hash(100).0));
        assert!(members
            .iter()
            .filter(|m| !m.is_parity)
            .all(|m| m.tmp_data_compressed.is_none()));

        assert!(cat.get_processing_parity_relations().unwrap().is_empty());
    }

    #[test]
    fn aggregation_returns_none_when_nothing_pending() {
        let (_dir, cat) = catalog();
        assert!(cat
            .new_aggregated_assurance_segment_with_flush_state()
            .unwrap()
            .is_none());
    }

    #[test]
    fn aggregation_collects_pending_rows_and_mark_flushed_stamps_slot() {
        let (_dir, cat) = catalog();
        cat.add_new_assurance(id(1), 0, hash(1), 10).unwrap();
        cat.add_new_assurance(id(2), 0, hash(2), 10).unwrap();

        let (segment, pending_ids, pending_relation_keys, _state) = cat
            .new_aggregated_assurance_segment_with_flush_state()
            .unwrap()
            .unwrap();
        assert_eq!(segment.segments.len(), 2);
        assert_eq!(pending_ids.len(), 2);

        cat.mark_aggregation_flushed(&pending_ids, &pending_relation_keys, 5).unwrap();
        assert!(cat
            .new_aggregated_assurance_segment_with_flush_state()
            .unwrap()
            .is_none());
        let row = cat.find_assurance_by_index_id(id(1)).unwrap().unwrap();
        assert_eq!(row.slot, Some(5));
    }

    #[test]
    fn add_fetched_assurances_advances_last_fetched_id() {
        let (_dir, cat) = catalog();
        let segment = vault_codec::AssuranceSegment {
            segments: vec![AssuranceEntry {
                index_id: [7u8; 32],
                replication: 0,
                plain_hash: [8u8; 32],
                length: 99,
            }],
            parity_relations: vec![],
        };
        cat.add_fetched_assurances(&segment, 3).unwrap();
        assert_eq!(cat.last_fetched_assurance_id().unwrap(), Some(3));
        let row = cat.find_assurance_by_index_id(Identifier([7u8; 32])).unwrap().unwrap();
        assert_eq!(row.slot, Some(3));
    }

    #[test]
    fn all_assurances_fetched_flag_round_trips() {
        let (_dir, cat) = catalog();
        assert!(!cat.get_all_assurances_fetched().unwrap());
        cat.set_all_assurances_fetched().unwrap();
        assert!(cat.get_all_assurances_fetched().unwrap());
    }

    #[test]
    fn transient_cache_orders_by_index_and_filters_by_path() {
        let (_dir, cat) = catalog();
        cat.add_commands_to_transient_cache(&[
            PendingCommand {
                path: "/a".into(),
                index: 1,
                command: Command::AddFile { name: "b".into(), size: 1 },
            },
            PendingCommand {
                path: "/a".into(),
                index: 0,
                command: Command::AddFolder { name: "child".into() },
            },
            PendingCommand {
                path: "/x".into(),
                index: 0,
                command: Command::AddFile { name: "y".into(), size: 2 },
            },
        ])
        .unwrap();

        let a_only = cat.commands_in_transient_cache(Some("/a")).unwrap();
        assert_eq!(a_only.len(), 2);
        assert_eq!(a_only[0].index, 0);
        assert_eq!(a_only[1].index, 1);

        assert_eq!(cat.commands_in_transient_cache(None).unwrap().len(), 3);
        assert_eq!(
            cat.meta_type_at_path_in_transient_cache("/a").unwrap(),
            Some(PathKind::Folder)
        );
    }

    #[test]
    fn commands_flushed_for_path_removes_only_lower_indices() {
        let (_dir, cat) = catalog();
        cat.add_commands_to_transient_cache(&[
            PendingCommand {
                path: "/f".into(),
                index: 0,
                command: Command::AddBlock { hash: [0; 32], size: 10, start: 0 },
            },
            PendingCommand {
                path: "/f".into(),
                index: 1,
                command: Command::AddBlock { hash: [1; 32], size: 10, start: 10 },
            },
        ])
        .unwrap();
        cat.commands_flushed_for_path("/f", 1).unwrap();
        let remaining = cat.commands_in_transient_cache(Some("/f")).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].index, 1);
    }

    #[test]
    fn path_prefix_scan_does_not_leak_across_similar_paths() {
        let (_dir, cat) = catalog();
        cat.add_commands_to_transient_cache(&[
            PendingCommand {
                path: "/a".into(),
                index: 0,
                command: Command::AddFolder { name: "x".into() },
            },
            PendingCommand {
                path: "/ab".into(),
                index: 0,
                command: Command::AddFolder { name: "y".into() },
            },
        ])
        .unwrap();
        assert_eq!(cat.commands_in_transient_cache(Some("/a")).unwrap().len(), 1);
        assert_eq!(cat.commands_in_transient_cache(Some("/ab")).unwrap().len(), 1);
    }
}
