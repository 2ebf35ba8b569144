//! End-to-end coverage of the upload, flush, load and download paths
//! over the in-memory mock transport: a fresh engine reading back what
//! another engine wrote, namespace rules, parity repair and
//! deduplicated concurrent downloads.

use std::sync::Arc;

use tempfile::tempdir;
use vault_common::config::{ParityConfig, PoolConfig};
use vault_common::{Error, VaultConfig};
use vault_engine::{Engine, MetaNode};
use vault_transport::{MockServiceFactory, ServiceFactory};

// 128 bytes is the smallest segment size that still leaves comfortable
// headroom for zstd's worst-case expansion of incompressible input plus
// framing overhead (`vault_codec::segment::max_plain_chunk_size(128)`
// admits 56 raw bytes per chunk) while staying small enough for these
// tests' tiny payloads to still split across multiple chunks.
fn test_config(data_shards: u32, parity_shards: u32) -> VaultConfig {
    VaultConfig {
        segment_size: 128,
        parity: ParityConfig {
            data_shards,
            parity_shards,
        },
        replication_attempt_count: 2,
        assurance_replication_default_count: 1,
        assurance_replication_search_count: 2,
        pool: PoolConfig { total: 4, upload: 2 },
        chunk_cache_capacity: 16,
        meta_download_concurrency: 4,
        upload_inflight_bytes: 256,
    }
}

fn open_engine(dir: &std::path::Path, factory: Arc<dyn ServiceFactory>, config: VaultConfig) -> Engine {
    Engine::open(dir, "end-to-end-storage-code", "correct horse battery staple", config, factory)
        .expect("credentials and config are valid")
}

#[tokio::test]
async fn empty_directory_created_on_one_engine_is_visible_on_another() {
    let mock = Arc::new(MockServiceFactory::new());
    let factory: Arc<dyn ServiceFactory> = mock.clone();
    let config = test_config(4, 1);

    let dir_a = tempdir().unwrap();
    let engine_a = open_engine(dir_a.path(), factory.clone(), config);
    engine_a.load().await.unwrap();
    assert!(engine_a.download_meta_for_path("/").await.unwrap().is_none());

    engine_a.new_directory("/photos").await.unwrap();
    engine_a.flush_meta().await.unwrap();
    engine_a.flush_assurances().await.unwrap();

    let dir_b = tempdir().unwrap();
    let engine_b = open_engine(dir_b.path(), factory, config);
    engine_b.load().await.unwrap();

    let node = engine_b
        .download_meta_for_path("/photos")
        .await
        .unwrap()
        .expect("a fresh engine sharing the same transport sees the flushed directory");
    assert_eq!(node, MetaNode::Folder { children: Vec::new() });
}

#[tokio::test]
async fn single_file_round_trips_through_a_fresh_engine_after_flush() {
    let mock = Arc::new(MockServiceFactory::new());
    let factory: Arc<dyn ServiceFactory> = mock.clone();
    let config = test_config(4, 1);

    let dir_a = tempdir().unwrap();
    let engine_a = open_engine(dir_a.path(), factory.clone(), config);
    engine_a.load().await.unwrap();

    // segment_size 128 admits at most 56 raw bytes per chunk
    // (`max_plain_chunk_size`, headroom for compression expansion plus
    // framing); 188 bytes splits into four chunks (56, 56, 56, 20),
    // closing one parity collection on its own (data_shards=4).
    let payload: Vec<u8> = (0u8..188).collect();
    engine_a.upload_file_bytes(&payload, "/docs/report.bin").await.unwrap();
    engine_a.force_flush_parity().await.unwrap();
    engine_a.flush_meta().await.unwrap();
    engine_a.flush_assurances().await.unwrap();

    let dir_b = tempdir().unwrap();
    let engine_b = open_engine(dir_b.path(), factory, config);
    engine_b.load().await.unwrap();

    let node = engine_b
        .download_meta_for_path("/docs/report.bin")
        .await
        .unwrap()
        .expect("file is visible to a fresh engine");
    let MetaNode::File { size, blocks } = node else {
        panic!("'/docs/report.bin' should resolve to a file");
    };
    assert_eq!(size, payload.len() as u64);
    assert_eq!(blocks.len(), 4);
    assert!(blocks.windows(2).all(|w| w[0].start < w[1].start));

    let mut reconstructed = vec![0u8; size as usize];
    for block in &blocks {
        let id = engine_b.generator().raw_or_parity_id(block.hash);
        let bytes = engine_b.download_chunk(id, true).await.unwrap();
        let start = block.start as usize;
        reconstructed[start..start + bytes.len()].copy_from_slice(&bytes);
    }
    assert_eq!(reconstructed, payload);
}

#[tokio::test]
async fn re_uploading_to_an_existing_file_path_is_rejected() {
    let mock = Arc::new(MockServiceFactory::new());
    let factory: Arc<dyn ServiceFactory> = mock.clone();
    let config = test_config(4, 1);
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), factory, config);
    engine.load().await.unwrap();

    engine.upload_file_bytes(b"first version", "/notes.txt").await.unwrap();

    let err = engine
        .upload_file_bytes(b"second version", "/notes.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MetaEntryOverwrite(_)));
}

#[tokio::test]
async fn namespace_disjointness_holds_in_both_directions() {
    let mock = Arc::new(MockServiceFactory::new());
    let factory: Arc<dyn ServiceFactory> = mock.clone();
    let config = test_config(4, 1);
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), factory, config);
    engine.load().await.unwrap();

    engine.new_directory("/archive").await.unwrap();
    engine
        .upload_file_bytes(b"quarterly totals", "/report.bin")
        .await
        .unwrap();

    let folder_as_file = engine
        .upload_file_bytes(b"oops", "/archive")
        .await
        .unwrap_err();
    assert!(matches!(folder_as_file, Error::MetaEntryOverwrite(_)));

    let file_as_folder = engine.new_directory("/report.bin").await.unwrap_err();
    assert!(matches!(file_as_folder, Error::MetaEntryOverwrite(_)));
}

#[tokio::test]
async fn parity_repair_recovers_a_single_deleted_data_blob() {
    let mock = Arc::new(MockServiceFactory::new());
    let factory: Arc<dyn ServiceFactory> = mock.clone();
    let config = test_config(3, 1);
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), factory, config);
    engine.load().await.unwrap();

    let chunks: [&[u8]; 3] = [b"alpha-data-shard", b"bravo-data-shard", b"charlie-shard!!!"];
    let mut origins = Vec::new();
    for (i, chunk) in chunks.into_iter().enumerate() {
        origins.push(engine.upload_file_chunk(chunk, (i * 16) as u64).await.unwrap());
    }
    engine.force_flush_parity().await.unwrap();
    engine.flush_assurances().await.unwrap();

    let victim_id = engine.generator().raw_or_parity_id(origins[0].hash);
    mock.delete(engine.generator().derive_locator(victim_id, 0));

    let recovered = engine.download_chunk(victim_id, true).await.unwrap();
    assert_eq!(recovered, chunks[0]);
}

#[tokio::test]
async fn parity_repair_fails_once_deletions_exceed_the_parity_budget() {
    let mock = Arc::new(MockServiceFactory::new());
    let factory: Arc<dyn ServiceFactory> = mock.clone();
    let config = test_config(3, 1);
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), factory, config);
    engine.load().await.unwrap();

    let chunks: [&[u8]; 3] = [b"alpha-data-shard", b"bravo-data-shard", b"charlie-shard!!!"];
    let mut origins = Vec::new();
    for (i, chunk) in chunks.into_iter().enumerate() {
        origins.push(engine.upload_file_chunk(chunk, (i * 16) as u64).await.unwrap());
    }
    engine.force_flush_parity().await.unwrap();
    engine.flush_assurances().await.unwrap();

    // One parity shard tolerates exactly one lost member; losing two
    // data shards out of three exceeds that budget.
    let id0 = engine.generator().raw_or_parity_id(origins[0].hash);
    let id1 = engine.generator().raw_or_parity_id(origins[1].hash);
    mock.delete(engine.generator().derive_locator(id0, 0));
    mock.delete(engine.generator().derive_locator(id1, 0));

    let err = engine.download_chunk(id0, true).await.unwrap_err();
    assert!(matches!(err, Error::NotEnoughParity { .. }));
}

#[tokio::test]
async fn concurrent_downloads_of_the_same_chunk_single_flight_through_transport() {
    let mock = Arc::new(MockServiceFactory::new());
    let factory: Arc<dyn ServiceFactory> = mock.clone();
    let config = test_config(4, 1);
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), factory, config);
    engine.load().await.unwrap();

    let origin = engine
        .upload_file_chunk(b"shared payload bytes", 0)
        .await
        .unwrap();
    let id = engine.generator().raw_or_parity_id(origin.hash);

    let before = mock.get_body_call_count();
    let handles: Vec<_> = (0..32)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.download_chunk(id, true).await })
        })
        .collect();

    for handle in handles {
        let bytes = handle.await.unwrap().unwrap();
        assert_eq!(bytes, b"shared payload bytes".to_vec());
    }
    assert_eq!(mock.get_body_call_count() - before, 1);
}
