//! Chunked dump writer, reader and deleter over the in-memory object store.

mod common;

use common::{incompressible, numbered_item, MemStore};
use dyndump::store::{meta_key, part_prefix};
use dyndump::{
    DumpDeleter, DumpError, DumpReader, DumpStatus, DumpWriter, ItemWriter, JsonItemEncoder,
    Metadata, MIN_PART_SIZE,
};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

const BUCKET: &str = "bucket";
const PREFIX: &str = "backups/orders";

fn gunzip(bytes: &[u8]) -> Vec<u8> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).unwrap();
    out
}

fn sha_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn part_key(number: u32) -> String {
    format!("{}{:09}.json.gz", part_prefix(PREFIX), number)
}

fn stored_metadata(store: &MemStore) -> Metadata {
    let object = store.object(&meta_key(PREFIX)).expect("metadata object");
    serde_json::from_slice(&object.body).unwrap()
}

fn seed_metadata() -> Metadata {
    Metadata::new("orders", "arn:aws:dynamodb:us-east-1:123456789012:table/orders")
}

/// Run a writer to completion while feeding it pre-encoded records.
async fn write_dump(store: Arc<MemStore>, max_parallel: usize, records: Vec<Vec<u8>>) {
    let writer = Arc::new(
        DumpWriter::new(store, BUCKET, PREFIX, seed_metadata())
            .with_part_size(MIN_PART_SIZE)
            .with_max_parallel(max_parallel),
    );
    let feeder = {
        let writer = writer.clone();
        async move {
            for record in records {
                writer.write(record).await.unwrap();
            }
            writer.close().unwrap();
        }
    };
    let (outcome, ()) = tokio::join!(writer.run(), feeder);
    outcome.unwrap();
}

#[tokio::test]
async fn test_single_part_dump_of_three_items() {
    let store = Arc::new(MemStore::new());
    let writer = Arc::new(
        DumpWriter::new(store.clone(), BUCKET, PREFIX, seed_metadata())
            .with_part_size(MIN_PART_SIZE)
            .with_max_parallel(1),
    );
    let encoder = JsonItemEncoder::new(writer.clone());
    let feeder = {
        let writer = writer.clone();
        async move {
            for n in 1..=3 {
                encoder.write_item(&numbered_item(n)).await.unwrap();
            }
            writer.close().unwrap();
        }
    };
    let (outcome, ()) = tokio::join!(writer.run(), feeder);
    outcome.unwrap();

    assert_eq!(store.keys(), vec![meta_key(PREFIX), part_key(1)]);

    let part = store.object(&part_key(1)).unwrap();
    assert_eq!(part.content_type, "application/json");
    assert_eq!(part.content_encoding.as_deref(), Some("gzip"));

    let payload = gunzip(&part.body);
    let expected_payload = "{\"k\":{\"N\":\"1\"}}\n{\"k\":{\"N\":\"2\"}}\n{\"k\":{\"N\":\"3\"}}\n";
    assert_eq!(payload, expected_payload.as_bytes());

    let part_hash = sha_hex(payload.as_slice());
    assert_eq!(part.metadata["dyndump-sha256"], part_hash);
    assert_eq!(part.metadata["dyndump-itemcount"], "3");
    assert_eq!(part.metadata["dyndump-part"], "1");

    let metadata = stored_metadata(&store);
    assert_eq!(metadata.status, DumpStatus::Completed);
    assert!(metadata.end_time.is_some());
    assert_eq!(metadata.part_count, 1);
    assert_eq!(metadata.item_count, 3);
    assert_eq!(metadata.last_hashed, 1);
    assert_eq!(metadata.uncompressed_bytes, expected_payload.len() as i64);
    assert_eq!(metadata.compressed_bytes, part.body.len() as i64);
    assert_eq!(metadata.hash, sha_hex(format!("{part_hash}\n").as_bytes()));
}

#[tokio::test]
async fn test_four_part_dump_with_parallel_uploads() {
    let store = Arc::new(MemStore::new());
    let records: Vec<Vec<u8>> = (0..4).map(|n| incompressible(1500, n + 1)).collect();
    write_dump(store.clone(), 2, records.clone()).await;

    // every record compresses above the part size, so each is its own part
    let part_keys: Vec<String> = (1..=4).map(part_key).collect();
    let mut expected_keys = part_keys.clone();
    expected_keys.insert(0, meta_key(PREFIX));
    expected_keys.sort();
    assert_eq!(store.keys(), expected_keys);

    // each part's stored hash matches its own uncompressed body
    let mut part_hashes = Vec::new();
    let mut payloads = Vec::new();
    for key in &part_keys {
        let part = store.object(key).unwrap();
        let payload = gunzip(&part.body);
        let hash = sha_hex(&payload);
        assert_eq!(part.metadata["dyndump-sha256"], hash, "for {key}");
        part_hashes.push(hash);
        payloads.push(payload);
    }

    // upload order raced, but the parts are exactly the records
    let mut sorted_payloads = payloads.clone();
    sorted_payloads.sort();
    let mut sorted_records = records;
    sorted_records.sort();
    assert_eq!(sorted_payloads, sorted_records);

    // the aggregate hash folds part hashes in part-number order
    let metadata = stored_metadata(&store);
    assert_eq!(metadata.status, DumpStatus::Completed);
    assert_eq!(metadata.part_count, 4);
    assert_eq!(metadata.item_count, 4);
    assert_eq!(metadata.last_hashed, 4);
    assert_eq!(metadata.uncompressed_bytes, 4 * 1500_i64);
    let joined: String = part_hashes.iter().map(|hash| format!("{hash}\n")).collect();
    assert_eq!(metadata.hash, sha_hex(joined.as_bytes()));

    // the reader observes the parts' bytes concatenated in part order
    let reader = DumpReader::new(store.clone(), BUCKET, PREFIX);
    let mut stream = reader.open().await.unwrap();
    let mut restored = Vec::new();
    stream.read_to_end(&mut restored).await.unwrap();
    assert_eq!(restored, payloads.concat());
}

#[tokio::test]
async fn test_writer_rejects_bad_tunables() {
    let store = Arc::new(MemStore::new());
    let writer = DumpWriter::new(store.clone(), BUCKET, PREFIX, seed_metadata())
        .with_part_size(MIN_PART_SIZE - 1);
    assert!(matches!(
        writer.run().await,
        Err(DumpError::InvalidConfig(_))
    ));

    let writer = DumpWriter::new(store, BUCKET, PREFIX, seed_metadata()).with_max_parallel(0);
    assert!(matches!(
        writer.run().await,
        Err(DumpError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_writer_abort_marks_dump_failed() {
    let store = Arc::new(MemStore::new());
    let writer = DumpWriter::new(store.clone(), BUCKET, PREFIX, seed_metadata())
        .with_part_size(MIN_PART_SIZE);
    writer.abort();
    let outcome = writer.run().await;
    assert_eq!(outcome, Err(DumpError::Aborted));

    let metadata = stored_metadata(&store);
    assert_eq!(metadata.status, DumpStatus::Failed);
    assert!(metadata.end_time.is_some());
    assert_eq!(metadata.part_count, 0);
}

#[tokio::test]
async fn test_writer_latches_first_upload_failure() {
    let store = Arc::new(MemStore::new().with_put_failure("-part-"));
    let writer = Arc::new(
        DumpWriter::new(store.clone(), BUCKET, PREFIX, seed_metadata())
            .with_part_size(MIN_PART_SIZE)
            .with_max_parallel(1),
    );
    let feeder = {
        let writer = writer.clone();
        async move {
            let mut write_error = None;
            for n in 0..10 {
                if let Err(err) = writer.write(incompressible(1500, n + 100)).await {
                    write_error = Some(err);
                    break;
                }
            }
            let close_error = writer.close().err();
            (write_error, close_error)
        }
    };
    let (outcome, (write_error, close_error)) = tokio::join!(writer.run(), feeder);

    let run_error = outcome.unwrap_err();
    assert!(matches!(run_error, DumpError::Storage(_)));
    assert!(write_error.is_some() || close_error.is_some());

    let metadata = stored_metadata(&store);
    assert_eq!(metadata.status, DumpStatus::Failed);
    assert_eq!(metadata.part_count, 0);
}

#[tokio::test]
async fn test_reader_metadata_accessor() {
    let store = Arc::new(MemStore::new());
    write_dump(store.clone(), 1, vec![b"{\"k\":{\"N\":\"1\"}}\n".to_vec()]).await;

    let reader = DumpReader::new(store, BUCKET, PREFIX);
    let metadata = reader.metadata().await.unwrap();
    assert_eq!(metadata.table_name, "orders");
    assert_eq!(metadata.item_count, 1);
    // second call is served from cache and stays coherent
    assert_eq!(reader.metadata().await.unwrap(), metadata);
}

#[tokio::test]
async fn test_reader_missing_dump_is_not_found() {
    let store = Arc::new(MemStore::new());
    let reader = DumpReader::new(store, BUCKET, PREFIX);
    assert!(reader.metadata().await.unwrap_err().is_not_found());
}

async fn read_until_error(store: Arc<MemStore>) -> (Vec<u8>, DumpError) {
    let reader = DumpReader::new(store, BUCKET, PREFIX);
    let mut stream = reader.open().await.unwrap();
    let mut collected = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => panic!("expected the stream to fail, got clean EOF"),
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(err) => {
                let dump_error = err
                    .get_ref()
                    .and_then(|inner| inner.downcast_ref::<DumpError>())
                    .cloned()
                    .expect("typed dump error");
                return (collected, dump_error);
            }
        }
    }
}

#[tokio::test]
async fn test_reader_detects_tampered_part_hash() {
    let store = Arc::new(MemStore::new());
    let records: Vec<Vec<u8>> = (0..3).map(|n| incompressible(1500, n + 10)).collect();
    write_dump(store.clone(), 1, records.clone()).await;

    store.set_metadata_header(&part_key(2), "dyndump-sha256", &"0".repeat(64));

    let (collected, error) = read_until_error(store.clone()).await;
    match error {
        DumpError::PartHashMismatch { key, expected, actual } => {
            assert_eq!(key, part_key(2));
            assert_eq!(expected, "0".repeat(64));
            assert_eq!(actual.len(), 64);
        }
        other => panic!("expected part hash mismatch, got {other:?}"),
    }
    // the first part's bytes were yielded before the mismatch
    let first_payload = gunzip(&store.object(&part_key(1)).unwrap().body);
    assert!(collected.starts_with(&first_payload));
}

#[tokio::test]
async fn test_reader_skip_integrity_check_ignores_tampering() {
    let store = Arc::new(MemStore::new());
    write_dump(store.clone(), 1, vec![incompressible(1500, 42)]).await;
    store.set_metadata_header(&part_key(1), "dyndump-sha256", &"0".repeat(64));

    let reader = DumpReader::new(store, BUCKET, PREFIX).with_skip_integrity_check(true);
    let mut stream = reader.open().await.unwrap();
    let mut restored = Vec::new();
    stream.read_to_end(&mut restored).await.unwrap();
    assert_eq!(restored.len(), 1500);
}

#[tokio::test]
async fn test_reader_detects_missing_part() {
    let store = Arc::new(MemStore::new());
    let records: Vec<Vec<u8>> = (0..3).map(|n| incompressible(1500, n + 20)).collect();
    write_dump(store.clone(), 1, records).await;

    store.remove(&part_key(2));

    let (_, error) = read_until_error(store).await;
    assert_eq!(
        error,
        DumpError::IncompleteDump {
            expected: 3,
            found: 2
        }
    );
}

#[tokio::test]
async fn test_reader_detects_corrupt_aggregate_hash() {
    let store = Arc::new(MemStore::new());
    write_dump(store.clone(), 1, vec![incompressible(1500, 7)]).await;

    let mut metadata = stored_metadata(&store);
    metadata.hash = "f".repeat(64);
    store.insert_raw(&meta_key(PREFIX), &serde_json::to_vec_pretty(&metadata).unwrap());

    let (_, error) = read_until_error(store).await;
    match error {
        DumpError::AggregateHashMismatch { expected, actual } => {
            assert_eq!(expected, "f".repeat(64));
            assert_eq!(actual.len(), 64);
        }
        other => panic!("expected aggregate hash mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_deleter_removes_parts_then_metadata_leaving_siblings() {
    let store = Arc::new(MemStore::new());
    let records: Vec<Vec<u8>> = (0..4).map(|n| incompressible(1500, n + 30)).collect();
    write_dump(store.clone(), 2, records).await;

    // unrelated sibling under the same prefix, plus a near-miss part name
    store.insert_raw(&format!("{PREFIX}-other.json"), b"keep me");
    store.insert_raw(&format!("{}0001.json.gz", part_prefix(PREFIX)), b"keep me too");

    let deleter = DumpDeleter::new(store.clone(), BUCKET, PREFIX).await.unwrap();
    assert_eq!(deleter.metadata().part_count, 4);
    deleter.delete().await.unwrap();
    assert_eq!(deleter.completed(), 4);

    let mut remaining = store.keys();
    remaining.sort();
    assert_eq!(
        remaining,
        vec![
            format!("{PREFIX}-other.json"),
            format!("{}0001.json.gz", part_prefix(PREFIX)),
        ]
    );
}

#[tokio::test]
async fn test_deleter_paginates_listings() {
    let store = Arc::new(MemStore::new().with_page_size(1));
    let records: Vec<Vec<u8>> = (0..3).map(|n| incompressible(1500, n + 40)).collect();
    write_dump(store.clone(), 1, records).await;

    let deleter = DumpDeleter::new(store.clone(), BUCKET, PREFIX).await.unwrap();
    deleter.delete().await.unwrap();
    assert_eq!(deleter.completed(), 3);
    assert!(store.keys().is_empty());
}

#[tokio::test]
async fn test_deleter_requires_existing_dump() {
    let store = Arc::new(MemStore::new());
    let result = DumpDeleter::new(store, BUCKET, PREFIX).await;
    assert!(result.err().unwrap().is_not_found());
}

#[tokio::test]
async fn test_deleter_abort_keeps_metadata() {
    let store = Arc::new(MemStore::new());
    write_dump(store.clone(), 1, vec![incompressible(1500, 50)]).await;

    let deleter = DumpDeleter::new(store.clone(), BUCKET, PREFIX).await.unwrap();
    deleter.abort();
    deleter.delete().await.unwrap();
    assert_eq!(deleter.completed(), 0);
    assert!(store.object(&meta_key(PREFIX)).is_some());
}
