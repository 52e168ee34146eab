//! Chunked part writer
//!
//! A [`DumpWriter`] accepts an append-only stream of records (one encoded
//! item per `write` call) and uploads it as gzip parts of bounded size. Part
//! boundaries fall between records, never inside one: workers check the
//! on-disk size threshold only after finishing a record, which is what keeps
//! per-line JSON parsing possible on the read side.
//!
//! Each worker owns a temp file holding the gzip stream of its part in
//! progress plus a running SHA-256 of the uncompressed record bytes. When the
//! file reaches the part size the worker allocates the next part number,
//! uploads the file with the hash and item count in the object's user
//! metadata, then folds the hash into the dump-wide digest and rewrites the
//! metadata descriptor. Uploads race at the part-number allocator, so parts
//! may complete out of order; the [`HashFolder`] keeps the aggregate hash
//! deterministic regardless.

use crate::error::{DumpError, Result};
use crate::store::hash::HashFolder;
use crate::store::metadata::{BackupType, DumpStatus, Metadata};
use crate::store::{
    meta_key, part_key, ObjectPut, ObjectPuter, DEFAULT_MAX_PARALLEL, DEFAULT_PART_SIZE,
    META_ITEM_COUNT, META_PART_NUMBER, META_SHA256, MIN_PART_SIZE,
};
use bytes::Bytes;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Takes a stream of encoded records and uploads it in parallel as bounded
/// gzip parts under a key prefix, maintaining a live metadata descriptor.
///
/// Drive it with `run()` in one task while another feeds `write()` and
/// finally `close()`:
///
/// ```ignore
/// let writer = DumpWriter::new(store, "bucket", "backups/orders", metadata);
/// let (outcome, _) = tokio::join!(writer.run(), async {
///     for record in records {
///         writer.write(record).await?;
///     }
///     writer.close()
/// });
/// ```
pub struct DumpWriter<S> {
    store: S,
    bucket: String,
    prefix: String,
    part_size: usize,
    max_parallel: usize,
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    part_counter: AtomicU32,
    state: tokio::sync::Mutex<WriterState>,
    failure: Mutex<Option<DumpError>>,
}

struct WriterState {
    metadata: Metadata,
    folder: HashFolder,
}

struct PartPayload {
    compressed: Vec<u8>,
    hash_hex: String,
    raw_bytes: i64,
    item_count: i64,
    compressed_bytes: i64,
}

impl<S: ObjectPuter> DumpWriter<S> {
    /// Create a writer for a new dump under `prefix`. The seed metadata
    /// carries the table identity; status, timestamps and counters are
    /// reset here.
    pub fn new(
        store: S,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        mut metadata: Metadata,
    ) -> Self {
        metadata.status = DumpStatus::Running;
        metadata.backup_type = BackupType::Full;
        metadata.start_time = Utc::now();
        metadata.end_time = None;
        metadata.uncompressed_bytes = 0;
        metadata.compressed_bytes = 0;
        metadata.item_count = 0;
        metadata.part_count = 0;
        metadata.hash = String::new();
        metadata.last_hashed = 0;

        let (tx, rx) = mpsc::channel(1);
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
            part_size: DEFAULT_PART_SIZE,
            max_parallel: DEFAULT_MAX_PARALLEL,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(Some(rx)),
            part_counter: AtomicU32::new(0),
            state: tokio::sync::Mutex::new(WriterState {
                metadata,
                folder: HashFolder::new(),
            }),
            failure: Mutex::new(None),
        }
    }

    /// Maximum compressed bytes per part. Validated by `run`.
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    /// Number of concurrent part uploads. Validated by `run`.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    /// Start the part workers and block until `close` (or `abort`) has been
    /// called and the buffered tails are flushed. Returns the terminal error,
    /// if any.
    pub async fn run(&self) -> Result<()> {
        if self.part_size < MIN_PART_SIZE {
            return Err(DumpError::InvalidConfig(format!(
                "part size {} is below minimum {MIN_PART_SIZE}",
                self.part_size
            )));
        }
        if self.max_parallel < 1 {
            return Err(DumpError::InvalidConfig(
                "max_parallel must be 1 or greater".into(),
            ));
        }
        let rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| DumpError::InvalidConfig("writer already run".into()))?;

        {
            let state = self.state.lock().await;
            self.flush_metadata(&state.metadata).await?;
        }

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        futures::future::join_all((0..self.max_parallel).map(|_| self.worker(rx.clone()))).await;

        let mut state = self.state.lock().await;
        state.metadata.end_time = Some(Utc::now());
        if let Some(err) = self.fail_error() {
            state.metadata.status = DumpStatus::Failed;
            if let Err(flush_err) = self.flush_metadata(&state.metadata).await {
                warn!(error = %flush_err, "failed to record dump failure in metadata");
            }
            return Err(err);
        }
        state.metadata.status = DumpStatus::Completed;
        self.flush_metadata(&state.metadata).await
    }

    /// Append one logical record (a single encoded item) to the stream.
    /// Returns the latched error once an upload has permanently failed.
    pub async fn write(&self, record: Vec<u8>) -> Result<()> {
        if let Some(err) = self.fail_error() {
            return Err(err);
        }
        let sender = self.tx.lock().unwrap().clone();
        let Some(sender) = sender else {
            return Err(DumpError::InvalidConfig("writer closed".into()));
        };
        if sender.send(record).await.is_err() {
            return Err(self
                .fail_error()
                .unwrap_or_else(|| DumpError::Storage("part workers exited".into())));
        }
        Ok(())
    }

    /// Signal end of input. Workers flush their buffered tail parts and
    /// `run` returns. Reports the latched error, if any.
    pub fn close(&self) -> Result<()> {
        self.tx.lock().unwrap().take();
        match self.fail_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Mark the dump failed and unblock `close`/`run`. The metadata
    /// descriptor is rewritten with a failed status before `run` returns.
    pub fn abort(&self) {
        self.fail(DumpError::Aborted);
        self.tx.lock().unwrap().take();
    }

    /// Latch the first failure; later records are dropped by the workers.
    fn fail(&self, err: DumpError) {
        let mut slot = self.failure.lock().unwrap();
        if slot.is_none() {
            if !err.is_aborted() {
                warn!(error = %err, "dump writer failed");
            }
            *slot = Some(err);
        }
    }

    fn fail_error(&self) -> Option<DumpError> {
        self.failure.lock().unwrap().clone()
    }

    async fn worker(&self, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>) {
        let mut part = match PartBuffer::new(self.part_size / 10) {
            Ok(part) => part,
            Err(err) => {
                self.fail(err.into());
                return;
            }
        };

        loop {
            let record = { rx.lock().await.recv().await };
            let Some(record) = record else {
                break; // input closed
            };
            if self.fail_error().is_some() {
                continue; // drain and drop after a failure
            }
            if let Err(err) = part.write_record(&record) {
                self.fail(err.into());
                continue;
            }
            let on_disk = match part.disk_len() {
                Ok(len) => len,
                Err(err) => {
                    self.fail(err.into());
                    continue;
                }
            };
            if on_disk >= self.part_size as u64 {
                if let Err(err) = self.flush_part(&mut part).await {
                    self.fail(err);
                }
            }
        }

        if part.item_count > 0 && self.fail_error().is_none() {
            if let Err(err) = self.flush_part(&mut part).await {
                self.fail(err);
            }
        }
    }

    /// Upload the buffered part and fold it into the dump totals. The
    /// buffer is replaced with a fresh temp file for the next part.
    async fn flush_part(&self, part: &mut PartBuffer) -> Result<()> {
        let fresh = PartBuffer::new(self.part_size / 10)?;
        let PartPayload {
            compressed,
            hash_hex,
            raw_bytes,
            item_count,
            compressed_bytes,
        } = std::mem::replace(part, fresh).finish()?;

        let part_number = self.part_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let key = part_key(&self.prefix, part_number);

        let mut metadata = HashMap::new();
        metadata.insert(META_SHA256.to_string(), hash_hex.clone());
        metadata.insert(META_ITEM_COUNT.to_string(), item_count.to_string());
        metadata.insert(META_PART_NUMBER.to_string(), part_number.to_string());

        debug!(
            part = part_number,
            key = %key,
            items = item_count,
            raw_bytes,
            compressed_bytes,
            "uploading part"
        );
        self.store
            .put_object(
                &self.bucket,
                &key,
                ObjectPut {
                    body: Bytes::from(compressed),
                    content_type: "application/json".into(),
                    content_encoding: Some("gzip".into()),
                    metadata,
                },
            )
            .await?;

        self.complete_part(part_number, hash_hex, raw_bytes, item_count, compressed_bytes)
            .await
    }

    /// Fold a completed part into the aggregate hash and totals, then
    /// rewrite the descriptor. The state mutex serialises rewrites so a
    /// concurrent reader always observes a coherent snapshot.
    async fn complete_part(
        &self,
        part_number: u32,
        hash_hex: String,
        raw_bytes: i64,
        item_count: i64,
        compressed_bytes: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.folder.add(part_number, hash_hex);
        state.metadata.uncompressed_bytes += raw_bytes;
        state.metadata.compressed_bytes += compressed_bytes;
        state.metadata.item_count += item_count;
        state.metadata.part_count += 1;
        let (last_hashed, hash) = state.folder.value();
        state.metadata.last_hashed = last_hashed;
        state.metadata.hash = hash;
        self.flush_metadata(&state.metadata).await
    }

    async fn flush_metadata(&self, metadata: &Metadata) -> Result<()> {
        let body = serde_json::to_vec_pretty(metadata)?;
        self.store
            .put_object(
                &self.bucket,
                &meta_key(&self.prefix),
                ObjectPut {
                    body: Bytes::from(body),
                    content_type: "application/json".into(),
                    content_encoding: None,
                    metadata: HashMap::new(),
                },
            )
            .await
    }
}

/// One part in progress: a gzip stream into a worker-owned temp file teed
/// with a SHA-256 of the uncompressed record bytes. The temp file is
/// unlinked on creation, so it disappears when the worker drops it.
struct PartBuffer {
    gz: GzEncoder<File>,
    hasher: Sha256,
    raw_bytes: i64,
    item_count: i64,
    interval_bytes: usize,
    flush_interval: usize,
}

impl PartBuffer {
    fn new(flush_interval: usize) -> std::io::Result<Self> {
        let file = tempfile::tempfile()?;
        Ok(Self {
            gz: GzEncoder::new(file, Compression::default()),
            hasher: Sha256::new(),
            raw_bytes: 0,
            item_count: 0,
            interval_bytes: 0,
            flush_interval: flush_interval.max(1),
        })
    }

    fn write_record(&mut self, record: &[u8]) -> std::io::Result<()> {
        self.gz.write_all(record)?;
        self.hasher.update(record);
        self.raw_bytes += record.len() as i64;
        self.item_count += 1;
        self.interval_bytes += record.len();
        if self.interval_bytes >= self.flush_interval {
            // sync-flush so the on-disk size estimate stays honest; gzip
            // buffering would otherwise delay part splits
            self.gz.flush()?;
            self.interval_bytes = 0;
        }
        Ok(())
    }

    /// Compressed bytes on disk so far.
    fn disk_len(&self) -> std::io::Result<u64> {
        Ok(self.gz.get_ref().metadata()?.len())
    }

    /// Finish the gzip stream and read the compressed part back.
    fn finish(self) -> std::io::Result<PartPayload> {
        let PartBuffer {
            gz,
            hasher,
            raw_bytes,
            item_count,
            ..
        } = self;
        let hash_hex = format!("{:x}", hasher.finalize());
        let mut file = gz.finish()?;
        let compressed_bytes = file.seek(SeekFrom::End(0))? as i64;
        file.seek(SeekFrom::Start(0))?;
        let mut compressed = Vec::with_capacity(compressed_bytes as usize);
        file.read_to_end(&mut compressed)?;
        Ok(PartPayload {
            compressed,
            hash_hex,
            raw_bytes,
            item_count,
            compressed_bytes,
        })
    }
}
