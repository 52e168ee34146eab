//! Chunked part reader and verifier
//!
//! A [`DumpReader`] reassembles a dump into one byte stream by listing the
//! part keys in lexical order (which is write order, thanks to the zero
//! padded part numbers) and gunzipping each object into the stream. With the
//! integrity check on (the default), every part's uncompressed bytes are
//! hashed and compared against the `dyndump-sha256` stored with the object,
//! the part hashes are folded into a running aggregate, and after the final
//! part the observed part count and aggregate hash are checked against the
//! metadata descriptor.

use crate::error::{DumpError, Result};
use crate::store::metadata::Metadata;
use crate::store::{fetch_metadata, part_prefix, ObjectGetLister, META_SHA256};
use bytes::Bytes;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Decompressed chunk size pushed into the byte stream.
const CHUNK_SIZE: usize = 64 * 1024;

/// The reassembled dump as an `AsyncRead`/`AsyncBufRead` byte stream.
/// Integrity violations surface as `std::io::Error`s wrapping a
/// [`DumpError`] on the read that reaches them.
pub type DumpStream = StreamReader<ReceiverStream<std::io::Result<Bytes>>, Bytes>;

/// Reads a chunked dump back as a single byte stream.
pub struct DumpReader<S> {
    store: Arc<S>,
    bucket: String,
    prefix: String,
    skip_integrity_check: bool,
    metadata: tokio::sync::Mutex<Option<Metadata>>,
}

impl<S> DumpReader<S>
where
    S: ObjectGetLister + Send + Sync + 'static,
{
    pub fn new(store: S, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            store: Arc::new(store),
            bucket: bucket.into(),
            prefix: prefix.into(),
            skip_integrity_check: false,
            metadata: tokio::sync::Mutex::new(None),
        }
    }

    /// Disable per-part and aggregate hash validation.
    pub fn with_skip_integrity_check(mut self, skip: bool) -> Self {
        self.skip_integrity_check = skip;
        self
    }

    /// Fetch and cache the dump's metadata descriptor.
    pub async fn metadata(&self) -> Result<Metadata> {
        let mut cached = self.metadata.lock().await;
        if let Some(metadata) = cached.as_ref() {
            return Ok(metadata.clone());
        }
        let metadata = fetch_metadata(self.store.as_ref(), &self.bucket, &self.prefix).await?;
        *cached = Some(metadata.clone());
        Ok(metadata)
    }

    /// Open the dump as a byte stream. A producer task pages through the
    /// parts and feeds the stream; it stops on its own when the stream is
    /// dropped. Not safe for concurrent reads; open once per restore.
    pub async fn open(&self) -> Result<DumpStream> {
        let metadata = self.metadata().await?;
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
        let producer = Producer {
            store: self.store.clone(),
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            skip_integrity_check: self.skip_integrity_check,
            metadata,
            tx,
        };
        tokio::spawn(producer.run());
        Ok(StreamReader::new(ReceiverStream::new(rx)))
    }
}

/// Pulls the individual part objects and sends their decompressed bytes
/// into the consumer's half of the stream.
struct Producer<S> {
    store: Arc<S>,
    bucket: String,
    prefix: String,
    skip_integrity_check: bool,
    metadata: Metadata,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
}

impl<S: ObjectGetLister> Producer<S> {
    async fn run(self) {
        if let Err(err) = self.stream_parts().await {
            if err.is_integrity() {
                warn!(error = %err, "dump integrity check failed");
            }
            let _ = self
                .tx
                .send(Err(std::io::Error::other(err)))
                .await;
        }
    }

    async fn stream_parts(&self) -> Result<()> {
        let mut aggregate = Sha256::new();
        let mut parts_seen: i64 = 0;
        let mut token = None;
        let prefix = part_prefix(&self.prefix);

        loop {
            let page = self
                .store
                .list_objects(&self.bucket, &prefix, token.take())
                .await?;
            for key in page.keys {
                let object = self.store.get_object(&self.bucket, &key).await?;
                let part_hash = self.send_part(&object.bytes).await?;
                let Some(part_hash) = part_hash else {
                    return Ok(()); // consumer hung up
                };

                if !self.skip_integrity_check {
                    if let Some(expected) = object.metadata.get(META_SHA256) {
                        if !expected.is_empty() {
                            if *expected != part_hash {
                                return Err(DumpError::PartHashMismatch {
                                    key,
                                    expected: expected.clone(),
                                    actual: part_hash,
                                });
                            }
                            aggregate.update(part_hash.as_bytes());
                            aggregate.update(b"\n");
                        }
                    }
                }
                parts_seen += 1;
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        debug!(parts = parts_seen, "dump stream complete");

        // did we see as many parts as the descriptor declares?
        if self.metadata.part_count > 0 && parts_seen != self.metadata.part_count {
            return Err(DumpError::IncompleteDump {
                expected: self.metadata.part_count,
                found: parts_seen,
            });
        }

        if !self.skip_integrity_check && !self.metadata.hash.is_empty() {
            let actual = format!("{:x}", aggregate.finalize());
            if self.metadata.last_hashed == self.metadata.part_count
                && actual != self.metadata.hash
            {
                return Err(DumpError::AggregateHashMismatch {
                    expected: self.metadata.hash.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Gunzip one part into the stream, returning the hex SHA-256 of its
    /// uncompressed bytes, or `None` when the consumer dropped the stream.
    async fn send_part(&self, compressed: &Bytes) -> Result<Option<String>> {
        let mut decoder = GzDecoder::new(compressed.as_ref());
        let mut hasher = Sha256::new();
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = decoder
                .read(&mut buf)
                .map_err(|err| DumpError::Io(format!("part decompression failed: {err}")))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            if self
                .tx
                .send(Ok(Bytes::copy_from_slice(&buf[..n])))
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
        Ok(Some(format!("{:x}", hasher.finalize())))
    }
}
