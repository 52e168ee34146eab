//! Wiring between the scan/load workers and the dump formats
//!
//! In dump mode the [`Fetcher`](crate::fetch::Fetcher)'s sink is a
//! [`JsonItemEncoder`](crate::codec::JsonItemEncoder) feeding a byte-stream
//! sink: a local file, a [`DumpWriter`](crate::store::DumpWriter), or a tee
//! of both. In load mode a file or a
//! [`DumpReader`](crate::store::DumpReader) stream feeds a
//! [`JsonItemDecoder`](crate::codec::JsonItemDecoder) which feeds the
//! [`Loader`](crate::load::Loader).

use crate::codec::RecordSink;
use crate::error::{DumpError, Result};
use crate::fetch::ItemWriter;
use crate::item::Item;
use crate::store::writer::DumpWriter;
use crate::store::{fetch_metadata, Metadata, ObjectGetLister, ObjectPuter};
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[async_trait]
impl<S: ObjectPuter> RecordSink for DumpWriter<S> {
    async fn write_record(&self, record: Vec<u8>) -> Result<()> {
        self.write(record).await
    }
}

/// Record sink over any byte writer, serialised through a mutex so encoded
/// records never interleave.
pub struct FileSink<W> {
    inner: tokio::sync::Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> FileSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(writer),
        }
    }

    /// Flush buffered bytes and return the inner writer.
    pub async fn finish(self) -> Result<W> {
        let mut writer = self.inner.into_inner();
        writer.flush().await?;
        Ok(writer)
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RecordSink for FileSink<W> {
    async fn write_record(&self, record: Vec<u8>) -> Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(&record).await?;
        Ok(())
    }
}

/// Sends every record to two sinks, for dump-to-file-and-store runs.
pub struct TeeSink<A, B> {
    first: A,
    second: B,
}

impl<A: RecordSink, B: RecordSink> TeeSink<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }

    pub fn into_inner(self) -> (A, B) {
        (self.first, self.second)
    }
}

#[async_trait]
impl<A: RecordSink, B: RecordSink> RecordSink for TeeSink<A, B> {
    async fn write_record(&self, record: Vec<u8>) -> Result<()> {
        self.first.write_record(record.clone()).await?;
        self.second.write_record(record).await
    }
}

/// Hands every item to two item sinks.
pub struct TeeWriter<A, B> {
    first: A,
    second: B,
}

impl<A: ItemWriter, B: ItemWriter> TeeWriter<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

#[async_trait]
impl<A: ItemWriter, B: ItemWriter> ItemWriter for TeeWriter<A, B> {
    async fn write_item(&self, item: &Item) -> Result<()> {
        self.first.write_item(item).await?;
        self.second.write_item(item).await
    }
}

/// Look for a dump at `prefix`. Returns its descriptor when one exists, so
/// callers can refuse to overwrite it before starting a new dump (a failed
/// dump must be deleted and restarted; there is no resume in place).
pub async fn existing_dump<S: ObjectGetLister>(
    store: &S,
    bucket: &str,
    prefix: &str,
) -> Result<Option<Metadata>> {
    match fetch_metadata(store, bucket, prefix).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Refuse to start a dump over an existing one.
pub async fn ensure_no_dump<S: ObjectGetLister>(
    store: &S,
    bucket: &str,
    prefix: &str,
) -> Result<()> {
    match existing_dump(store, bucket, prefix).await? {
        Some(_) => Err(DumpError::InvalidConfig(format!(
            "a dump already exists at prefix {prefix:?}; delete it first"
        ))),
        None => Ok(()),
    }
}
