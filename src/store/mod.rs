//! Chunked, content-hashed dump storage
//!
//! A dump lives under a key prefix in an object store as a metadata
//! descriptor (`<prefix>-meta.json`) plus a sequence of gzip parts
//! (`<prefix>-part-NNNNNNNNN.json.gz`). Part numbers are 9-digit zero padded
//! so a lexical listing yields parts in write order. The capability traits
//! here are the narrow slice of the object-store API the writer, reader and
//! deleter actually call, which keeps them testable against in-memory fakes.

pub mod deleter;
pub mod hash;
pub mod metadata;
pub mod reader;
pub mod writer;

pub use deleter::DumpDeleter;
pub use hash::HashFolder;
pub use metadata::{BackupType, DumpStatus, Metadata};
pub use reader::{DumpReader, DumpStream};
pub use writer::DumpWriter;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

/// Default maximum size of an uploaded part, in compressed bytes on disk.
pub const DEFAULT_PART_SIZE: usize = 50 * 1024 * 1024;

/// Default number of concurrent part uploads.
pub const DEFAULT_MAX_PARALLEL: usize = 2;

/// Smallest permitted part size.
pub const MIN_PART_SIZE: usize = 1000;

/// Object user-metadata key carrying a part's uncompressed-bytes SHA-256.
pub(crate) const META_SHA256: &str = "dyndump-sha256";
/// Object user-metadata key carrying a part's item count.
pub(crate) const META_ITEM_COUNT: &str = "dyndump-itemcount";
/// Object user-metadata key carrying a part's number.
pub(crate) const META_PART_NUMBER: &str = "dyndump-part";

/// Key of the dump's metadata descriptor.
pub fn meta_key(prefix: &str) -> String {
    format!("{prefix}-meta.json")
}

/// Common key prefix of every part object.
pub fn part_prefix(prefix: &str) -> String {
    format!("{prefix}-part-")
}

/// Key of one part. Part numbers are 1-based.
pub(crate) fn part_key(prefix: &str, part_number: u32) -> String {
    format!("{}{:09}.json.gz", part_prefix(prefix), part_number)
}

/// An object upload.
#[derive(Debug, Clone)]
pub struct ObjectPut {
    pub body: Bytes,
    pub content_type: String,
    pub content_encoding: Option<String>,
    /// User metadata stored with the object
    pub metadata: HashMap<String, String>,
}

/// A fetched object: its bytes and user metadata.
#[derive(Debug, Clone)]
pub struct ObjectBody {
    pub bytes: Bytes,
    pub metadata: HashMap<String, String>,
}

/// One page of a listing. Keys are lexically ascending within and across
/// pages.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Token for the next page; `None` on the final page
    pub next_token: Option<String>,
}

/// A delete that failed for one key of a bulk request.
#[derive(Debug, Clone)]
pub struct DeleteFailure {
    pub key: String,
    pub message: String,
}

/// The portion of the object store the writer requires.
#[async_trait]
pub trait ObjectPuter: Send + Sync {
    async fn put_object(&self, bucket: &str, key: &str, put: ObjectPut) -> Result<()>;
}

/// The portion of the object store the reader requires. `get_object` fails
/// with a distinguished not-found error for missing keys; `list_objects`
/// pages through keys in lexical ascending order.
#[async_trait]
pub trait ObjectGetLister: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody>;
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<String>,
    ) -> Result<ListPage>;
}

/// The portion of the object store the deleter requires.
#[async_trait]
pub trait ObjectDeleter: ObjectGetLister {
    /// Quiet bulk delete; returns per-key failures rather than erroring on
    /// the first one.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteFailure>>;
}

#[async_trait]
impl<T: ObjectPuter + ?Sized> ObjectPuter for std::sync::Arc<T> {
    async fn put_object(&self, bucket: &str, key: &str, put: ObjectPut) -> Result<()> {
        (**self).put_object(bucket, key, put).await
    }
}

#[async_trait]
impl<T: ObjectGetLister + ?Sized> ObjectGetLister for std::sync::Arc<T> {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        (**self).get_object(bucket, key).await
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<String>,
    ) -> Result<ListPage> {
        (**self).list_objects(bucket, prefix, token).await
    }
}

#[async_trait]
impl<T: ObjectDeleter + ?Sized> ObjectDeleter for std::sync::Arc<T> {
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteFailure>> {
        (**self).delete_objects(bucket, keys).await
    }
}

/// Fetch and decode a dump's metadata descriptor.
pub(crate) async fn fetch_metadata<S: ObjectGetLister + ?Sized>(
    store: &S,
    bucket: &str,
    prefix: &str,
) -> Result<Metadata> {
    let object = store.get_object(bucket, &meta_key(prefix)).await?;
    let metadata = serde_json::from_slice(&object.bytes)?;
    Ok(metadata)
}
