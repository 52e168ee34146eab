//! Dump deletion
//!
//! Removes every part of a dump, then its metadata descriptor. The listing
//! under the part prefix may contain unrelated sibling keys, so only exact
//! part-key matches are deleted. Aborting between pages is permitted;
//! partially deleted dumps are acceptable and a later delete can resume.

use crate::error::{DumpError, Result};
use crate::store::metadata::Metadata;
use crate::store::{fetch_metadata, meta_key, part_prefix, ObjectDeleter};
use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tracing::debug;

/// Deletes all parts of a dump followed by its metadata descriptor.
pub struct DumpDeleter<S> {
    store: S,
    bucket: String,
    prefix: String,
    metadata: Metadata,
    deleted: AtomicI64,
    aborted: AtomicBool,
}

impl<S: ObjectDeleter> DumpDeleter<S> {
    /// Fetches the dump's metadata before returning, confirming a dump
    /// actually exists at `prefix`.
    pub async fn new(
        store: S,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Result<Self> {
        let bucket = bucket.into();
        let prefix = prefix.into();
        let metadata = fetch_metadata(&store, &bucket, &prefix).await?;
        Ok(Self {
            store,
            bucket,
            prefix,
            metadata,
            deleted: AtomicI64::new(0),
            aborted: AtomicBool::new(false),
        })
    }

    /// The descriptor captured at construction.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Number of parts deleted so far. May be called while a delete is in
    /// progress.
    pub fn completed(&self) -> i64 {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Request that the deleter stop after the current page.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    /// Delete the dump. Blocks until the parts and the metadata object are
    /// gone, a delete fails, or `abort` takes effect.
    pub async fn delete(&self) -> Result<()> {
        let prefix = part_prefix(&self.prefix);
        let matcher = Regex::new(&format!(r"^{}\d{{9}}\.json\.gz$", regex::escape(&prefix)))
            .map_err(|err| DumpError::InvalidConfig(format!("illegal path prefix: {err}")))?;

        let mut token = None;
        let mut listing_complete = false;
        loop {
            if self.is_aborted() {
                break;
            }
            let page = self
                .store
                .list_objects(&self.bucket, &prefix, token.take())
                .await?;

            // the page may contain unrelated siblings under the same prefix
            let keys: Vec<String> = page
                .keys
                .into_iter()
                .filter(|key| matcher.is_match(key))
                .collect();
            if !keys.is_empty() {
                self.delete_keys(&keys).await?;
                self.deleted.fetch_add(keys.len() as i64, Ordering::Relaxed);
                debug!(count = keys.len(), "deleted dump parts");
            }

            match page.next_token {
                Some(next) => token = Some(next),
                None => {
                    listing_complete = true;
                    break;
                }
            }
        }

        if listing_complete && !self.is_aborted() {
            self.delete_keys(&[meta_key(&self.prefix)]).await?;
            debug!("deleted dump metadata");
        }
        Ok(())
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        let failures = self.store.delete_objects(&self.bucket, keys).await?;
        if let Some(failure) = failures.first() {
            return Err(DumpError::Storage(format!(
                "failed to delete key {:?}: {}",
                failure.key, failure.message
            )));
        }
        Ok(())
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }
}
