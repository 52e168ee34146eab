//! Parallel table restore regulated to a write-capacity budget
//!
//! A [`Loader`] pulls items one at a time from an [`ItemReader`], hands them
//! to `max_parallel` put workers over a small handoff channel and writes them
//! back with optional overwrite protection. With overwrite protection on
//! (the default posture for restores), each put is conditional on no existing
//! item with the table's hash key; collisions are tallied as skips rather
//! than treated as failures, so re-running a restore is idempotent.

use crate::core::RateGovernor;
use crate::error::{DumpError, Result};
use crate::item::{item_size, Item};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Source of items to load. Called from a single reader task; `None` marks
/// the end of the stream.
#[async_trait]
pub trait ItemReader: Send {
    async fn read_item(&mut self) -> Result<Option<Item>>;
}

/// The portion of the table service a [`Loader`] requires. `guard_key`
/// carries the hash-key attribute name when the write must not replace an
/// existing item; such collisions surface as
/// [`DumpError::ConditionalCheckFailed`]. Returns the capacity units the
/// service charged.
#[async_trait]
pub trait TablePutter: Send + Sync {
    async fn put_item(&self, table: &str, item: &Item, guard_key: Option<&str>) -> Result<f64>;
}

#[async_trait]
impl<T: TablePutter + ?Sized> TablePutter for std::sync::Arc<T> {
    async fn put_item(&self, table: &str, item: &Item, guard_key: Option<&str>) -> Result<f64> {
        (**self).put_item(table, item, guard_key).await
    }
}

/// Aggregate statistics for an ongoing or completed load.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadStats {
    pub items_written: i64,
    /// Items dropped because an item with the same hash key already existed
    pub items_skipped: i64,
    pub bytes_written: i64,
    /// Capacity units consumed, to one decimal place
    pub capacity_used: f64,
}

/// Loader tunables.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub table_name: String,
    /// Number of concurrent put workers, `>= 1`
    pub max_parallel: usize,
    /// Approximate cap on items to write; `None` loads the whole stream
    pub max_items: Option<i64>,
    /// Maximum write capacity to consume; `<= 0` means unlimited
    pub write_capacity: f64,
    /// Attribute name of the table's hash key, used by overwrite protection
    pub hash_key: String,
    /// Replace existing items instead of skipping them
    pub allow_overwrite: bool,
}

/// Reads items from a source and loads them into a table. Single use:
/// create one per run.
pub struct Loader<P, R> {
    put: P,
    source: tokio::sync::Mutex<Option<R>>,
    config: LoadConfig,
    governor: Option<RateGovernor>,
    items_written: AtomicI64,
    items_skipped: AtomicI64,
    bytes_written: AtomicI64,
    capacity_used: AtomicI64, // tenths of a unit
    stop: CancellationToken,
    failure: Mutex<Option<DumpError>>,
}

impl<P: TablePutter, R: ItemReader> Loader<P, R> {
    pub fn new(put: P, source: R, config: LoadConfig) -> Result<Self> {
        if config.max_parallel < 1 {
            return Err(DumpError::InvalidConfig(
                "max_parallel must be 1 or greater".into(),
            ));
        }
        if config.table_name.is_empty() {
            return Err(DumpError::InvalidConfig("table_name is required".into()));
        }
        if !config.allow_overwrite && config.hash_key.is_empty() {
            return Err(DumpError::InvalidConfig(
                "hash_key is required when overwrite protection is on".into(),
            ));
        }
        let governor = RateGovernor::per_second(config.write_capacity);
        Ok(Self {
            put,
            source: tokio::sync::Mutex::new(Some(source)),
            config,
            governor,
            items_written: AtomicI64::new(0),
            items_skipped: AtomicI64::new(0),
            bytes_written: AtomicI64::new(0),
            capacity_used: AtomicI64::new(0),
            stop: CancellationToken::new(),
            failure: Mutex::new(None),
        })
    }

    /// Run the load until the source is exhausted, a worker fails or the
    /// load is stopped. Returns the first error observed, if any.
    pub async fn run(&self) -> Result<()> {
        let mut source = self
            .source
            .lock()
            .await
            .take()
            .ok_or_else(|| DumpError::InvalidConfig("loader already run".into()))?;

        let (tx, rx) = mpsc::channel::<Item>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let reader = self.read_source(&mut source, tx);
        let workers =
            futures::future::join_all((0..self.config.max_parallel).map(|_| self.put_worker(rx.clone())));
        tokio::join!(reader, workers);

        match self.failure.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Request a clean shutdown of current put operations. Does not block;
    /// `run` returns when the workers finish.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Coherent snapshot of the counters. Safe to call concurrently.
    pub fn stats(&self) -> LoadStats {
        LoadStats {
            items_written: self.items_written.load(Ordering::Relaxed),
            items_skipped: self.items_skipped.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            capacity_used: self.capacity_used.load(Ordering::Relaxed) as f64 / 10.0,
        }
    }

    fn fail(&self, err: DumpError) {
        let mut slot = self.failure.lock().unwrap();
        if slot.is_none() {
            warn!(error = %err, "load worker failed, stopping peers");
            *slot = Some(err);
        }
        drop(slot);
        self.stop.cancel();
    }

    /// Feed items to the handoff channel until end-of-stream, error, the
    /// item cap or a stop. Dropping the sender lets the workers drain out.
    async fn read_source(&self, source: &mut R, tx: mpsc::Sender<Item>) {
        let mut count = 0i64;
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            let item = match source.read_item().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(err) => {
                    self.fail(err);
                    break;
                }
            };
            tokio::select! {
                sent = tx.send(item) => {
                    if sent.is_err() {
                        break; // every worker has exited
                    }
                }
                _ = self.stop.cancelled() => break,
            }
            count += 1;
            if let Some(max_items) = self.config.max_items {
                if max_items > 0 && count >= max_items {
                    break;
                }
            }
        }
        debug!(items = count, "source reader finished");
    }

    async fn put_worker(&self, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Item>>>) {
        let mut used_capacity: u32 = 1;
        loop {
            let item = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    received = rx.recv() => received,
                    _ = self.stop.cancelled() => None,
                }
            };
            let Some(item) = item else {
                return; // channel drained or stop requested
            };

            if let Some(governor) = &self.governor {
                // a stop only shortens the wait; the item in hand still goes out
                governor.wait_for(used_capacity, &self.stop).await;
            }

            let guard_key = if self.config.allow_overwrite {
                None
            } else {
                Some(self.config.hash_key.as_str())
            };
            match self
                .put
                .put_item(&self.config.table_name, &item, guard_key)
                .await
            {
                Ok(capacity) => {
                    used_capacity = capacity.ceil().max(0.0) as u32;
                    self.items_written.fetch_add(1, Ordering::Relaxed);
                    self.bytes_written
                        .fetch_add(item_size(&item) as i64, Ordering::Relaxed);
                    self.capacity_used
                        .fetch_add((capacity * 10.0).round() as i64, Ordering::Relaxed);
                }
                Err(DumpError::ConditionalCheckFailed) => {
                    self.items_skipped.fetch_add(1, Ordering::Relaxed);
                    // the collision response carries no consumed capacity;
                    // estimate it from the item size to keep the governor honest
                    used_capacity = (item_size(&item) as f64 / 1000.0).ceil() as u32;
                }
                Err(err) => {
                    self.fail(err);
                    return;
                }
            }
        }
    }
}
