//! Parallel segmented table scan regulated to a read-capacity budget
//!
//! A [`Fetcher`] splits the source table into `max_parallel` logical
//! segments, scans them concurrently and hands every retrieved item to a
//! concurrency-safe [`ItemWriter`]. When a read-capacity budget is set, the
//! per-request batch size adapts to recent item sizes so each worker
//! approximates its share of the budget.

use crate::core::{MedianWindow, RateGovernor};
use crate::error::{DumpError, Result};
use crate::item::{item_size, Item};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Number of item sizes collected before the batch-size hint adapts.
pub(crate) const MEDIAN_WINDOW_SIZE: usize = 50;

/// Batch size requested while item sizes are still unknown.
const INITIAL_LIMIT: i32 = 20;

/// Sink for retrieved items. Must support calls from concurrent workers.
#[async_trait]
pub trait ItemWriter: Send + Sync {
    async fn write_item(&self, item: &Item) -> Result<()>;
}

#[async_trait]
impl<T: ItemWriter + ?Sized> ItemWriter for std::sync::Arc<T> {
    async fn write_item(&self, item: &Item) -> Result<()> {
        (**self).write_item(item).await
    }
}

/// One parallel scan request against a table segment.
#[derive(Debug, Clone)]
pub struct ScanRequest<'a> {
    pub table: &'a str,
    /// Segment owned by the requesting worker, `0 <= segment < total_segments`
    pub segment: usize,
    pub total_segments: usize,
    /// Batch-size hint; `None` requests the server default
    pub limit: Option<i32>,
    /// Continuation token from the previous page of this segment
    pub start_key: Option<Item>,
    pub consistent_read: bool,
}

/// One page of scan results.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<Item>,
    /// Capacity units the service charged for this request
    pub consumed_capacity: f64,
    /// Continuation token; `None` when the segment is exhausted
    pub last_key: Option<Item>,
}

/// The portion of the table service a [`Fetcher`] requires. Implementations
/// are expected to retry throttling and transient connection failures
/// internally with a bounded exponential backoff.
#[async_trait]
pub trait TableScanner: Send + Sync {
    async fn scan_segment(&self, req: ScanRequest<'_>) -> Result<ScanPage>;
}

#[async_trait]
impl<T: TableScanner + ?Sized> TableScanner for std::sync::Arc<T> {
    async fn scan_segment(&self, req: ScanRequest<'_>) -> Result<ScanPage> {
        (**self).scan_segment(req).await
    }
}

/// Aggregate throughput statistics for an ongoing or completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FetchStats {
    pub items_read: i64,
    pub bytes_read: i64,
    /// Capacity units consumed, to one decimal place
    pub capacity_used: f64,
}

/// Fetcher tunables.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub table_name: String,
    /// Number of parallel segments to scan, `>= 1`
    pub max_parallel: usize,
    /// Approximate cap on items to read; `None` reads the whole table
    pub max_items: Option<i64>,
    /// Average global read capacity to consume; `<= 0` means unlimited
    pub read_capacity: f64,
    /// Consistent reads charge double the capacity per 4 KiB
    pub consistent_read: bool,
}

/// Scans a table at a bounded read capacity, writing every item to the
/// configured sink. Single use: create one per run.
pub struct Fetcher<S, W> {
    scan: S,
    writer: W,
    config: FetchConfig,
    governor: Option<RateGovernor>,
    sizes: MedianWindow,
    items_read: AtomicI64,
    bytes_read: AtomicI64,
    capacity_used: AtomicI64, // tenths of a unit, for atomic accumulation
    stop: CancellationToken,
    failure: Mutex<Option<DumpError>>,
}

impl<S: TableScanner, W: ItemWriter> Fetcher<S, W> {
    pub fn new(scan: S, writer: W, config: FetchConfig) -> Result<Self> {
        if config.max_parallel < 1 {
            return Err(DumpError::InvalidConfig(
                "max_parallel must be 1 or greater".into(),
            ));
        }
        if config.table_name.is_empty() {
            return Err(DumpError::InvalidConfig("table_name is required".into()));
        }
        let governor = RateGovernor::per_second(config.read_capacity);
        Ok(Self {
            scan,
            writer,
            config,
            governor,
            sizes: MedianWindow::new(MEDIAN_WINDOW_SIZE),
            items_read: AtomicI64::new(0),
            bytes_read: AtomicI64::new(0),
            capacity_used: AtomicI64::new(0),
            stop: CancellationToken::new(),
            failure: Mutex::new(None),
        })
    }

    /// Run the scan to completion, failure or stop. Returns the first worker
    /// error observed, if any.
    pub async fn run(&self) -> Result<()> {
        let workers = (0..self.config.max_parallel).map(|segment| self.run_segment(segment));
        futures::future::join_all(workers).await;
        match self.failure.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Request a clean shutdown. Workers finish their in-flight request and
    /// exit; `run` returns once they have.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Coherent snapshot of the counters. Safe to call concurrently.
    pub fn stats(&self) -> FetchStats {
        FetchStats {
            items_read: self.items_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            capacity_used: self.capacity_used.load(Ordering::Relaxed) as f64 / 10.0,
        }
    }

    /// Latch the first error and fan the stop signal out to the peers.
    fn fail(&self, err: DumpError) {
        let mut slot = self.failure.lock().unwrap();
        if slot.is_none() {
            warn!(error = %err, "scan worker failed, stopping peers");
            *slot = Some(err);
        }
        drop(slot);
        self.stop.cancel();
    }

    async fn run_segment(&self, segment: usize) {
        if let Err(err) = self.scan_segment_loop(segment).await {
            self.fail(err);
        }
    }

    async fn scan_segment_loop(&self, segment: usize) -> Result<()> {
        // slow start while the median window warms up; without a budget the
        // server default batch size is used throughout
        let mut limit = self.governor.as_ref().map(|_| INITIAL_LIMIT);
        let mut start_key: Option<Item> = None;
        let mut used_capacity: u32 = 1;

        debug!(segment, total = self.config.max_parallel, "scan segment started");
        loop {
            if let Some(governor) = &self.governor {
                if governor.wait_for(used_capacity, &self.stop).await {
                    break;
                }
            }
            if self.stop.is_cancelled() {
                break;
            }

            // the transport retries soft errors itself; anything surfacing
            // here is a hard error
            let page = self
                .scan
                .scan_segment(ScanRequest {
                    table: &self.config.table_name,
                    segment,
                    total_segments: self.config.max_parallel,
                    limit,
                    start_key: start_key.take(),
                    consistent_read: self.config.consistent_read,
                })
                .await?;

            let mut page_bytes = 0i64;
            for item in &page.items {
                self.writer.write_item(item).await?;
                let size = item_size(item);
                page_bytes += size as i64;
                self.sizes.push(size);
            }

            self.items_read
                .fetch_add(page.items.len() as i64, Ordering::Relaxed);
            self.bytes_read.fetch_add(page_bytes, Ordering::Relaxed);
            self.capacity_used
                .fetch_add((page.consumed_capacity * 10.0).round() as i64, Ordering::Relaxed);

            if let Some(max_items) = self.config.max_items {
                if max_items > 0 && self.items_read.load(Ordering::Relaxed) >= max_items {
                    break;
                }
            }

            match page.last_key {
                None => break, // segment exhausted
                Some(key) => start_key = Some(key),
            }

            used_capacity = page.consumed_capacity.ceil().max(0.0) as u32;
            if self.governor.is_some() {
                if let Some(new_limit) = self.calc_limit() {
                    limit = Some(new_limit);
                }
            }
        }
        debug!(segment, "scan segment finished");
        Ok(())
    }

    /// Derive the batch size that approximates this worker's share of the
    /// capacity budget, making effective use of 4 KiB read blocks for small
    /// items. `None` until the median window has filled.
    fn calc_limit(&self) -> Option<i32> {
        let desired_capacity = self.config.read_capacity / self.config.max_parallel as f64;
        let median = self.sizes.median()?;
        let items_per_4k = (4096 / median.max(1)) as f64;
        let mut limit = (items_per_4k * desired_capacity) as i64;
        if !self.config.consistent_read {
            // eventually consistent reads are charged half a unit per 4 KiB
            limit *= 2;
        }
        Some(limit.clamp(1, i32::MAX as i64) as i32)
    }
}
