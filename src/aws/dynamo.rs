//! DynamoDB-backed scan and put capabilities
//!
//! Wraps a pre-built `aws_sdk_dynamodb::Client` behind the
//! [`TableScanner`]/[`TablePutter`] traits. Scans retry throttling and
//! transient connection failures (the class that surfaces as resets midway
//! through long scans) with exponential backoff up to a configurable bound;
//! anything else is a hard error for the fetch workers.

use crate::error::{DumpError, Result};
use crate::fetch::{ScanPage, ScanRequest, TableScanner};
use crate::item::{Attr, Item};
use crate::load::TablePutter;
use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, SdkError};
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::operation::scan::ScanError;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnConsumedCapacity};
use aws_sdk_dynamodb::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Backoff bounds for retrying transient scan failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        exp.min(self.max_delay)
    }
}

/// Scan and put capabilities over a DynamoDB client.
#[derive(Clone)]
pub struct DynamoTable {
    client: Client,
    retry: RetryPolicy,
}

impl DynamoTable {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl TableScanner for DynamoTable {
    async fn scan_segment(&self, req: ScanRequest<'_>) -> Result<ScanPage> {
        let start_key = req.start_key.as_ref().map(item_to_sdk);
        let mut attempt = 0u32;
        loop {
            let result = self
                .client
                .scan()
                .table_name(req.table)
                .consistent_read(req.consistent_read)
                .segment(req.segment as i32)
                .total_segments(req.total_segments as i32)
                .return_consumed_capacity(ReturnConsumedCapacity::Total)
                .set_limit(req.limit)
                .set_exclusive_start_key(start_key.clone())
                .send()
                .await;

            let output = match result {
                Ok(output) => output,
                Err(err) => {
                    attempt += 1;
                    if attempt < self.retry.max_attempts && is_transient_scan_error(&err) {
                        let delay = self.retry.delay(attempt - 1);
                        debug!(attempt, ?delay, "retrying transient scan failure");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(DumpError::Table(format!(
                        "scan failed: {}",
                        DisplayErrorContext(&err)
                    )));
                }
            };

            let items = output
                .items
                .unwrap_or_default()
                .into_iter()
                .map(item_from_sdk)
                .collect::<Result<Vec<Item>>>()?;
            let consumed_capacity = output
                .consumed_capacity
                .and_then(|capacity| capacity.capacity_units)
                .unwrap_or(0.0);
            let last_key = output.last_evaluated_key.map(item_from_sdk).transpose()?;

            return Ok(ScanPage {
                items,
                consumed_capacity,
                last_key,
            });
        }
    }
}

#[async_trait]
impl TablePutter for DynamoTable {
    async fn put_item(&self, table: &str, item: &Item, guard_key: Option<&str>) -> Result<f64> {
        let mut request = self
            .client
            .put_item()
            .table_name(table)
            .set_item(Some(item_to_sdk(item)))
            .return_consumed_capacity(ReturnConsumedCapacity::Total);
        if let Some(hash_key) = guard_key {
            request = request
                .condition_expression("attribute_not_exists(#K)")
                .expression_attribute_names("#K", hash_key);
        }

        match request.send().await {
            Ok(output) => Ok(output
                .consumed_capacity
                .and_then(|capacity| capacity.capacity_units)
                .unwrap_or(0.0)),
            Err(err) => {
                if matches!(
                    err.as_service_error(),
                    Some(PutItemError::ConditionalCheckFailedException(_))
                ) {
                    return Err(DumpError::ConditionalCheckFailed);
                }
                Err(DumpError::Table(format!(
                    "put failed: {}",
                    DisplayErrorContext(&err)
                )))
            }
        }
    }
}

/// Throttling and connection-level failures are worth retrying; service
/// validation errors are not.
fn is_transient_scan_error<R: std::fmt::Debug>(err: &SdkError<ScanError, R>) -> bool {
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service) => matches!(
            service.err(),
            ScanError::ProvisionedThroughputExceededException(_)
                | ScanError::RequestLimitExceeded(_)
                | ScanError::InternalServerError(_)
        ),
        _ => false,
    }
}

fn attr_to_sdk(attr: &Attr) -> AttributeValue {
    match attr {
        Attr::S(s) => AttributeValue::S(s.clone()),
        Attr::N(n) => AttributeValue::N(n.clone()),
        Attr::B(b) => AttributeValue::B(Blob::new(b.clone())),
        Attr::Bool(b) => AttributeValue::Bool(*b),
        Attr::Null(b) => AttributeValue::Null(*b),
        Attr::Ss(set) => AttributeValue::Ss(set.clone()),
        Attr::Ns(set) => AttributeValue::Ns(set.clone()),
        Attr::Bs(set) => {
            AttributeValue::Bs(set.iter().map(|bytes| Blob::new(bytes.clone())).collect())
        }
        Attr::L(list) => AttributeValue::L(list.iter().map(attr_to_sdk).collect()),
        Attr::M(map) => AttributeValue::M(
            map.iter()
                .map(|(name, value)| (name.clone(), attr_to_sdk(value)))
                .collect(),
        ),
    }
}

fn attr_from_sdk(value: AttributeValue) -> Result<Attr> {
    Ok(match value {
        AttributeValue::S(s) => Attr::S(s),
        AttributeValue::N(n) => Attr::N(n),
        AttributeValue::B(blob) => Attr::B(blob.into_inner()),
        AttributeValue::Bool(b) => Attr::Bool(b),
        AttributeValue::Null(b) => Attr::Null(b),
        AttributeValue::Ss(set) => Attr::Ss(set),
        AttributeValue::Ns(set) => Attr::Ns(set),
        AttributeValue::Bs(set) => Attr::Bs(set.into_iter().map(Blob::into_inner).collect()),
        AttributeValue::L(list) => {
            Attr::L(list.into_iter().map(attr_from_sdk).collect::<Result<_>>()?)
        }
        AttributeValue::M(map) => Attr::M(
            map.into_iter()
                .map(|(name, value)| Ok((name, attr_from_sdk(value)?)))
                .collect::<Result<_>>()?,
        ),
        other => {
            return Err(DumpError::Codec(format!(
                "unsupported attribute value: {other:?}"
            )))
        }
    })
}

fn item_to_sdk(item: &Item) -> HashMap<String, AttributeValue> {
    item.iter()
        .map(|(name, attr)| (name.clone(), attr_to_sdk(attr)))
        .collect()
}

fn item_from_sdk(map: HashMap<String, AttributeValue>) -> Result<Item> {
    map.into_iter()
        .map(|(name, value)| Ok((name, attr_from_sdk(value)?)))
        .collect()
}
