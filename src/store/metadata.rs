//! Dump metadata descriptor
//!
//! Stored pretty-printed at `<prefix>-meta.json`, created when a dump starts
//! and rewritten at every part completion and at terminal transitions. An
//! intermediate reader may observe any superset of completed parts; the
//! descriptor is always internally coherent because rewrites are serialised.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of the dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpStatus {
    /// Dump in progress
    Running,
    /// Aborted or failed dump
    Failed,
    /// Successfully completed dump
    Completed,
}

/// Mode of the dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Complete dump of a table
    Full,
    /// Selective dump
    Query,
}

/// The descriptor stored alongside a dump's parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub table_name: String,
    pub table_arn: String,
    pub status: DumpStatus,
    #[serde(rename = "backup_type")]
    pub backup_type: BackupType,
    /// Time the dump started
    #[serde(rename = "backup_start_time")]
    pub start_time: DateTime<Utc>,
    /// Time the dump completed or failed; null while running
    #[serde(rename = "backup_end_time")]
    pub end_time: Option<DateTime<Utc>>,
    /// Total size of the raw JSON across parts, in bytes
    pub uncompressed_bytes: i64,
    /// Total size of the gzipped parts, in bytes
    pub compressed_bytes: i64,
    /// Number of items in the dump
    pub item_count: i64,
    /// Number of part objects comprising the dump
    pub part_count: i64,
    /// SHA-256 over the newline-terminated part hashes folded so far
    pub hash: String,
    /// Highest part number folded into `hash`; equals `part_count` once a
    /// dump completes successfully
    #[serde(rename = "last_hashed")]
    pub last_hashed: i64,
}

impl Metadata {
    /// Fresh descriptor for a dump that is about to start.
    pub fn new(table_name: impl Into<String>, table_arn: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            table_arn: table_arn.into(),
            status: DumpStatus::Running,
            backup_type: BackupType::Full,
            start_time: Utc::now(),
            end_time: None,
            uncompressed_bytes: 0,
            compressed_bytes: 0,
            item_count: 0,
            part_count: 0,
            hash: String::new(),
            last_hashed: 0,
        }
    }
}
