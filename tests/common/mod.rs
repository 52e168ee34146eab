//! In-memory fakes backing the integration tests: an object store with
//! lexically ordered listing and a segmented key-value table.
//!
//! Not every binary uses every fake.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dyndump::store::{
    DeleteFailure, ListPage, ObjectBody, ObjectDeleter, ObjectGetLister, ObjectPut, ObjectPuter,
};
use dyndump::{Attr, DumpError, Item, ItemReader, ItemWriter, Result, ScanPage, ScanRequest,
    TablePutter, TableScanner};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// A stored object with the attributes the core cares about.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Object store fake. A `BTreeMap` keeps keys lexically ordered, which is
/// the listing contract the part key scheme relies on.
#[derive(Default)]
pub struct MemStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    page_size: usize,
    fail_put_containing: Option<String>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            page_size: 1000,
            fail_put_containing: None,
        }
    }

    /// Shrink listing pages to exercise pagination.
    #[allow(dead_code)]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Fail any put whose key contains `fragment`.
    #[allow(dead_code)]
    pub fn with_put_failure(mut self, fragment: &str) -> Self {
        self.fail_put_containing = Some(fragment.to_string());
        self
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Drop an object behind the core's back.
    #[allow(dead_code)]
    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    /// Tamper with one stored user-metadata header.
    #[allow(dead_code)]
    pub fn set_metadata_header(&self, key: &str, name: &str, value: &str) {
        let mut objects = self.objects.lock().unwrap();
        let object = objects.get_mut(key).expect("object to tamper with");
        object.metadata.insert(name.to_string(), value.to_string());
    }

    /// Store an object directly, bypassing the writer.
    #[allow(dead_code)]
    pub fn insert_raw(&self, key: &str, body: &[u8]) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                body: Bytes::copy_from_slice(body),
                content_type: "application/octet-stream".into(),
                content_encoding: None,
                metadata: HashMap::new(),
            },
        );
    }
}

#[async_trait]
impl ObjectPuter for MemStore {
    async fn put_object(&self, _bucket: &str, key: &str, put: ObjectPut) -> Result<()> {
        if let Some(fragment) = &self.fail_put_containing {
            if key.contains(fragment.as_str()) {
                return Err(DumpError::Storage(format!("injected put failure for {key}")));
            }
        }
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                body: put.body,
                content_type: put.content_type,
                content_encoding: put.content_encoding,
                metadata: put.metadata,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl ObjectGetLister for MemStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        let objects = self.objects.lock().unwrap();
        match objects.get(key) {
            Some(object) => Ok(ObjectBody {
                bytes: object.body.clone(),
                metadata: object.metadata.clone(),
            }),
            None => Err(DumpError::NotFound(format!("{bucket}/{key}"))),
        }
    }

    async fn list_objects(
        &self,
        _bucket: &str,
        prefix: &str,
        token: Option<String>,
    ) -> Result<ListPage> {
        let objects = self.objects.lock().unwrap();
        let mut matching = objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| match &token {
                Some(after) => key.as_str() > after.as_str(),
                None => true,
            })
            .cloned();
        let keys: Vec<String> = matching.by_ref().take(self.page_size).collect();
        let next_token = if matching.next().is_some() {
            keys.last().cloned()
        } else {
            None
        };
        Ok(ListPage { keys, next_token })
    }
}

#[async_trait]
impl ObjectDeleter for MemStore {
    async fn delete_objects(&self, _bucket: &str, keys: &[String]) -> Result<Vec<DeleteFailure>> {
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(Vec::new())
    }
}

/// Segmented scan fake: items are assigned to segment `index % total`,
/// returned in pages with a numeric continuation cursor.
pub struct MemTable {
    items: Vec<Item>,
    page_size: usize,
    capacity_per_page: f64,
}

impl MemTable {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items,
            page_size: 2,
            capacity_per_page: 0.5,
        }
    }

    #[allow(dead_code)]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[async_trait]
impl TableScanner for MemTable {
    async fn scan_segment(&self, req: ScanRequest<'_>) -> Result<ScanPage> {
        let assigned: Vec<&Item> = self
            .items
            .iter()
            .enumerate()
            .filter(|(index, _)| index % req.total_segments == req.segment)
            .map(|(_, item)| item)
            .collect();

        let offset = match &req.start_key {
            Some(cursor) => match cursor.get("__cursor") {
                Some(Attr::N(n)) => n.parse::<usize>().unwrap_or(0),
                _ => 0,
            },
            None => 0,
        };
        let take = match req.limit {
            Some(limit) if limit > 0 => (limit as usize).min(self.page_size),
            _ => self.page_size,
        };

        let page: Vec<Item> = assigned
            .iter()
            .skip(offset)
            .take(take)
            .map(|item| (*item).clone())
            .collect();
        let consumed = offset + page.len();
        let last_key = if consumed < assigned.len() {
            let mut cursor = Item::new();
            cursor.insert("__cursor".into(), Attr::N(consumed.to_string()));
            Some(cursor)
        } else {
            None
        };

        Ok(ScanPage {
            items: page,
            consumed_capacity: self.capacity_per_page,
            last_key,
        })
    }
}

/// Key-value put fake with conditional-write semantics on a hash key.
pub struct MemPutTable {
    hash_key: String,
    rows: Mutex<HashMap<String, Item>>,
}

impl MemPutTable {
    pub fn new(hash_key: &str) -> Self {
        Self {
            hash_key: hash_key.to_string(),
            rows: Mutex::new(HashMap::new()),
        }
    }

    fn row_key(&self, item: &Item) -> Result<String> {
        match item.get(&self.hash_key) {
            Some(attr) => Ok(serde_json::to_string(attr).unwrap()),
            None => Err(DumpError::Table(format!(
                "item is missing hash key {:?}",
                self.hash_key
            ))),
        }
    }

    /// Seed a row directly, bypassing the loader.
    pub fn seed(&self, item: Item) {
        let key = self.row_key(&item).unwrap();
        self.rows.lock().unwrap().insert(key, item);
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn rows(&self) -> Vec<Item> {
        self.rows.lock().unwrap().values().cloned().collect()
    }

    #[allow(dead_code)]
    pub fn row_for(&self, item: &Item) -> Option<Item> {
        let key = self.row_key(item).unwrap();
        self.rows.lock().unwrap().get(&key).cloned()
    }
}

#[async_trait]
impl TablePutter for MemPutTable {
    async fn put_item(&self, _table: &str, item: &Item, guard_key: Option<&str>) -> Result<f64> {
        let key = self.row_key(item)?;
        let mut rows = self.rows.lock().unwrap();
        if guard_key.is_some() && rows.contains_key(&key) {
            return Err(DumpError::ConditionalCheckFailed);
        }
        rows.insert(key, item.clone());
        Ok(1.0)
    }
}

/// Item source over a vector.
pub struct VecItemSource {
    items: std::vec::IntoIter<Item>,
}

impl VecItemSource {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

#[async_trait]
impl ItemReader for VecItemSource {
    async fn read_item(&mut self) -> Result<Option<Item>> {
        Ok(self.items.next())
    }
}

/// Item sink collecting everything it is handed.
#[derive(Default)]
pub struct CollectSink {
    items: Mutex<Vec<Item>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<Item> {
        self.items.lock().unwrap().clone()
    }
}

#[async_trait]
impl ItemWriter for CollectSink {
    async fn write_item(&self, item: &Item) -> Result<()> {
        self.items.lock().unwrap().push(item.clone());
        Ok(())
    }
}

/// A simple item with a numeric `k` attribute.
pub fn numbered_item(n: i64) -> Item {
    let mut item = Item::new();
    item.insert("k".into(), Attr::N(n.to_string()));
    item
}

/// Deterministic incompressible bytes, for forcing part splits.
#[allow(dead_code)]
pub fn incompressible(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2862933555777941757).wrapping_add(3037000493);
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        out.push((state >> 33) as u8);
    }
    out
}
