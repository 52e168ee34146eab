//! Item codecs: the typed wire format and a plain human-readable export
//!
//! The wire format is one JSON object per item, one item per line. Each
//! attribute value is a one-key object naming its type tag, which is what
//! the restore path parses back. The plain encoder is a one-way export for
//! consumption outside the restore path: it flattens values to ordinary
//! JSON, optionally keeping `{"type": ..., "value": ...}` tags.

use crate::error::{DumpError, Result};
use crate::fetch::ItemWriter;
use crate::item::{Attr, Item};
use crate::load::ItemReader;
use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

/// Destination for encoded records. One call per record; implementations
/// must be safe for concurrent callers.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write_record(&self, record: Vec<u8>) -> Result<()>;
}

#[async_trait]
impl<T: RecordSink + ?Sized> RecordSink for std::sync::Arc<T> {
    async fn write_record(&self, record: Vec<u8>) -> Result<()> {
        (**self).write_record(record).await
    }
}

/// Encodes items in the typed wire format and hands each newline-terminated
/// record to the sink. Safe for concurrent writers.
pub struct JsonItemEncoder<S> {
    sink: S,
}

impl<S: RecordSink> JsonItemEncoder<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn into_inner(self) -> S {
        self.sink
    }
}

/// Serialize one item as a single newline-terminated JSON line.
pub fn encode_item(item: &Item) -> Result<Vec<u8>> {
    let mut record = serde_json::to_vec(item)?;
    record.push(b'\n');
    Ok(record)
}

#[async_trait]
impl<S: RecordSink> ItemWriter for JsonItemEncoder<S> {
    async fn write_item(&self, item: &Item) -> Result<()> {
        self.sink.write_record(encode_item(item)?).await
    }
}

/// Decodes the typed wire format from any byte stream, one item per line.
/// Single consumer, per the [`ItemReader`] contract.
pub struct JsonItemDecoder<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin + Send> JsonItemDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ItemReader for JsonItemDecoder<R> {
    async fn read_item(&mut self) -> Result<Option<Item>> {
        loop {
            match self.lines.next_line().await.map_err(unwrap_stream_error)? {
                None => return Ok(None),
                Some(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Ok(Some(serde_json::from_str(&line)?));
                }
            }
        }
    }
}

/// Recover a typed [`DumpError`] smuggled through a byte stream as
/// `std::io::Error`, so integrity violations keep their identity across the
/// reader pipe.
fn unwrap_stream_error(err: std::io::Error) -> DumpError {
    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<DumpError>())
    {
        Some(dump_err) => dump_err.clone(),
        None => DumpError::Io(err.to_string()),
    }
}

/// One-way export encoder producing plain JSON lines. With `type_tags` each
/// value becomes `{"type": ..., "value": ...}`; with `numbers_as_strings`
/// numbers keep their exact decimal representation instead of being parsed
/// to floats.
pub struct PlainItemEncoder<S> {
    sink: S,
    type_tags: bool,
    numbers_as_strings: bool,
}

impl<S: RecordSink> PlainItemEncoder<S> {
    pub fn new(sink: S, type_tags: bool, numbers_as_strings: bool) -> Self {
        Self {
            sink,
            type_tags,
            numbers_as_strings,
        }
    }

    pub fn into_inner(self) -> S {
        self.sink
    }

    fn tagged(&self, type_name: &str, value: Value) -> Value {
        if self.type_tags {
            let mut wrapper = Map::new();
            wrapper.insert("type".into(), Value::String(type_name.into()));
            wrapper.insert("value".into(), value);
            Value::Object(wrapper)
        } else {
            value
        }
    }

    fn number(&self, digits: &str) -> Value {
        if self.numbers_as_strings {
            return Value::String(digits.into());
        }
        digits
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(digits.into()))
    }

    fn value(&self, attr: &Attr) -> Value {
        match attr {
            Attr::S(s) => self.tagged("string", Value::String(s.clone())),
            Attr::N(n) => self.tagged("number", self.number(n)),
            // binary payloads are carried as strings; non-UTF-8 bytes are lossy
            Attr::B(b) => self.tagged("binary", Value::String(String::from_utf8_lossy(b).into())),
            Attr::Bool(b) => self.tagged("bool", Value::Bool(*b)),
            Attr::Null(_) => self.tagged("null", Value::Null),
            Attr::Ss(set) => self.tagged(
                "string-set",
                Value::Array(set.iter().map(|s| Value::String(s.clone())).collect()),
            ),
            Attr::Ns(set) => self.tagged(
                "number-set",
                Value::Array(set.iter().map(|n| self.number(n)).collect()),
            ),
            Attr::Bs(set) => self.tagged(
                "binary-set",
                Value::Array(
                    set.iter()
                        .map(|b| Value::String(String::from_utf8_lossy(b).into()))
                        .collect(),
                ),
            ),
            Attr::L(list) => {
                self.tagged("list", Value::Array(list.iter().map(|a| self.value(a)).collect()))
            }
            Attr::M(map) => self.tagged(
                "map",
                Value::Object(
                    map.iter()
                        .map(|(name, value)| (name.clone(), self.value(value)))
                        .collect(),
                ),
            ),
        }
    }
}

#[async_trait]
impl<S: RecordSink> ItemWriter for PlainItemEncoder<S> {
    async fn write_item(&self, item: &Item) -> Result<()> {
        let object: Map<String, Value> = item
            .iter()
            .map(|(name, attr)| (name.clone(), self.value(attr)))
            .collect();
        let mut record = serde_json::to_vec(&Value::Object(object))?;
        record.push(b'\n');
        self.sink.write_record(record).await
    }
}
