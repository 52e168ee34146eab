//! Item data model and size accounting
//!
//! An item is a schemaless mapping from attribute name to a typed value.
//! The serde representation matches the wire format: each value is a one-key
//! JSON object naming the type tag (`S`, `N`, `B`, `BOOL`, `NULL`, `SS`,
//! `NS`, `BS`, `L`, `M`). Numbers are carried as exact decimal strings and
//! binary payloads are base64 encoded.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single table item: attribute name to typed value.
pub type Item = HashMap<String, Attr>;

/// A typed attribute value. Exactly one variant is inhabited per value;
/// lists and maps may be empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attr {
    /// String
    S(String),
    /// Number, carried as an exact decimal string
    N(String),
    /// Binary blob
    #[serde(with = "b64")]
    B(Vec<u8>),
    /// Boolean
    #[serde(rename = "BOOL")]
    Bool(bool),
    /// Null (the wire value is the literal `true`)
    #[serde(rename = "NULL")]
    Null(bool),
    /// String set
    #[serde(rename = "SS")]
    Ss(Vec<String>),
    /// Number set
    #[serde(rename = "NS")]
    Ns(Vec<String>),
    /// Binary set
    #[serde(rename = "BS", with = "b64_set")]
    Bs(Vec<Vec<u8>>),
    /// List of values
    L(Vec<Attr>),
    /// Map of attribute name to value
    M(HashMap<String, Attr>),
}

/// Size of an item in bytes under the table's documented accounting rules:
/// the length of each attribute name plus the size of each value.
pub fn item_size(item: &Item) -> usize {
    item.iter().map(|(name, attr)| name.len() + attr_size(attr)).sum()
}

/// Size of a single attribute value. Strings, numbers and binary count their
/// raw byte length; booleans and nulls count one byte; sets, lists and maps
/// carry a 3 byte overhead plus the recursive size of their elements.
pub fn attr_size(attr: &Attr) -> usize {
    match attr {
        Attr::S(s) => s.len(),
        Attr::N(n) => n.len(),
        Attr::B(b) => b.len(),
        Attr::Bool(_) | Attr::Null(_) => 1,
        Attr::Ss(set) => 3 + set.iter().map(String::len).sum::<usize>(),
        Attr::Ns(set) => 3 + set.iter().map(String::len).sum::<usize>(),
        Attr::Bs(set) => 3 + set.iter().map(Vec::len).sum::<usize>(),
        Attr::L(list) => 3 + list.iter().map(attr_size).sum::<usize>(),
        Attr::M(map) => {
            3 + map
                .iter()
                .map(|(name, value)| name.len() + attr_size(value))
                .sum::<usize>()
        }
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod b64_set {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(set: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(set.len()))?;
        for bytes in set {
            seq.serialize_element(&STANDARD.encode(bytes))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|entry| STANDARD.decode(entry).map_err(serde::de::Error::custom))
            .collect()
    }
}
