//! Document model: ordered documents of typed values.
//!
//! Values mirror the BSON types the encryption schema can declare. Dates are
//! UTC with millisecond precision, which is what the encrypted encoding keeps.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::ciphertext::EncryptedValue;

/// Binary subtype used when rendering encrypted values as extended JSON.
const ENCRYPTED_SUBTYPE: &str = "06";

/// Type names usable in a schema's `bsonType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BsonType {
    /// 64-bit float
    Double,
    /// UTF-8 string
    String,
    /// Embedded document
    Object,
    /// Array
    Array,
    /// Binary data (including encrypted values)
    BinData,
    /// Boolean
    Bool,
    /// UTC datetime
    Date,
    /// Null
    Null,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
}

impl BsonType {
    /// Returns the BSON element type byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Double => 0x01,
            Self::String => 0x02,
            Self::Object => 0x03,
            Self::Array => 0x04,
            Self::BinData => 0x05,
            Self::Bool => 0x08,
            Self::Date => 0x09,
            Self::Null => 0x0A,
            Self::Int => 0x10,
            Self::Long => 0x12,
        }
    }

    /// Parses a BSON element type byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Double),
            0x02 => Some(Self::String),
            0x03 => Some(Self::Object),
            0x04 => Some(Self::Array),
            0x05 => Some(Self::BinData),
            0x08 => Some(Self::Bool),
            0x09 => Some(Self::Date),
            0x0A => Some(Self::Null),
            0x10 => Some(Self::Int),
            0x12 => Some(Self::Long),
            _ => None,
        }
    }

    /// Whether deterministic encryption can be declared for this type.
    ///
    /// Floating point, booleans and containers have no stable equality
    /// encoding worth leaking, so only randomized encryption is allowed.
    #[must_use]
    pub const fn supports_deterministic(self) -> bool {
        matches!(self, Self::String | Self::Date | Self::Int | Self::Long | Self::BinData)
    }
}

impl fmt::Display for BsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Double => "double",
            Self::String => "string",
            Self::Object => "object",
            Self::Array => "array",
            Self::BinData => "binData",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Null => "null",
            Self::Int => "int",
            Self::Long => "long",
        };
        f.write_str(name)
    }
}

/// A UTC instant with millisecond precision.
///
/// Construction truncates anything finer, so every date a [`Value`] holds
/// survives encryption unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateMillis(DateTime<Utc>);

impl DateMillis {
    /// Truncates `datetime` to whole milliseconds.
    #[must_use]
    pub fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime.trunc_subsecs(3))
    }

    /// Builds a date from milliseconds since the Unix epoch.
    #[must_use]
    pub fn from_timestamp_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self)
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// The underlying `chrono` value.
    #[must_use]
    pub const fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for DateMillis {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

/// A document field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null
    Null,
    /// Boolean
    Bool(bool),
    /// 32-bit integer
    Int32(i32),
    /// 64-bit integer
    Int64(i64),
    /// 64-bit float
    Double(f64),
    /// UTF-8 string
    String(String),
    /// UTC datetime
    Date(DateMillis),
    /// Opaque binary data
    Binary(Vec<u8>),
    /// Ciphertext produced by the encryption gateway
    Encrypted(EncryptedValue),
    /// Array of values
    Array(Vec<Value>),
    /// Embedded document
    Document(Document),
}

impl Value {
    /// Returns the BSON type of this value. Encrypted values are binary.
    #[must_use]
    pub const fn bson_type(&self) -> BsonType {
        match self {
            Self::Null => BsonType::Null,
            Self::Bool(_) => BsonType::Bool,
            Self::Int32(_) => BsonType::Int,
            Self::Int64(_) => BsonType::Long,
            Self::Double(_) => BsonType::Double,
            Self::String(_) => BsonType::String,
            Self::Date(_) => BsonType::Date,
            Self::Binary(_) | Self::Encrypted(_) => BsonType::BinData,
            Self::Array(_) => BsonType::Array,
            Self::Document(_) => BsonType::Object,
        }
    }

    /// Builds a date value at midnight UTC.
    #[must_use]
    pub fn date_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        Some(Self::Date(date.and_hms_opt(0, 0, 0)?.and_utc().into()))
    }

    /// Returns the encrypted payload, if this is a ciphertext.
    #[must_use]
    pub const fn as_encrypted(&self) -> Option<&EncryptedValue> {
        match self {
            Self::Encrypted(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the embedded document, if any.
    #[must_use]
    pub const fn as_document(&self) -> Option<&Document> {
        match self {
            Self::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// Returns the string, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Renders the value as relaxed extended JSON.
    #[must_use]
    pub fn to_extended_json(&self) -> serde_json::Value {
        use serde_json::json;

        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => json!(b),
            Self::Int32(i) => json!(i),
            Self::Int64(i) => json!({ "$numberLong": i.to_string() }),
            Self::Double(d) => json!(d),
            Self::String(s) => json!(s),
            Self::Date(d) => json!({ "$date": d.as_datetime().to_rfc3339_opts(chrono::SecondsFormat::Millis, true) }),
            Self::Binary(bytes) => {
                json!({ "$binary": { "base64": STANDARD.encode(bytes), "subType": "00" } })
            }
            Self::Encrypted(value) => json!({
                "$binary": { "base64": STANDARD.encode(value.as_bytes()), "subType": ENCRYPTED_SUBTYPE }
            }),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_extended_json).collect())
            }
            Self::Document(doc) => doc.to_extended_json(),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value.into())
    }
}

impl From<DateMillis> for Value {
    fn from(value: DateMillis) -> Self {
        Self::Date(value)
    }
}

impl From<Document> for Value {
    fn from(value: Document) -> Self {
        Self::Document(value)
    }
}

impl From<EncryptedValue> for Value {
    fn from(value: EncryptedValue) -> Self {
        Self::Encrypted(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::Array(value)
    }
}

/// An ordered document. Field order is preserved through every transform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Appends (or replaces) a field, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Sets a field, keeping its position if it already exists.
    ///
    /// Returns the previous value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.fields.push((key, value));
        None
    }

    /// Returns a top-level field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Returns the value at a dotted path, descending through embedded documents.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.get(segments.next()?)?;
        for segment in segments {
            current = current.as_document()?.get(segment)?;
        }
        Some(current)
    }

    /// Iterates fields in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of top-level fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the document has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Renders the document as relaxed extended JSON.
    #[must_use]
    pub fn to_extended_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields.iter().map(|(k, v)| (k.clone(), v.to_extended_json())).collect(),
        )
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut doc = Self::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(&self.to_extended_json()).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_position() {
        let mut doc = Document::new().with("a", 1).with("b", 2).with("c", 3);
        let previous = doc.insert("b", "two");

        assert_eq!(previous, Some(Value::Int32(2)));
        let keys: Vec<&str> = doc.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b", "c"]);
        assert_eq!(doc.get("b"), Some(&Value::from("two")));
    }

    #[test]
    fn test_get_path() {
        let doc = Document::new()
            .with("firstName", "Grace")
            .with("contact", Document::new().with("email", "grace@example.com"));

        assert_eq!(doc.get_path("contact.email"), Some(&Value::from("grace@example.com")));
        assert_eq!(doc.get_path("contact.mobile"), None);
        assert_eq!(doc.get_path("firstName.length"), None);
    }

    #[test]
    fn test_bson_type_byte_round_trip() {
        for ty in [
            BsonType::Double,
            BsonType::String,
            BsonType::Object,
            BsonType::Array,
            BsonType::BinData,
            BsonType::Bool,
            BsonType::Date,
            BsonType::Null,
            BsonType::Int,
            BsonType::Long,
        ] {
            assert_eq!(BsonType::from_u8(ty.as_u8()), Some(ty));
        }
        assert_eq!(BsonType::from_u8(0x7F), None);
    }

    #[test]
    fn test_bson_type_serde_names() {
        let ty: BsonType = serde_json::from_str("\"binData\"").unwrap();
        assert_eq!(ty, BsonType::BinData);
        assert_eq!(serde_json::to_string(&BsonType::Date).unwrap(), "\"date\"");
    }

    #[test]
    fn test_extended_json_date() {
        let value = Value::date_ymd(1989, 12, 13).unwrap();
        assert_eq!(
            value.to_extended_json(),
            serde_json::json!({ "$date": "1989-12-13T00:00:00.000Z" })
        );
    }

    #[test]
    fn test_datetime_truncated_to_millis() {
        let dt = DateTime::from_timestamp(1_000, 123_456_789).unwrap();
        let Value::Date(stored) = Value::from(dt) else { panic!("expected date") };
        assert_eq!(stored.as_datetime().timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(Value::Date(DateMillis::new(dt)), Value::from(dt));
    }

    #[test]
    fn test_date_millis_from_epoch() {
        let date = DateMillis::from_timestamp_millis(-1).unwrap();
        assert_eq!(date.timestamp_millis(), -1);
        assert_eq!(DateMillis::new(date.as_datetime()), date);
    }
}
