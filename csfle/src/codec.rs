//! Plaintext encoding of values before encryption.
//!
//! The type of the top-level value travels in the ciphertext prefix, so the
//! encoding of a scalar is just its payload:
//!
//! - `string`: UTF-8 bytes
//! - `int` / `long` / `double` / `date`: little-endian (dates as epoch millis)
//! - `bool`: one byte
//! - `binData`: `[subtype:1][bytes]` (subtype 6 marks a nested ciphertext)
//! - `object` / `array`: elements `[type:1][name_len:4][name][len:4][payload]`

use zeroize::Zeroizing;

use crate::ciphertext::EncryptedValue;
use crate::error::Error;
use crate::value::{BsonType, DateMillis, Document, Value};

const SUBTYPE_GENERIC: u8 = 0x00;
const SUBTYPE_ENCRYPTED: u8 = 0x06;

/// Encodes a value's payload. The buffer is wiped on drop.
#[must_use]
pub fn encode_value(value: &Value) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::new());
    write_payload(value, &mut out);
    out
}

/// Decodes a payload of the given type.
///
/// # Errors
///
/// Returns `Error::MalformedCiphertext` if the payload does not decode as `ty`.
pub fn decode_value(ty: BsonType, bytes: &[u8]) -> Result<Value, Error> {
    match ty {
        BsonType::Null => {
            if bytes.is_empty() {
                Ok(Value::Null)
            } else {
                Err(malformed("null with payload"))
            }
        }
        BsonType::Bool => match bytes {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(malformed("bad bool")),
        },
        BsonType::Int => Ok(Value::Int32(i32::from_le_bytes(fixed(bytes)?))),
        BsonType::Long => Ok(Value::Int64(i64::from_le_bytes(fixed(bytes)?))),
        BsonType::Double => Ok(Value::Double(f64::from_le_bytes(fixed(bytes)?))),
        BsonType::Date => {
            let millis = i64::from_le_bytes(fixed(bytes)?);
            DateMillis::from_timestamp_millis(millis)
                .map(Value::Date)
                .ok_or_else(|| malformed("date out of range"))
        }
        BsonType::String => String::from_utf8(bytes.to_vec())
            .map(Value::String)
            .map_err(|_| malformed("string is not UTF-8")),
        BsonType::BinData => match bytes.split_first() {
            Some((&SUBTYPE_ENCRYPTED, rest)) => EncryptedValue::from_bytes(rest).map(Value::Encrypted),
            Some((_, rest)) => Ok(Value::Binary(rest.to_vec())),
            None => Err(malformed("missing binary subtype")),
        },
        BsonType::Object => {
            let mut doc = Document::new();
            for (name, value) in read_elements(bytes)? {
                doc.insert(name, value);
            }
            Ok(Value::Document(doc))
        }
        BsonType::Array => Ok(Value::Array(read_elements(bytes)?.into_iter().map(|(_, v)| v).collect())),
    }
}

fn write_payload(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::Int32(i) => out.extend_from_slice(&i.to_le_bytes()),
        Value::Int64(i) => out.extend_from_slice(&i.to_le_bytes()),
        Value::Double(d) => out.extend_from_slice(&d.to_le_bytes()),
        Value::Date(d) => out.extend_from_slice(&d.timestamp_millis().to_le_bytes()),
        Value::String(s) => out.extend_from_slice(s.as_bytes()),
        Value::Binary(bytes) => {
            out.push(SUBTYPE_GENERIC);
            out.extend_from_slice(bytes);
        }
        Value::Encrypted(encrypted) => {
            out.push(SUBTYPE_ENCRYPTED);
            out.extend_from_slice(encrypted.as_bytes());
        }
        Value::Array(items) => {
            for item in items {
                write_element("", item, out);
            }
        }
        Value::Document(doc) => {
            for (name, item) in doc.iter() {
                write_element(name, item, out);
            }
        }
    }
}

fn write_element(name: &str, value: &Value, out: &mut Vec<u8>) {
    let mut payload = Zeroizing::new(Vec::new());
    write_payload(value, &mut payload);

    out.push(value.bson_type().as_u8());
    write_len(name.len(), out);
    out.extend_from_slice(name.as_bytes());
    write_len(payload.len(), out);
    out.extend_from_slice(&payload);
}

fn write_len(len: usize, out: &mut Vec<u8>) {
    // Field values are bounded far below 4 GiB by any document store.
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(len as u32).to_be_bytes());
}

fn read_elements(data: &[u8]) -> Result<Vec<(String, Value)>, Error> {
    let mut elements = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let ty = BsonType::from_u8(data[pos]).ok_or_else(|| malformed("unknown element type"))?;
        pos += 1;

        let name_len = read_len(data, &mut pos)?;
        let name_bytes = take(data, &mut pos, name_len)?;
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| malformed("element name is not UTF-8"))?;

        let value_len = read_len(data, &mut pos)?;
        let value = decode_value(ty, take(data, &mut pos, value_len)?)?;

        elements.push((name, value));
    }

    Ok(elements)
}

fn read_len(data: &[u8], pos: &mut usize) -> Result<usize, Error> {
    let bytes: [u8; 4] = fixed(take(data, pos, 4)?)?;
    Ok(u32::from_be_bytes(bytes) as usize)
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], Error> {
    let end = pos.checked_add(len).filter(|end| *end <= data.len()).ok_or_else(|| malformed("element truncated"))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], Error> {
    bytes.try_into().map_err(|_| malformed("wrong scalar width"))
}

fn malformed(reason: &str) -> Error {
    Error::MalformedCiphertext(format!("undecodable plaintext: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_vault::KeyId;
    use crate::policy::Algorithm;

    fn round_trip(value: &Value) -> Value {
        let encoded = encode_value(value);
        decode_value(value.bson_type(), &encoded).expect("Failed to decode")
    }

    #[test]
    fn test_scalars() {
        for value in [
            Value::from("901-01-0001"),
            Value::from(""),
            Value::Int32(-42),
            Value::Int64(1 << 40),
            Value::Double(2.5),
            Value::Bool(true),
            Value::date_ymd(1912, 6, 23).unwrap(),
            Value::Binary(vec![0, 1, 2]),
        ] {
            assert_eq!(round_trip(&value), value);
        }
    }

    #[test]
    fn test_string_is_raw_utf8() {
        assert_eq!(&*encode_value(&Value::from("abc")), b"abc");
    }

    #[test]
    fn test_nested_document() {
        let doc = Document::new()
            .with("street", "123 Main Street")
            .with("zip", 90210)
            .with("tags", Value::Array(vec![Value::from("a"), Value::Null]))
            .with("inner", Document::new().with("flag", false));

        assert_eq!(round_trip(&Value::Document(doc.clone())), Value::Document(doc));
    }

    #[test]
    fn test_nested_ciphertext_survives() {
        let inner = EncryptedValue::new(
            Algorithm::Deterministic,
            KeyId::from_bytes([3; KeyId::LEN]),
            BsonType::String,
            &[5; 32],
        );
        let value = Value::Array(vec![Value::Encrypted(inner)]);

        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_truncated_element() {
        let encoded = encode_value(&Value::Document(Document::new().with("a", "value")));
        let result = decode_value(BsonType::Object, &encoded[..encoded.len() - 1]);
        assert!(matches!(result, Err(Error::MalformedCiphertext(_))));
    }

    #[test]
    fn test_wrong_scalar_width() {
        let result = decode_value(BsonType::Long, &[1, 2, 3]);
        assert!(matches!(result, Err(Error::MalformedCiphertext(_))));
    }

    #[test]
    fn test_invalid_utf8() {
        let result = decode_value(BsonType::String, &[0xFF, 0xFE]);
        assert!(matches!(result, Err(Error::MalformedCiphertext(_))));
    }
}
