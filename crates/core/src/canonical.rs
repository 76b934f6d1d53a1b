//! Canonical byte encoding for signed and tagged payloads.
//!
//! Every producer and consumer of signature or HMAC input goes through this
//! module. The encoding is compact JSON with:
//!
//! - object keys sorted by their UTF-8 bytes
//! - no insignificant whitespace
//! - null-valued object members dropped (recursively)
//! - integral floating point values written as integers (`2.0` -> `2`)
//! - non-integral numbers in shortest round-trip form (`1.50` -> `1.5`)
//!
//! Array elements are never dropped, a `null` inside an array stays `null`.

use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::error::{CoreError, Result};

/// Largest magnitude at which an integral float is still written as an integer.
const MAX_INTEGRAL_FLOAT: f64 = 1e15;

/// Canonical bytes of an ordered field mapping.
pub fn canonicalize(fields: &Map<String, Value>) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_object(&mut out, fields);
    out
}

/// Canonical bytes of an arbitrary JSON value.
pub fn canonicalize_value(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_value(&mut out, value);
    out
}

/// Canonical bytes of any serializable structure.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value =
        serde_json::to_value(value).map_err(|e| CoreError::Canonicalization(e.to_string()))?;
    Ok(canonicalize_value(&value))
}

/// Canonicalize, then parse the canonical bytes back into a value.
///
/// The result is the normal form of `value`: nulls removed from objects and
/// integral floats turned into integers.
pub fn canonicalize_then_parse(value: &Value) -> Result<Value> {
    let bytes = canonicalize_value(value);
    serde_json::from_slice(&bytes).map_err(|e| CoreError::Canonicalization(e.to_string()))
}

/// Canonical text form, used as the wire encoding.
pub fn to_canonical_string(fields: &Map<String, Value>) -> String {
    // The encoder only emits valid UTF-8: escaped ASCII plus verbatim string contents.
    String::from_utf8_lossy(&canonicalize(fields)).into_owned()
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item);
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(out, map),
    }
}

fn write_object(out: &mut Vec<u8>, map: &Map<String, Value>) {
    let mut entries: Vec<(&String, &Value)> = map.iter().filter(|(_, v)| !v.is_null()).collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    out.push(b'{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        write_string(out, key);
        out.push(b':');
        write_value(out, value);
    }
    out.push(b'}');
}

fn write_number(out: &mut Vec<u8>, n: &Number) {
    if let Some(i) = n.as_i64() {
        out.extend_from_slice(i.to_string().as_bytes());
    } else if let Some(u) = n.as_u64() {
        out.extend_from_slice(u.to_string().as_bytes());
    } else if let Some(f) = n.as_f64() {
        if f.fract() == 0.0 && f.abs() < MAX_INTEGRAL_FLOAT {
            out.extend_from_slice((f as i64).to_string().as_bytes());
        } else {
            out.extend_from_slice(n.to_string().as_bytes());
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.push(b'"');
    for ch in s.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            '\u{08}' => out.extend_from_slice(b"\\b"),
            '\u{0c}' => out.extend_from_slice(b"\\f"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}
