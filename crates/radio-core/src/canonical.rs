//! Canonical JSON encoding used for offer signatures.
//!
//! Signer and verifier must hash the exact same bytes, so the `data` object of
//! an offer is re-encoded with object keys sorted lexicographically (by UTF-8
//! bytes) at every depth and without insignificant whitespace. Scalars use
//! `serde_json`'s own formatting, so strings are escaped identically on both
//! sides.

use crate::error::Result;
use serde::Serialize;
use serde_json::Value;

/// Encode any serializable value into canonical JSON bytes.
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    canonicalize_value(&value)
}

/// Encode an already-parsed JSON value into canonical JSON bytes.
pub fn canonicalize_value(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    write_value(&mut out, value)?;
    Ok(out)
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            out.push(b'{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_value(out, val)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}
