//! Canonical JSON encoding and decoding.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Serializes a value to its canonical JSON text.
///
/// Object keys are emitted in sorted order, no insignificant whitespace is
/// produced, and number formatting is deterministic, so two values serialize
/// identically iff they compare equal. The output is what subscription
/// identity is derived from.
pub fn to_canonical_json(value: &Value) -> CodecResult<String> {
    let mut out = String::new();
    write_value(&mut out, value)?;
    Ok(out)
}

/// Parses JSON text into a [`Value`].
///
/// Object entries are normalized into sorted key order. Numbers that fit an
/// `i64` decode as [`Value::Integer`]; all other numbers decode as
/// [`Value::Float`].
pub fn from_json(text: &str) -> CodecResult<Value> {
    let raw: serde_json::Value = serde_json::from_str(text)?;
    normalize(raw)
}

fn write_value(out: &mut String, value: &Value) -> CodecResult<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Integer(n) => out.push_str(&n.to_string()),
        Value::Float(f) => {
            // serde_json formats via ryu: shortest text that round-trips.
            let number = serde_json::Number::from_f64(*f).ok_or(CodecError::NonFiniteFloat)?;
            out.push_str(&number.to_string());
        }
        Value::String(s) => write_string(out, s)?,
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Map(pairs) => {
            out.push('{');
            for (i, (key, item)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key)?;
                out.push(':');
                write_value(out, item)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_string(out: &mut String, s: &str) -> CodecResult<()> {
    // Includes the surrounding quotes and all required escapes.
    let escaped = serde_json::to_string(s)?;
    out.push_str(&escaped);
    Ok(())
}

fn normalize(raw: serde_json::Value) -> CodecResult<Value> {
    Ok(match raw {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(CodecError::UnsupportedNumber(n.to_string()));
            }
        }
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => {
            let items: CodecResult<Vec<Value>> = items.into_iter().map(normalize).collect();
            Value::Array(items?)
        }
        serde_json::Value::Object(entries) => {
            let pairs: CodecResult<Vec<(String, Value)>> = entries
                .into_iter()
                .map(|(k, v)| Ok((k, normalize(v)?)))
                .collect();
            Value::map(pairs?)
        }
    })
}
