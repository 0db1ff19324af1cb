//! # Ripple Codec
//!
//! Value model and canonical JSON encoding for ripple.
//!
//! This crate provides deterministic JSON encoding that ensures:
//! - Identical values produce identical text
//! - Map keys are always sorted
//! - Stable subscription identity
//!
//! The sync protocol deduplicates subscriptions by the canonical
//! serialization of their function path and arguments, so the encoding here
//! must be a pure function of the value.
//!
//! ## Canonical JSON Rules
//!
//! - Object keys are sorted (plain string ordering)
//! - No insignificant whitespace
//! - Integers and floats keep their distinct representations
//! - Non-finite floats are rejected
//!
//! ## Usage
//!
//! ```
//! use ripple_codec::{from_json, to_canonical_json, Value};
//!
//! let value = Value::map(vec![
//!     ("b".to_string(), Value::Integer(2)),
//!     ("a".to_string(), Value::Integer(1)),
//! ]);
//!
//! let text = to_canonical_json(&value).unwrap();
//! assert_eq!(text, r#"{"a":1,"b":2}"#);
//!
//! let decoded = from_json(&text).unwrap();
//! assert_eq!(decoded, value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod canonical;
mod error;
mod serde_impl;
mod value;

pub use canonical::{from_json, to_canonical_json};
pub use error::{CodecError, CodecResult};
pub use value::Value;
