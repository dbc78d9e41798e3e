//! Wire and storage encoding for operations.
//!
//! Binary form (bincode, standard config):
//! ```text
//! ┌──────────┬────────────────────────────────────────────┐
//! │ varint n │ n × segment { tag: u8, i64 | String }      │
//! └──────────┴────────────────────────────────────────────┘
//! ```
//! Lengths travel as signed integers so a client sending a negative length
//! gets a precise rejection instead of an opaque decode failure.
//!
//! JSON form (compact): `[5, "abc", -3]` — positive integer = retain,
//! string = insert, negative integer = delete.
//!
//! Decoding normalizes: zero-length segments are dropped and neighbours of
//! the same kind are merged. Only structurally invalid input is rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OtError;
use crate::operation::{Component, Operation};

/// Upper bound for a single decoded frame.
const DECODE_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// Segment as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum WireSegment {
    Retain(i64),
    Insert(String),
    Delete(i64),
}

/// Limits applied while decoding untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    /// Maximum number of raw segments.
    pub max_segments: usize,
    /// Maximum chars inserted by one operation.
    pub max_insert_chars: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_segments: 64 * 1024,
            max_insert_chars: 1024 * 1024,
        }
    }
}

/// Encode an operation to its binary form.
pub fn encode(op: &Operation) -> Result<Vec<u8>, OtError> {
    let mut segments: Vec<WireSegment> = op
        .components()
        .iter()
        .map(|c| match c {
            Component::Retain(n) => WireSegment::Retain(*n as i64),
            Component::Insert(text) => WireSegment::Insert(text.clone()),
            Component::Delete(n) => WireSegment::Delete(*n as i64),
        })
        .collect();
    if segments.is_empty() {
        // Identity on an empty document still carries one segment.
        segments.push(WireSegment::Retain(0));
    }
    bincode::serde::encode_to_vec(&segments, bincode::config::standard())
        .map_err(|e| OtError::Malformed(format!("encode failed: {e}")))
}

/// Decode an operation with default limits.
pub fn decode(bytes: &[u8]) -> Result<Operation, OtError> {
    decode_with_limits(bytes, &CodecLimits::default())
}

/// Decode an operation, enforcing `limits`.
pub fn decode_with_limits(bytes: &[u8], limits: &CodecLimits) -> Result<Operation, OtError> {
    let config = bincode::config::standard().with_limit::<DECODE_LIMIT_BYTES>();
    let (segments, read): (Vec<WireSegment>, usize) =
        bincode::serde::decode_from_slice(bytes, config)
            .map_err(|e| OtError::Malformed(format!("undecodable operation: {e}")))?;
    if read != bytes.len() {
        return Err(OtError::Malformed(format!(
            "{} trailing bytes after operation",
            bytes.len() - read
        )));
    }

    let components = segments
        .into_iter()
        .map(|segment| match segment {
            WireSegment::Retain(n) => checked_len(n, "retain").map(Component::Retain),
            WireSegment::Delete(n) => checked_len(n, "delete").map(Component::Delete),
            WireSegment::Insert(text) => Ok(Component::Insert(text)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    build(components, limits)
}

/// Encode to the compact JSON form.
pub fn to_json(op: &Operation) -> Value {
    Value::Array(
        op.components()
            .iter()
            .map(|c| match c {
                Component::Retain(n) => Value::from(*n as i64),
                Component::Insert(text) => Value::from(text.as_str()),
                Component::Delete(n) => Value::from(-(*n as i64)),
            })
            .collect(),
    )
}

/// Decode the compact JSON form.
pub fn from_json(json: &str) -> Result<Operation, OtError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| OtError::Malformed(format!("invalid JSON: {e}")))?;
    let Value::Array(items) = value else {
        return Err(OtError::Malformed("operation must be a JSON array".into()));
    };

    let components = items
        .into_iter()
        .map(|item| match item {
            Value::String(text) => Ok(Component::Insert(text)),
            Value::Number(n) => match n.as_i64() {
                Some(n) if n >= 0 => Ok(Component::Retain(n as usize)),
                Some(n) => Ok(Component::Delete(n.unsigned_abs() as usize)),
                None => Err(OtError::Malformed(format!("segment {n} is not an integer"))),
            },
            other => Err(OtError::Malformed(format!("unexpected segment {other}"))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    build(components, &CodecLimits::default())
}

fn checked_len(n: i64, kind: &str) -> Result<usize, OtError> {
    usize::try_from(n).map_err(|_| OtError::Malformed(format!("negative {kind} length {n}")))
}

fn build(components: Vec<Component>, limits: &CodecLimits) -> Result<Operation, OtError> {
    if components.is_empty() {
        return Err(OtError::Malformed("operation has no segments".into()));
    }
    if components.len() > limits.max_segments {
        return Err(OtError::Malformed(format!(
            "{} segments exceeds limit of {}",
            components.len(),
            limits.max_segments
        )));
    }

    let raw_len = components.len();
    let op = Operation::from_components(components);
    if op.inserted_len() > limits.max_insert_chars {
        return Err(OtError::Malformed(format!(
            "inserts {} chars, limit is {}",
            op.inserted_len(),
            limits.max_insert_chars
        )));
    }
    if op.components().len() != raw_len {
        log::trace!("normalized operation from {raw_len} to {} segments", op.components().len());
    }
    Ok(op)
}
