//! Key, primary-key, and row-locator types.

use crate::{LatticeError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Primary key: a 64-bit integer identifier attached to every index entry.
///
/// The tree orders entries by `(key, pkey)`, so duplicate user keys are
/// permitted and appear in pkey order.
pub type PKey = i64;

/// Probe sentinel standing in for −∞ in the pkey component.
pub const PKEY_MIN: PKey = i64::MIN;

/// Probe sentinel standing in for +∞ in the pkey component.
pub const PKEY_MAX: PKey = i64::MAX;

/// Opaque row locator resolved by the external table heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowId(pub u32);

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row:{}", self.0)
    }
}

/// Key comparator selected at tree construction.
///
/// The engine stores keys as opaque fixed-size byte strings; this enum
/// decides how two such strings compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    /// 8-byte little-endian signed integer.
    Int64,
    /// 8-byte little-endian IEEE-754 double, ordered by total order.
    Float64,
    /// Raw byte comparison of the full fixed-size key.
    Bytes,
    /// Fixed-size text; trailing spaces and NUL padding are insignificant.
    Text,
}

impl KeyType {
    /// Compares two keys of this type.
    ///
    /// Both slices must be `key_size` bytes; fixed-width variants read
    /// exactly their natural width.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyType::Int64 => decode_i64(a).cmp(&decode_i64(b)),
            KeyType::Float64 => decode_f64(a).total_cmp(&decode_f64(b)),
            KeyType::Bytes => a.cmp(b),
            KeyType::Text => trim_text(a).cmp(trim_text(b)),
        }
    }

    /// The key width this type requires, or None if any width is accepted.
    pub fn natural_size(&self) -> Option<usize> {
        match self {
            KeyType::Int64 | KeyType::Float64 => Some(8),
            KeyType::Bytes | KeyType::Text => None,
        }
    }

    /// Validates a declared key size against this type.
    pub fn check_key_size(&self, key_size: usize) -> Result<()> {
        if key_size == 0 {
            return Err(LatticeError::InvalidConfig(
                "key size must be at least 1 byte".to_string(),
            ));
        }
        if let Some(expected) = self.natural_size() {
            if key_size != expected {
                return Err(LatticeError::KeySizeMismatch {
                    expected,
                    actual: key_size,
                });
            }
        }
        Ok(())
    }
}

/// Compares two composite `(key, pkey)` pairs lexicographically.
pub fn compare_composite(
    key_type: KeyType,
    a_key: &[u8],
    a_pkey: PKey,
    b_key: &[u8],
    b_pkey: PKey,
) -> Ordering {
    key_type.compare(a_key, b_key).then(a_pkey.cmp(&b_pkey))
}

/// Encodes an i64 key in the on-disk byte order.
pub fn encode_i64(value: i64) -> [u8; 8] {
    value.to_le_bytes()
}

/// Encodes an f64 key in the on-disk byte order.
pub fn encode_f64(value: f64) -> [u8; 8] {
    value.to_le_bytes()
}

fn decode_i64(buf: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    i64::from_le_bytes(bytes)
}

fn decode_f64(buf: &[u8]) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    f64::from_le_bytes(bytes)
}

fn trim_text(buf: &[u8]) -> &[u8] {
    let end = buf
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |i| i + 1);
    &buf[..end]
}
