//! Column types and the comparison rules shared by the B+-tree and the
//! executors. Values are stored at fixed width in host-native byte
//! order; comparison is type-dispatched, so the encoding never needs to
//! be order-preserving under memcmp.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColType {
    Int,
    BigInt,
    Float,
    String,
    Datetime,
}

impl ColType {
    pub fn name(&self) -> &'static str {
        match self {
            ColType::Int => "INT",
            ColType::BigInt => "BIGINT",
            ColType::Float => "FLOAT",
            ColType::String => "CHAR",
            ColType::Datetime => "DATETIME",
        }
    }
}

/// Compares two encodings of the same type. Strings and datetimes are
/// byte-lexicographic (datetime relies on the canonical 19-byte ASCII
/// form ordering correctly).
pub fn compare_value(a: &[u8], b: &[u8], ty: ColType) -> Ordering {
    match ty {
        ColType::Int => read_i32(a).cmp(&read_i32(b)),
        ColType::BigInt => read_i64(a).cmp(&read_i64(b)),
        ColType::Float => read_f32(a)
            .partial_cmp(&read_f32(b))
            .unwrap_or(Ordering::Equal),
        ColType::String | ColType::Datetime => a.cmp(b),
    }
}

/// Lexicographic comparison across a composite key: column by column,
/// first difference wins.
pub fn compare_keys(a: &[u8], b: &[u8], types: &[ColType], lens: &[usize]) -> Ordering {
    let mut offset = 0;
    for (ty, &len) in types.iter().zip(lens.iter()) {
        let ord = compare_value(&a[offset..offset + len], &b[offset..offset + len], *ty);
        if ord != Ordering::Equal {
            return ord;
        }
        offset += len;
    }
    Ordering::Equal
}

fn read_i32(buf: &[u8]) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[..4]);
    i32::from_ne_bytes(b)
}

fn read_i64(buf: &[u8]) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    i64::from_ne_bytes(b)
}

fn read_f32(buf: &[u8]) -> f32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[..4]);
    f32::from_ne_bytes(b)
}
