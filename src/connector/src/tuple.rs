// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Memcomparable encoding of scan-key tuples.
//!
//! The unsigned lexicographic order of the encoded bytes matches the
//! element-wise order of the tuples, so encoded keys can be compared, stored
//! in a `BTreeMap`, and persisted as the backfill resume position without
//! ever decoding them. The byte format is internal; only the ordering is
//! contract.

use std::cmp::Ordering;

/// A scalar usable as a scan-key component.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
}

// One tag byte per element. Tags order mixed-type tuples consistently:
// nulls first, then booleans, numbers, byte strings, text.
const TAG_NULL: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_INT: u8 = 0x10;
const TAG_FLOAT: u8 = 0x11;
const TAG_BYTES: u8 = 0x20;
const TAG_TEXT: u8 = 0x21;

// Variable-length elements escape embedded zeros (0x00 -> 0x00 0xFF) and end
// with 0x00 0x01, which sorts below any escaped content byte. The whole
// tuple ends with a single 0x00 so that no encoding is a prefix of another.
const ESCAPE: [u8; 2] = [0x00, 0xFF];
const TERMINATOR: [u8; 2] = [0x00, 0x01];
const TUPLE_END: u8 = 0x00;

/// Encode a tuple so that `encode(x) < encode(y)` iff `x < y` element-wise
/// with the first differing component.
pub fn encode(values: &[KeyValue]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 10 + 1);
    for value in values {
        match value {
            KeyValue::Null => out.push(TAG_NULL),
            KeyValue::Bool(false) => out.push(TAG_FALSE),
            KeyValue::Bool(true) => out.push(TAG_TRUE),
            KeyValue::Int(v) => {
                out.push(TAG_INT);
                // offset binary: flipping the sign bit makes the unsigned
                // byte order match the signed order
                out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
            }
            KeyValue::Float(v) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&total_order_bits(*v).to_be_bytes());
            }
            KeyValue::Bytes(b) => {
                out.push(TAG_BYTES);
                encode_var_len(&mut out, b);
            }
            KeyValue::Text(s) => {
                out.push(TAG_TEXT);
                encode_var_len(&mut out, s.as_bytes());
            }
        }
    }
    out.push(TUPLE_END);
    out
}

fn encode_var_len(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0x00 {
            out.extend_from_slice(&ESCAPE);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&TERMINATOR);
}

// IEEE-754 total order: flip all bits of negative floats, only the sign bit
// of non-negative ones. -NaN sorts below everything, NaN above.
fn total_order_bits(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

/// Decodes an encoded tuple back into its components, e.g. to rebind a
/// persisted resume key as query parameters.
pub fn decode(mut bytes: &[u8]) -> Result<Vec<KeyValue>, String> {
    let mut values = Vec::new();
    loop {
        let (&tag, rest) = bytes.split_first().ok_or("unterminated tuple")?;
        bytes = rest;
        match tag {
            TUPLE_END if bytes.is_empty() => return Ok(values),
            TUPLE_END => return Err("trailing bytes after tuple end".into()),
            TAG_NULL => values.push(KeyValue::Null),
            TAG_FALSE => values.push(KeyValue::Bool(false)),
            TAG_TRUE => values.push(KeyValue::Bool(true)),
            TAG_INT => {
                let (raw, rest) = split_array(bytes)?;
                values.push(KeyValue::Int(
                    (u64::from_be_bytes(raw) ^ (1 << 63)) as i64,
                ));
                bytes = rest;
            }
            TAG_FLOAT => {
                let (raw, rest) = split_array(bytes)?;
                values.push(KeyValue::Float(from_total_order_bits(u64::from_be_bytes(
                    raw,
                ))));
                bytes = rest;
            }
            TAG_BYTES => {
                let (raw, rest) = decode_var_len(bytes)?;
                values.push(KeyValue::Bytes(raw));
                bytes = rest;
            }
            TAG_TEXT => {
                let (raw, rest) = decode_var_len(bytes)?;
                values.push(KeyValue::Text(
                    String::from_utf8(raw).map_err(|e| e.to_string())?,
                ));
                bytes = rest;
            }
            other => return Err(format!("unknown tuple tag 0x{other:02X}")),
        }
    }
}

fn split_array(bytes: &[u8]) -> Result<([u8; 8], &[u8]), String> {
    if bytes.len() < 8 {
        return Err("truncated tuple element".into());
    }
    let (raw, rest) = bytes.split_at(8);
    Ok((raw.try_into().unwrap(), rest))
}

fn decode_var_len(mut bytes: &[u8]) -> Result<(Vec<u8>, &[u8]), String> {
    let mut out = Vec::new();
    loop {
        match bytes {
            [0x00, 0x01, rest @ ..] => return Ok((out, rest)),
            [0x00, 0xFF, rest @ ..] => {
                out.push(0x00);
                bytes = rest;
            }
            [0x00, ..] | [] => return Err("unterminated tuple element".into()),
            [b, rest @ ..] => {
                out.push(*b);
                bytes = rest;
            }
        }
    }
}

fn from_total_order_bits(bits: u64) -> f64 {
    if bits >> 63 == 1 {
        f64::from_bits(bits & !(1 << 63))
    } else {
        f64::from_bits(!bits)
    }
}

/// Element-wise comparison mirroring the encoded-byte order, used by tests
/// and by callers that still hold decoded tuples.
pub fn compare(a: &[KeyValue], b: &[KeyValue]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = compare_one(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn rank(v: &KeyValue) -> u8 {
    match v {
        KeyValue::Null => TAG_NULL,
        KeyValue::Bool(false) => TAG_FALSE,
        KeyValue::Bool(true) => TAG_TRUE,
        KeyValue::Int(_) => TAG_INT,
        KeyValue::Float(_) => TAG_FLOAT,
        KeyValue::Bytes(_) => TAG_BYTES,
        KeyValue::Text(_) => TAG_TEXT,
    }
}

fn compare_one(a: &KeyValue, b: &KeyValue) -> Ordering {
    match (a, b) {
        (KeyValue::Int(x), KeyValue::Int(y)) => x.cmp(y),
        (KeyValue::Float(x), KeyValue::Float(y)) => {
            total_order_bits(*x).cmp(&total_order_bits(*y))
        }
        (KeyValue::Bytes(x), KeyValue::Bytes(y)) => x.cmp(y),
        (KeyValue::Text(x), KeyValue::Text(y)) => x.as_bytes().cmp(y.as_bytes()),
        _ => rank(a).cmp(&rank(b)),
    }
}
