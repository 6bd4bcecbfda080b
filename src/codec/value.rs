//! Encoding of the dynamic value type.
//!
//! Every value starts with its one-byte [`ValueKind`] tag. Floats travel as
//! their IEEE-754 bit pattern through the integer encoding, so NaN payloads and
//! signed zeros survive. Instances carry their kind id and a length-prefixed
//! payload.

use super::varint::{
    read_bytes, read_len, read_long, read_string, size_bytes, size_long, size_string,
    write_bytes, write_long, write_string,
};
use crate::storage::error::{StoreError, StoreResult};
use crate::value::{Dict, InstanceKind, InstanceRegistry, Value, ValueKind};
use bytes::{Buf, BufMut};

/// Nesting limit applied while decoding untrusted bytes.
pub const MAX_DEPTH: usize = 256;

pub fn encode_value(out: &mut Vec<u8>, value: &Value) {
    out.put_u8(value.kind() as u8);
    match value {
        Value::Integer(i) => write_long(out, *i),
        Value::Float(f) => write_long(out, f.to_bits() as i64),
        Value::String(s) | Value::Symbol(s) | Value::Error(s) => write_string(out, s),
        Value::Objnum(n) => write_long(out, *n),
        Value::List(items) => {
            write_long(out, items.len() as i64);
            for item in items {
                encode_value(out, item);
            }
        }
        Value::Frob(frob) => {
            write_long(out, frob.class);
            encode_value(out, &frob.rep);
        }
        Value::Dict(dict) => {
            write_long(out, dict.len() as i64);
            for (k, v) in dict.iter() {
                encode_value(out, k);
                encode_value(out, v);
            }
        }
        Value::Buffer(bytes) => write_bytes(out, bytes),
        Value::Instance(inst) => {
            write_long(out, inst.kind() as i64);
            write_long(out, inst.get().packed_size() as i64);
            inst.get().pack(out);
        }
    }
}

/// Exact number of bytes [`encode_value`] produces for `value`.
pub fn value_size(value: &Value) -> usize {
    1 + match value {
        Value::Integer(i) => size_long(*i),
        Value::Float(f) => size_long(f.to_bits() as i64),
        Value::String(s) | Value::Symbol(s) | Value::Error(s) => size_string(s),
        Value::Objnum(n) => size_long(*n),
        Value::List(items) => {
            size_long(items.len() as i64) + items.iter().map(value_size).sum::<usize>()
        }
        Value::Frob(frob) => size_long(frob.class) + value_size(&frob.rep),
        Value::Dict(dict) => {
            size_long(dict.len() as i64)
                + dict
                    .iter()
                    .map(|(k, v)| value_size(k) + value_size(v))
                    .sum::<usize>()
        }
        Value::Buffer(bytes) => size_bytes(bytes),
        Value::Instance(inst) => {
            let payload = inst.get().packed_size();
            size_long(inst.kind() as i64) + size_long(payload as i64) + payload
        }
    }
}

pub fn decode_value(buf: &mut impl Buf, registry: &InstanceRegistry) -> StoreResult<Value> {
    decode_nested(buf, registry, 0)
}

fn read_kind(buf: &mut impl Buf) -> StoreResult<ValueKind> {
    if !buf.has_remaining() {
        return Err(StoreError::Corrupt("truncated value tag".to_string()));
    }
    ValueKind::from_u8(buf.get_u8()).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn read_instance_kind(buf: &mut impl Buf) -> StoreResult<InstanceKind> {
    let kind = read_long(buf)?;
    InstanceKind::try_from(kind)
        .map_err(|_| StoreError::Corrupt(format!("invalid instance kind {}", kind)))
}

fn decode_nested(
    buf: &mut impl Buf,
    registry: &InstanceRegistry,
    depth: usize,
) -> StoreResult<Value> {
    if depth > MAX_DEPTH {
        return Err(StoreError::Corrupt("value nesting too deep".to_string()));
    }
    let value = match read_kind(buf)? {
        ValueKind::Integer => Value::Integer(read_long(buf)?),
        ValueKind::Float => Value::Float(f64::from_bits(read_long(buf)? as u64)),
        ValueKind::String => Value::String(read_string(buf)?),
        ValueKind::Objnum => Value::Objnum(read_long(buf)?),
        ValueKind::List => {
            let count = read_len(buf)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_nested(buf, registry, depth + 1)?);
            }
            Value::List(items)
        }
        ValueKind::Symbol => Value::Symbol(read_string(buf)?),
        ValueKind::Error => Value::Error(read_string(buf)?),
        ValueKind::Frob => {
            let class = read_long(buf)?;
            let rep = decode_nested(buf, registry, depth + 1)?;
            Value::frob(class, rep)
        }
        ValueKind::Dict => {
            let count = read_len(buf)?;
            let mut dict = Dict::with_capacity(count);
            for _ in 0..count {
                let key = decode_nested(buf, registry, depth + 1)?;
                let value = decode_nested(buf, registry, depth + 1)?;
                dict.insert(key, value);
            }
            Value::Dict(dict)
        }
        ValueKind::Buffer => Value::Buffer(read_bytes(buf)?),
        ValueKind::Instance => {
            let kind = read_instance_kind(buf)?;
            let payload = read_bytes(buf)?;
            Value::Instance(registry.unpack(kind, &payload)?)
        }
    };
    Ok(value)
}

/// Advance `buf` past one encoded value without building it. Instances of
/// unregistered kinds can be skipped too.
pub fn skip_value(buf: &mut impl Buf) -> StoreResult<()> {
    skip_nested(buf, 0)
}

fn skip_nested(buf: &mut impl Buf, depth: usize) -> StoreResult<()> {
    if depth > MAX_DEPTH {
        return Err(StoreError::Corrupt("value nesting too deep".to_string()));
    }
    match read_kind(buf)? {
        ValueKind::Integer | ValueKind::Float | ValueKind::Objnum => {
            read_long(buf)?;
        }
        ValueKind::String | ValueKind::Symbol | ValueKind::Error | ValueKind::Buffer => {
            let len = read_len(buf)?;
            buf.advance(len);
        }
        ValueKind::List => {
            let count = read_len(buf)?;
            for _ in 0..count {
                skip_nested(buf, depth + 1)?;
            }
        }
        ValueKind::Frob => {
            read_long(buf)?;
            skip_nested(buf, depth + 1)?;
        }
        ValueKind::Dict => {
            let count = read_len(buf)?;
            for _ in 0..count * 2 {
                skip_nested(buf, depth + 1)?;
            }
        }
        ValueKind::Instance => {
            read_instance_kind(buf)?;
            let len = read_len(buf)?;
            buf.advance(len);
        }
    }
    Ok(())
}
